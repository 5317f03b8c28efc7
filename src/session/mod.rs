//! Real-time voice session orchestration
//!
//! [`SessionController`] owns the lifecycle of one conversation: it acquires
//! capture, negotiates the peer transport, funnels inbound protocol events
//! into the [`ConversationMachine`] in strict arrival order, and executes
//! the resulting side effects (outbound messages, tool dispatch, feedback
//! cues).

pub mod events;
pub mod machine;
pub mod transcript;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

use crate::audio::{AudioCapture, RemoteAudioSink};
use crate::config::Config;
use crate::feedback::{Cue, FeedbackEmitter};
use crate::tools::ToolDispatcher;
use crate::transport::{TransportNegotiator, spawn_microphone_pump};
use crate::{Error, Result};

pub use events::{ClientEvent, ServerEvent};
pub use machine::{Action, ConversationMachine, PendingToolCall, SessionState};
pub use transcript::{Role, TranscriptMessage};

/// Events fed into the session event loop by the transport layer
#[derive(Debug)]
pub enum EngineEvent {
    /// The event channel opened — the session is live
    ChannelOpen,
    /// Raw inbound event-channel message
    Message(String),
}

/// Live resources of one conversation.
///
/// Exclusively owned by the controller. Populated progressively during
/// negotiation so a failure at any step can still release everything that
/// exists; [`PeerSession::teardown`] releases every populated handle even
/// when individual releases fail.
#[derive(Default)]
pub struct PeerSession {
    /// Microphone capture handle
    pub capture: Option<AudioCapture>,
    /// Peer transport
    pub transport: Option<Arc<RTCPeerConnection>>,
    /// Bidirectional protocol event channel
    pub channel: Option<Arc<RTCDataChannel>>,
    /// Remote audio sink
    pub sink: Option<RemoteAudioSink>,
    /// Microphone encode pump task
    pub mic_pump: Option<tokio::task::JoinHandle<()>>,
}

impl PeerSession {
    /// Whether no resources are held
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.capture.is_none()
            && self.transport.is_none()
            && self.channel.is_none()
            && self.sink.is_none()
            && self.mic_pump.is_none()
    }

    /// Release every populated handle. Individual failures are logged and
    /// never stop the remaining releases.
    pub async fn teardown(&mut self) {
        if let Some(pump) = self.mic_pump.take() {
            pump.abort();
        }
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                tracing::warn!(error = %e, "event channel close failed");
            }
        }
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!(error = %e, "transport close failed");
            }
        }
        if let Some(mut sink) = self.sink.take() {
            sink.stop();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
    }
}

/// Session lifecycle as tracked by the process-wide registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// No session
    None,
    /// Negotiation in flight
    Negotiating,
    /// Session live
    Active,
}

const LIFECYCLE_MASK: u64 = 0b11;
const LIFECYCLE_NONE: u64 = 0;
const LIFECYCLE_NEGOTIATING: u64 = 1;
const LIFECYCLE_ACTIVE: u64 = 2;
const EPOCH_SHIFT: u32 = 2;

/// Claim ticket for one negotiation attempt.
///
/// Handed out by [`SessionRegistry::try_begin`] and presented on every later
/// transition, so a canceled attempt's late `activate`/`release` bounces off
/// instead of consuming a newer session's claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionToken(u64);

/// Process-wide guard serializing `start()` invocations.
///
/// A single atomic word packs an epoch counter next to the lifecycle bits.
/// The check-and-set happens before any suspension point, so two rapid
/// `start()` calls can never both begin negotiating, and every claim is
/// tagged with the epoch it was issued under.
#[derive(Debug, Default)]
pub struct SessionRegistry(AtomicU64);

impl SessionRegistry {
    /// Claim the none → negotiating transition under a fresh epoch. Returns
    /// `None` when a session is already negotiating or active.
    pub fn try_begin(&self) -> Option<SessionToken> {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            if current & LIFECYCLE_MASK != LIFECYCLE_NONE {
                return None;
            }
            let epoch = (current >> EPOCH_SHIFT) + 1;
            let next = (epoch << EPOCH_SHIFT) | LIFECYCLE_NEGOTIATING;
            match self
                .0
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Some(SessionToken(epoch)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Negotiating → active for the claim `token` was issued under. Returns
    /// false when `stop()` cleared the claim mid-negotiation or a newer
    /// session holds the registry.
    pub fn activate(&self, token: SessionToken) -> bool {
        let negotiating = (token.0 << EPOCH_SHIFT) | LIFECYCLE_NEGOTIATING;
        let active = (token.0 << EPOCH_SHIFT) | LIFECYCLE_ACTIVE;
        self.0
            .compare_exchange(negotiating, active, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Clear the claim held by `token`. Returns false when the claim is no
    /// longer this attempt's to release.
    pub fn release(&self, token: SessionToken) -> bool {
        let cleared = (token.0 << EPOCH_SHIFT) | LIFECYCLE_NONE;
        for lifecycle in [LIFECYCLE_NEGOTIATING, LIFECYCLE_ACTIVE] {
            let held = (token.0 << EPOCH_SHIFT) | lifecycle;
            if self
                .0
                .compare_exchange(held, cleared, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Unconditional reset to none, keeping the epoch. Returns true when a
    /// session was negotiating or active.
    pub fn clear(&self) -> bool {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            if current & LIFECYCLE_MASK == LIFECYCLE_NONE {
                return false;
            }
            let next = current & !LIFECYCLE_MASK;
            match self
                .0
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether `token`'s claim is the live active session
    #[must_use]
    pub fn is_active(&self, token: SessionToken) -> bool {
        self.0.load(Ordering::SeqCst) == (token.0 << EPOCH_SHIFT) | LIFECYCLE_ACTIVE
    }

    /// Current lifecycle
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        match self.0.load(Ordering::SeqCst) & LIFECYCLE_MASK {
            LIFECYCLE_NEGOTIATING => Lifecycle::Negotiating,
            LIFECYCLE_ACTIVE => Lifecycle::Active,
            _ => Lifecycle::None,
        }
    }
}

/// The conversation session controller
pub struct SessionController {
    config: Arc<Config>,
    machine: Mutex<ConversationMachine>,
    peer: Mutex<PeerSession>,
    registry: SessionRegistry,
    negotiator: TransportNegotiator,
    tools: ToolDispatcher,
    feedback: Arc<dyn FeedbackEmitter>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionController {
    /// Create a controller in `Idle`
    #[must_use]
    pub fn new(config: Config, feedback: Arc<dyn FeedbackEmitter>) -> Arc<Self> {
        let config = Arc::new(config);
        let machine = ConversationMachine::new(
            config.wake_phrases.clone(),
            config.greeting_instructions.clone(),
        );
        let (state_tx, _) = watch::channel(SessionState::Idle);

        Arc::new(Self {
            negotiator: TransportNegotiator::new(Arc::clone(&config)),
            tools: ToolDispatcher::new(&config.api_base),
            machine: Mutex::new(machine),
            peer: Mutex::new(PeerSession::default()),
            registry: SessionRegistry::default(),
            feedback,
            state_tx,
            config,
        })
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state changes (for renderers and cue players)
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of the transcript so far
    #[must_use]
    pub fn transcript(&self) -> Vec<TranscriptMessage> {
        self.machine().transcript().to_vec()
    }

    /// Start a session: acquire capture, negotiate the transport, and run
    /// the event loop.
    ///
    /// Idempotent: while a session is negotiating or active, further calls
    /// are silent no-ops (the hosting UI may re-invoke initialization
    /// during its own lifecycle). Resources are staged locally during
    /// negotiation; only the attempt that still holds its registry claim
    /// installs them as the live session.
    ///
    /// # Errors
    ///
    /// Returns the negotiation error after releasing everything this
    /// attempt staged; state is back at `Idle` and the user can retry.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let Some(token) = self.registry.try_begin() else {
            tracing::debug!("session already negotiating or active, start ignored");
            return Ok(());
        };

        self.machine().on_negotiation_started();
        self.publish_state();
        tracing::info!("starting voice session");

        let staging = Mutex::new(PeerSession::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match self.negotiate(&staging, events_tx).await {
            Ok(()) => {
                // Activation and install happen under the peer lock so a
                // concurrent stop() either refuses the activation or tears
                // down the installed resources, never neither.
                let installed = {
                    let mut peer = self.peer_lock();
                    if self.registry.activate(token) {
                        *peer = std::mem::take(&mut *lock_peer(&staging));
                        true
                    } else {
                        false
                    }
                };
                if installed {
                    let controller = Arc::clone(&self);
                    tokio::spawn(async move { controller.event_loop(token, events_rx).await });
                } else {
                    // stop() or a newer start() took over mid-negotiation
                    discard_staging(staging).await;
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "negotiation failed, releasing resources");
                discard_staging(staging).await;
                // Only the holder of the claim resets shared state; if a
                // stop() already took it, that reset has happened.
                if self.registry.release(token) {
                    let actions = self.machine().on_negotiation_failed();
                    self.publish_state();
                    for action in actions {
                        if let Action::Cue(cue) = action {
                            self.feedback.cue(cue);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Stop the session from any state: unconditional teardown of every
    /// owned resource, return to `Idle`. No graceful drain of in-flight
    /// audio.
    pub async fn stop(&self) {
        let was_live = self.registry.clear();
        self.release_resources().await;
        self.machine().reset();
        self.publish_state();
        if was_live {
            self.feedback.cue(Cue::SessionEnded);
            tracing::info!("session stopped");
        }
    }

    /// Acquire capture and run the signaling handshake, populating the
    /// staged [`PeerSession`] step by step.
    async fn negotiate(
        &self,
        staging: &Mutex<PeerSession>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<()> {
        let far_end_active = Arc::new(AtomicBool::new(false));

        let mut capture = AudioCapture::open(&self.config.capture, Arc::clone(&far_end_active))?;
        let frames = capture
            .take_frames()
            .ok_or_else(|| Error::Audio("capture frames already taken".to_string()))?;
        lock_peer(staging).capture = Some(capture);

        let mic_track = self
            .negotiator
            .connect(staging, events, far_end_active)
            .await?;

        lock_peer(staging).mic_pump = Some(spawn_microphone_pump(frames, mic_track));
        Ok(())
    }

    /// Consume engine events in strict arrival order
    async fn event_loop(
        self: Arc<Self>,
        token: SessionToken,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if !self.registry.is_active(token) {
                break;
            }
            // Processing errors are isolated: log, cue, keep the session
            // and its current state untouched.
            if let Err(e) = self.process(event).await {
                tracing::warn!(error = %e, "error processing inbound event");
                self.feedback.cue(Cue::Error);
            }
        }
        tracing::debug!("session event loop ended");
    }

    async fn process(&self, event: EngineEvent) -> Result<()> {
        let actions = match event {
            EngineEvent::ChannelOpen => {
                tracing::debug!("event channel open");
                self.machine().on_channel_open()
            }
            EngineEvent::Message(raw) => {
                let parsed = ServerEvent::parse(&raw)?;
                self.machine().on_server_event(parsed)
            }
        };
        self.publish_state();
        self.run_actions(actions).await
    }

    async fn run_actions(&self, actions: Vec<Action>) -> Result<()> {
        for action in actions {
            match action {
                Action::Send(event) => self.send_event(&event).await?,
                Action::Cue(cue) => self.feedback.cue(cue),
                Action::DispatchTool(call) => {
                    // Awaited inline: later inbound messages queue behind
                    // the in-flight call, preserving arrival order.
                    let output = self.tools.dispatch(&call).await;
                    let follow = self.machine().on_tool_result(&call.call_id, &output);
                    self.publish_state();
                    for action in follow {
                        match action {
                            Action::Send(event) => self.send_event(&event).await?,
                            Action::Cue(cue) => self.feedback.cue(cue),
                            Action::DispatchTool(call) => {
                                tracing::warn!(call_id = %call.call_id, "nested tool dispatch ignored");
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Send a protocol message over the event channel
    async fn send_event(&self, event: &ClientEvent) -> Result<()> {
        let channel = self.peer_lock().channel.clone().ok_or(Error::ChannelClosed)?;
        channel.send_text(event.to_json()?).await?;
        Ok(())
    }

    async fn release_resources(&self) {
        let mut peer = std::mem::take(&mut *self.peer_lock());
        peer.teardown().await;
    }

    fn publish_state(&self) {
        let state = self.machine().state();
        self.state_tx.send_replace(state);
    }

    fn machine(&self) -> MutexGuard<'_, ConversationMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peer_lock(&self) -> MutexGuard<'_, PeerSession> {
        lock_peer(&self.peer)
    }
}

/// Tear down everything a negotiation attempt staged without touching the
/// installed session.
async fn discard_staging(staging: Mutex<PeerSession>) {
    let mut peer = staging.into_inner().unwrap_or_else(PoisonError::into_inner);
    peer.teardown().await;
}

fn lock_peer(peer: &Mutex<PeerSession>) -> MutexGuard<'_, PeerSession> {
    peer.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::LogFeedback;

    #[test]
    fn registry_serializes_start() {
        let registry = SessionRegistry::default();
        assert_eq!(registry.lifecycle(), Lifecycle::None);

        let token = registry.try_begin().unwrap();
        assert_eq!(registry.lifecycle(), Lifecycle::Negotiating);

        // Second start while negotiating is refused
        assert!(registry.try_begin().is_none());

        assert!(registry.activate(token));
        assert_eq!(registry.lifecycle(), Lifecycle::Active);
        assert!(registry.is_active(token));
        assert!(registry.try_begin().is_none());

        assert!(registry.clear());
        assert_eq!(registry.lifecycle(), Lifecycle::None);
        assert!(!registry.is_active(token));
        assert!(!registry.clear());
    }

    #[test]
    fn stop_mid_negotiation_wins_over_activate() {
        let registry = SessionRegistry::default();
        let token = registry.try_begin().unwrap();
        assert!(registry.clear());
        // Negotiation finishing late cannot resurrect the session
        assert!(!registry.activate(token));
        assert_eq!(registry.lifecycle(), Lifecycle::None);
    }

    #[test]
    fn canceled_attempt_cannot_consume_a_newer_claim() {
        let registry = SessionRegistry::default();
        let first = registry.try_begin().unwrap();
        assert!(registry.clear());

        let second = registry.try_begin().unwrap();
        // The canceled attempt's late transitions bounce off the new claim
        assert!(!registry.activate(first));
        assert!(!registry.release(first));
        assert_eq!(registry.lifecycle(), Lifecycle::Negotiating);

        // The new claim is untouched and proceeds normally
        assert!(registry.activate(second));
        assert!(registry.is_active(second));
        assert!(registry.release(second));
        assert_eq!(registry.lifecycle(), Lifecycle::None);
    }

    #[test]
    fn release_clears_a_failed_negotiation() {
        let registry = SessionRegistry::default();
        let token = registry.try_begin().unwrap();
        assert!(registry.release(token));
        assert_eq!(registry.lifecycle(), Lifecycle::None);
        // Releasing again is a no-op
        assert!(!registry.release(token));
    }

    #[test]
    fn empty_peer_session_holds_nothing() {
        let peer = PeerSession::default();
        assert!(peer.is_empty());
    }

    #[tokio::test]
    async fn teardown_of_empty_session_is_safe() {
        let mut peer = PeerSession::default();
        peer.teardown().await;
        assert!(peer.is_empty());
    }

    #[tokio::test]
    async fn stop_from_idle_is_a_quiet_no_op() {
        let controller = SessionController::new(Config::default(), Arc::new(LogFeedback));
        controller.stop().await;
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(controller.peer_lock().is_empty());
        assert!(controller.transcript().is_empty());
    }

    #[tokio::test]
    async fn subscribe_sees_initial_idle() {
        let controller = SessionController::new(Config::default(), Arc::new(LogFeedback));
        let rx = controller.subscribe();
        assert_eq!(*rx.borrow(), SessionState::Idle);
    }
}
