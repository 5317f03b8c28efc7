//! Conversation state machine
//!
//! The pure transition core of the session: inbound protocol events go in,
//! a new state plus a list of side-effect actions come out. No transport,
//! audio, or network plumbing lives here, which keeps the full transition
//! table testable in isolation.

use crate::feedback::Cue;
use crate::session::events::{ClientEvent, ServerEvent};
use crate::session::transcript::{Role, TranscriptLog, TranscriptMessage};

/// Lifecycle state of the single conversation session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; resources released
    Idle,
    /// Capture/transport negotiation in flight
    Negotiating,
    /// Waiting for the user to speak
    Listening,
    /// A tool call is being dispatched
    Thinking,
    /// The assistant is speaking
    Speaking,
}

/// Ephemeral correlation record for an assistant-requested tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingToolCall {
    /// Correlation id the result must carry
    pub call_id: String,
    /// Tool name
    pub name: String,
    /// Arguments as a JSON string
    pub arguments: String,
}

/// Side effects the controller must execute after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a protocol message over the event channel
    Send(ClientEvent),
    /// Dispatch a tool call and feed the result back in
    DispatchTool(PendingToolCall),
    /// Signal a feedback cue (earcon synthesis is external)
    Cue(Cue),
}

/// The conversation state machine.
///
/// Owns the state, the barge-in flag, the pending tool call, and the
/// transcript log. All mutation goes through the `on_*` entry points;
/// transitions are applied strictly in call order.
#[derive(Debug)]
pub struct ConversationMachine {
    state: SessionState,
    barge_in: bool,
    pending_call: Option<PendingToolCall>,
    wake_phrases: Vec<String>,
    greeting_instructions: String,
    transcript: TranscriptLog,
}

impl ConversationMachine {
    /// Create a machine in `Idle` with the given wake phrases (lowercase)
    /// and greeting instructions.
    #[must_use]
    pub fn new(wake_phrases: Vec<String>, greeting_instructions: String) -> Self {
        Self {
            state: SessionState::Idle,
            barge_in: false,
            pending_call: None,
            wake_phrases,
            greeting_instructions,
            transcript: TranscriptLog::new(),
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the barge-in flag is set
    #[must_use]
    pub const fn barge_in(&self) -> bool {
        self.barge_in
    }

    /// The pending tool call, if one is outstanding
    #[must_use]
    pub const fn pending_call(&self) -> Option<&PendingToolCall> {
        self.pending_call.as_ref()
    }

    /// Transcript entries recorded so far
    #[must_use]
    pub fn transcript(&self) -> &[TranscriptMessage] {
        self.transcript.entries()
    }

    /// `start()` accepted — negotiation began
    pub fn on_negotiation_started(&mut self) {
        self.state = SessionState::Negotiating;
    }

    /// Negotiation failed; resources were released by the controller
    pub fn on_negotiation_failed(&mut self) -> Vec<Action> {
        self.reset();
        vec![Action::Cue(Cue::Error)]
    }

    /// Event channel opened — the session is live
    pub fn on_channel_open(&mut self) -> Vec<Action> {
        self.state = SessionState::Listening;
        vec![
            Action::Send(ClientEvent::response_with_instructions(
                &self.greeting_instructions,
            )),
            Action::Cue(Cue::SessionStarted),
        ]
    }

    /// Apply one inbound protocol event in arrival order
    pub fn on_server_event(&mut self, event: ServerEvent) -> Vec<Action> {
        match event {
            ServerEvent::AudioDelta | ServerEvent::OutputAudioStarted => {
                self.on_assistant_audio_started()
            }
            ServerEvent::OutputAudioStopped | ServerEvent::ResponseDone => {
                self.on_assistant_turn_done()
            }
            ServerEvent::SpeechStarted => self.on_user_speech_started(),
            ServerEvent::InputTranscriptCompleted { transcript } => {
                self.on_user_transcript(&transcript)
            }
            ServerEvent::ResponseTranscriptDone { transcript } => {
                self.transcript.push(Role::Assistant, &transcript);
                Vec::new()
            }
            ServerEvent::FunctionCallArgumentsDone {
                name,
                call_id,
                arguments,
            } => self.on_tool_call_requested(name, call_id, arguments),
            ServerEvent::Other => Vec::new(),
        }
    }

    /// Tool result (or failure payload) returned for the outstanding call
    pub fn on_tool_result(&mut self, call_id: &str, output: &str) -> Vec<Action> {
        let Some(pending) = self.pending_call.take() else {
            tracing::warn!(call_id, "tool result with no outstanding call");
            return Vec::new();
        };
        if pending.call_id != call_id {
            tracing::warn!(
                expected = %pending.call_id,
                got = call_id,
                "tool result correlation mismatch"
            );
            return Vec::new();
        }

        self.state = SessionState::Listening;
        vec![
            Action::Send(ClientEvent::function_call_output(call_id, output)),
            Action::Send(ClientEvent::response_create()),
        ]
    }

    /// `stop()` — unconditional return to idle; resource release is the
    /// controller's job.
    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.barge_in = false;
        self.pending_call = None;
        self.transcript.clear();
    }

    fn on_assistant_audio_started(&mut self) -> Vec<Action> {
        if matches!(self.state, SessionState::Listening | SessionState::Speaking) {
            self.state = SessionState::Speaking;
        }
        Vec::new()
    }

    fn on_assistant_turn_done(&mut self) -> Vec<Action> {
        if matches!(self.state, SessionState::Listening | SessionState::Speaking) {
            self.state = SessionState::Listening;
        }
        self.barge_in = false;
        Vec::new()
    }

    fn on_user_speech_started(&mut self) -> Vec<Action> {
        match self.state {
            SessionState::Speaking => {
                // User talking over the assistant: arm barge-in, gate the
                // actual interruption on the wake phrase in the transcript.
                self.barge_in = true;
                tracing::debug!("user speech during assistant turn, barge-in armed");
            }
            SessionState::Listening => {
                tracing::trace!("user speech started");
            }
            _ => {}
        }
        Vec::new()
    }

    fn on_user_transcript(&mut self, transcript: &str) -> Vec<Action> {
        self.transcript.push(Role::User, transcript);

        if !self.barge_in {
            return Vec::new();
        }
        self.barge_in = false;

        if self.matches_wake_phrase(transcript) {
            tracing::info!(transcript, "wake phrase matched, canceling response");
            self.state = SessionState::Listening;
            vec![
                Action::Send(ClientEvent::ResponseCancel),
                Action::Cue(Cue::BargeIn),
            ]
        } else {
            tracing::debug!(transcript, "no wake phrase, assistant keeps the turn");
            Vec::new()
        }
    }

    fn on_tool_call_requested(
        &mut self,
        name: String,
        call_id: String,
        arguments: String,
    ) -> Vec<Action> {
        if self.state == SessionState::Idle {
            tracing::warn!(name, "tool call while idle, ignoring");
            return Vec::new();
        }
        if let Some(pending) = &self.pending_call {
            // One outstanding call at a time; a second request is rejected
            // rather than queued.
            tracing::warn!(
                pending = %pending.call_id,
                rejected = %call_id,
                "tool call while another is outstanding, rejecting"
            );
            return Vec::new();
        }

        let call = PendingToolCall {
            call_id,
            name,
            arguments,
        };
        self.pending_call = Some(call.clone());
        self.state = SessionState::Thinking;
        vec![Action::DispatchTool(call), Action::Cue(Cue::Thinking)]
    }

    /// Case-insensitive substring match against the accepted variants
    fn matches_wake_phrase(&self, transcript: &str) -> bool {
        let normalized = transcript.to_lowercase();
        self.wake_phrases.iter().any(|p| normalized.contains(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ConversationMachine {
        ConversationMachine::new(
            vec!["hey bot".to_string(), "a bot".to_string()],
            "Say hi".to_string(),
        )
    }

    fn live_machine() -> ConversationMachine {
        let mut m = machine();
        m.on_negotiation_started();
        m.on_channel_open();
        m
    }

    #[test]
    fn channel_open_sends_greeting() {
        let mut m = machine();
        m.on_negotiation_started();
        assert_eq!(m.state(), SessionState::Negotiating);

        let actions = m.on_channel_open();
        assert_eq!(m.state(), SessionState::Listening);
        assert!(matches!(
            &actions[0],
            Action::Send(ClientEvent::ResponseCreate { response: Some(r) })
                if r.instructions.as_deref() == Some("Say hi")
        ));
    }

    #[test]
    fn audio_delta_moves_to_speaking() {
        let mut m = live_machine();
        m.on_server_event(ServerEvent::AudioDelta);
        assert_eq!(m.state(), SessionState::Speaking);

        // Further deltas keep it there
        m.on_server_event(ServerEvent::OutputAudioStarted);
        assert_eq!(m.state(), SessionState::Speaking);
    }

    #[test]
    fn turn_done_returns_to_listening_and_clears_flag() {
        let mut m = live_machine();
        m.on_server_event(ServerEvent::AudioDelta);
        m.on_server_event(ServerEvent::SpeechStarted);
        assert!(m.barge_in());

        m.on_server_event(ServerEvent::ResponseDone);
        assert_eq!(m.state(), SessionState::Listening);
        assert!(!m.barge_in());
    }

    #[test]
    fn speech_while_listening_is_informational() {
        let mut m = live_machine();
        m.on_server_event(ServerEvent::SpeechStarted);
        assert_eq!(m.state(), SessionState::Listening);
        assert!(!m.barge_in());
    }

    #[test]
    fn wake_phrase_cancels_response() {
        let mut m = live_machine();
        m.on_server_event(ServerEvent::AudioDelta);
        m.on_server_event(ServerEvent::SpeechStarted);

        let actions = m.on_server_event(ServerEvent::InputTranscriptCompleted {
            transcript: "HEY BOT stop please".to_string(),
        });
        assert_eq!(m.state(), SessionState::Listening);
        assert!(!m.barge_in());
        assert!(actions.contains(&Action::Send(ClientEvent::ResponseCancel)));
        assert!(actions.contains(&Action::Cue(Cue::BargeIn)));
    }

    #[test]
    fn non_wake_transcript_just_clears_flag() {
        let mut m = live_machine();
        m.on_server_event(ServerEvent::AudioDelta);
        m.on_server_event(ServerEvent::SpeechStarted);

        let actions = m.on_server_event(ServerEvent::InputTranscriptCompleted {
            transcript: "tell me more".to_string(),
        });
        assert_eq!(m.state(), SessionState::Speaking);
        assert!(!m.barge_in());
        assert!(actions.is_empty());
    }

    #[test]
    fn transcript_without_barge_in_is_not_gated() {
        let mut m = live_machine();
        let actions = m.on_server_event(ServerEvent::InputTranscriptCompleted {
            transcript: "hey bot what is sarcopenia".to_string(),
        });
        // Flag was never armed: no cancel even though the phrase appears
        assert!(actions.is_empty());
        assert_eq!(m.state(), SessionState::Listening);
        assert_eq!(m.transcript().len(), 1);
    }

    #[test]
    fn tool_call_moves_to_thinking() {
        let mut m = live_machine();
        let actions = m.on_server_event(ServerEvent::FunctionCallArgumentsDone {
            name: "search_pubmed".to_string(),
            call_id: "call_1".to_string(),
            arguments: r#"{"query":"sarcopenia"}"#.to_string(),
        });

        assert_eq!(m.state(), SessionState::Thinking);
        assert!(matches!(
            &actions[0],
            Action::DispatchTool(call) if call.call_id == "call_1"
        ));
    }

    #[test]
    fn second_tool_call_is_rejected_while_one_is_outstanding() {
        let mut m = live_machine();
        m.on_server_event(ServerEvent::FunctionCallArgumentsDone {
            name: "search_pubmed".to_string(),
            call_id: "call_1".to_string(),
            arguments: "{}".to_string(),
        });
        let actions = m.on_server_event(ServerEvent::FunctionCallArgumentsDone {
            name: "get_full_text".to_string(),
            call_id: "call_2".to_string(),
            arguments: "{}".to_string(),
        });

        assert!(actions.is_empty());
        assert_eq!(m.pending_call().unwrap().call_id, "call_1");
    }

    #[test]
    fn tool_result_sends_correlated_output_and_continuation() {
        let mut m = live_machine();
        m.on_server_event(ServerEvent::FunctionCallArgumentsDone {
            name: "search_pubmed".to_string(),
            call_id: "call_1".to_string(),
            arguments: "{}".to_string(),
        });

        let actions = m.on_tool_result("call_1", "[]");
        assert_eq!(m.state(), SessionState::Listening);
        assert!(m.pending_call().is_none());
        assert!(matches!(
            &actions[0],
            Action::Send(ClientEvent::ConversationItemCreate { item })
                if item.call_id == "call_1" && item.output == "[]"
        ));
        assert_eq!(actions[1], Action::Send(ClientEvent::response_create()));
    }

    #[test]
    fn mismatched_tool_result_is_dropped() {
        let mut m = live_machine();
        m.on_server_event(ServerEvent::FunctionCallArgumentsDone {
            name: "search_pubmed".to_string(),
            call_id: "call_1".to_string(),
            arguments: "{}".to_string(),
        });

        let actions = m.on_tool_result("call_other", "[]");
        assert!(actions.is_empty());
    }

    #[test]
    fn reset_returns_to_idle_from_any_state() {
        for prime in [0, 1, 2, 3] {
            let mut m = live_machine();
            match prime {
                1 => {
                    m.on_server_event(ServerEvent::AudioDelta);
                }
                2 => {
                    m.on_server_event(ServerEvent::FunctionCallArgumentsDone {
                        name: "search_pubmed".to_string(),
                        call_id: "c".to_string(),
                        arguments: "{}".to_string(),
                    });
                }
                3 => {
                    m.on_server_event(ServerEvent::AudioDelta);
                    m.on_server_event(ServerEvent::SpeechStarted);
                }
                _ => {}
            }
            m.reset();
            assert_eq!(m.state(), SessionState::Idle);
            assert!(!m.barge_in());
            assert!(m.pending_call().is_none());
            assert!(m.transcript().is_empty());
        }
    }

    #[test]
    fn assistant_transcript_is_recorded() {
        let mut m = live_machine();
        m.on_server_event(ServerEvent::ResponseTranscriptDone {
            transcript: "Here are three papers.".to_string(),
        });
        assert_eq!(m.transcript().len(), 1);
        assert_eq!(m.transcript()[0].text, "Here are three papers.");
    }
}
