//! Peer transport negotiation
//!
//! Establishes the real-time media + event-channel transport with the
//! remote service: ephemeral credential fetch, SDP offer/answer exchange,
//! and the opus media pumps between the local audio layer and the peer
//! connection.
//!
//! Ordering matters here: the inbound-media handler is registered before
//! any signaling is sent (so the remote track always has a consumer), and
//! the event channel is created before the offer (so it is part of the
//! negotiated description).

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::{FRAME_SAMPLES, RemoteAudioSink, SAMPLE_RATE, SinkHandle};
use crate::config::Config;
use crate::session::{EngineEvent, PeerSession};
use crate::{Error, Result};

/// Label of the bidirectional protocol event channel
const EVENT_CHANNEL_LABEL: &str = "oai-events";

/// Duration of one opus frame
const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Upper bound for an encoded opus packet
const MAX_OPUS_PACKET: usize = 1500;

/// Decode buffer size: 120 ms at the session sample rate
const MAX_DECODE_SAMPLES: usize = 2880;

/// Response of the backend `/session` endpoint
#[derive(Debug, Deserialize)]
struct SessionCredential {
    client_secret: ClientSecret,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
}

/// Negotiates the peer transport for one session
pub struct TransportNegotiator {
    client: reqwest::Client,
    config: Arc<Config>,
}

impl TransportNegotiator {
    /// Create a negotiator for the configured endpoints
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Run the full signaling handshake.
    ///
    /// Populates `peer` progressively so the caller can tear down whatever
    /// exists when any step fails; this function never cleans up after
    /// itself. Returns the local microphone track for the capture pump.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CredentialFetchFailed`] when the backend refuses a
    /// session, [`Error::NegotiationRejected`] when the remote signaling
    /// endpoint rejects the offer, and transport/device errors from the
    /// intermediate steps.
    pub async fn connect(
        &self,
        peer: &Mutex<PeerSession>,
        events: mpsc::UnboundedSender<EngineEvent>,
        far_end_active: Arc<AtomicBool>,
    ) -> Result<Arc<TrackLocalStaticSample>> {
        // 1. Ephemeral credential from the trusted backend
        let credential = self.fetch_credential().await?;

        // 2. Fresh peer connection
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(media).build();
        let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);
        lock(peer).transport = Some(Arc::clone(&pc));

        // 3. Inbound-media handler before any signaling, wired to an
        //    unmuted, full-volume sink
        let sink = RemoteAudioSink::open(far_end_active)?;
        let sink_handle = sink.handle();
        lock(peer).sink = Some(sink);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sink = sink_handle.clone();
            Box::pin(async move {
                tracing::debug!(ssrc = track.ssrc(), "remote audio track received");
                tokio::spawn(pump_remote_audio(track, sink));
            })
        }));

        // 4. Local microphone track
        let mic_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "microphone".to_owned(),
        ));
        pc.add_track(Arc::clone(&mic_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // 5. Event channel before the offer so it lands in the negotiated
        //    description
        let dc = pc.create_data_channel(EVENT_CHANNEL_LABEL, None).await?;
        let open_events = events.clone();
        dc.on_open(Box::new(move || {
            let events = open_events.clone();
            Box::pin(async move {
                let _ = events.send(EngineEvent::ChannelOpen);
            })
        }));
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                let raw = String::from_utf8_lossy(&msg.data).to_string();
                let _ = events.send(EngineEvent::Message(raw));
            })
        }));
        lock(peer).channel = Some(Arc::clone(&dc));

        // 6. Local offer; wait for ICE gathering so the serialized offer
        //    carries candidates
        let offer = pc.create_offer(None).await?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await?;
        let _ = gather_complete.recv().await;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| Error::NegotiationFailed("missing local description".to_string()))?;

        // 7. Signaling POST, authenticated with the ephemeral credential
        let response = self
            .client
            .post(format!(
                "{}?model={}",
                self.config.realtime_url, self.config.model
            ))
            .bearer_auth(&credential)
            .header(reqwest::header::CONTENT_TYPE, "application/sdp")
            .body(local.sdp)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::NegotiationRejected {
                status: status.as_u16(),
                detail,
            });
        }

        // 8. Apply the remote answer
        let answer_sdp = response.text().await?;
        let answer = RTCSessionDescription::answer(answer_sdp)?;
        pc.set_remote_description(answer).await?;

        tracing::info!(model = %self.config.model, "peer transport established");
        Ok(mic_track)
    }

    /// Fetch the short-lived credential from the backend
    async fn fetch_credential(&self) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/session", self.config.api_base))
            .send()
            .await
            .map_err(|e| Error::CredentialFetchFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::CredentialFetchFailed(format!(
                "status {}",
                response.status()
            )));
        }

        let credential: SessionCredential = response
            .json()
            .await
            .map_err(|e| Error::CredentialFetchFailed(e.to_string()))?;
        Ok(credential.client_secret.value)
    }
}

/// Encode conditioned microphone frames and feed the local track
pub(crate) fn spawn_microphone_pump(
    mut frames: mpsc::UnboundedReceiver<Vec<f32>>,
    track: Arc<TrackLocalStaticSample>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut encoder =
            match opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip) {
                Ok(encoder) => encoder,
                Err(e) => {
                    tracing::error!(error = %e, "opus encoder init failed");
                    return;
                }
            };

        let mut pending: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES * 4);
        while let Some(chunk) = frames.recv().await {
            pending.extend_from_slice(&chunk);
            while pending.len() >= FRAME_SAMPLES {
                let frame: Vec<f32> = pending.drain(..FRAME_SAMPLES).collect();
                match encoder.encode_vec_float(&frame, MAX_OPUS_PACKET) {
                    Ok(data) => {
                        let sample = Sample {
                            data: Bytes::from(data),
                            duration: FRAME_DURATION,
                            ..Default::default()
                        };
                        if let Err(e) = track.write_sample(&sample).await {
                            tracing::trace!(error = %e, "mic sample dropped");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "opus encode failed"),
                }
            }
        }
        tracing::debug!("microphone pump ended");
    })
}

/// Decode remote opus packets into the audio sink
async fn pump_remote_audio(track: Arc<TrackRemote>, sink: SinkHandle) {
    let mut decoder = match opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono) {
        Ok(decoder) => decoder,
        Err(e) => {
            tracing::error!(error = %e, "opus decoder init failed");
            return;
        }
    };

    let mut pcm = vec![0.0f32; MAX_DECODE_SAMPLES];
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                match decoder.decode_float(&packet.payload, &mut pcm, false) {
                    Ok(decoded) => sink.push(&pcm[..decoded]),
                    Err(e) => tracing::trace!(error = %e, "opus decode failed"),
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "remote track closed");
                break;
            }
        }
    }
}

fn lock(peer: &Mutex<PeerSession>) -> std::sync::MutexGuard<'_, PeerSession> {
    peer.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_response_parses() {
        let raw = r#"{"client_secret": {"value": "ek_abc123", "expires_at": 1700000000}}"#;
        let parsed: SessionCredential = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.client_secret.value, "ek_abc123");
    }

    #[test]
    fn event_channel_label_is_protocol_fixed() {
        assert_eq!(EVENT_CHANNEL_LABEL, "oai-events");
    }
}
