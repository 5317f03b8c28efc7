//! Error types for the voicebot client

use thiserror::Error;

/// Result type alias for voicebot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voicebot client
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone access denied by the platform
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No usable capture or playback device
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Ephemeral credential fetch failed
    #[error("credential fetch failed: {0}")]
    CredentialFetchFailed(String),

    /// A local negotiation step failed before the signaling exchange
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Remote signaling endpoint rejected the offer
    #[error("negotiation rejected ({status}): {detail}")]
    NegotiationRejected {
        /// HTTP status returned by the signaling endpoint
        status: u16,
        /// Response body captured as diagnostic detail
        detail: String,
    },

    /// Outbound message could not be delivered — the event channel is gone
    #[error("event channel closed")]
    ChannelClosed,

    /// Inbound event-channel message could not be parsed
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Tool backend call failed
    #[error("tool backend failure: {0}")]
    ToolBackendFailure(String),

    /// Audio processing error
    #[error("audio error: {0}")]
    Audio(String),

    /// Peer transport error
    #[error("transport error: {0}")]
    Transport(#[from] webrtc::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
