//! Voicebot Researcher - real-time voice client for literature research
//!
//! Core of the spoken research assistant: microphone capture and
//! conditioning, peer transport negotiation against the realtime service,
//! a single-session conversation state machine with wake-phrase-gated
//! barge-in, and correlated dispatch of assistant-requested PubMed tools
//! through the trusted backend.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Local audio                         │
//! │   Mic capture + conditioning  │  Remote audio sink  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              Session Controller                      │
//! │   State machine  │  Barge-in  │  Tool dispatch      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │        Peer transport (media + event channel)        │
//! │   Realtime service  │  Backend (/session, tools)    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod feedback;
pub mod session;
pub mod tools;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{SessionController, SessionState};
