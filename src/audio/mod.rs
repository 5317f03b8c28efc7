//! Audio capture and playback
//!
//! Microphone capture and remote-audio playback around cpal. Each cpal
//! stream is owned by a dedicated thread (streams are not `Send`); the
//! handles exposed to the session are channel-based and `Send`.

mod capture;
mod sink;

pub use capture::{AudioCapture, FRAME_SAMPLES, SAMPLE_RATE, rms_energy};
pub use sink::{RemoteAudioSink, SinkHandle};
