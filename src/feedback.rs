//! Feedback cue signaling
//!
//! The core emits short cue signals on state transitions; synthesizing and
//! playing the actual earcons is an external concern. The default emitter
//! just logs.

/// Cue kinds keyed to state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    /// Session negotiated and live
    SessionStarted,
    /// Session stopped and resources released
    SessionEnded,
    /// Wake phrase matched; assistant response canceled
    BargeIn,
    /// Tool call dispatched
    Thinking,
    /// Something went wrong (negotiation failure, malformed event)
    Error,
}

/// Consumer of feedback cues
pub trait FeedbackEmitter: Send + Sync {
    /// Signal a cue. Must not block.
    fn cue(&self, cue: Cue);
}

/// Default emitter: logs cues at debug level
#[derive(Debug, Default)]
pub struct LogFeedback;

impl FeedbackEmitter for LogFeedback {
    fn cue(&self, cue: Cue) {
        tracing::debug!(?cue, "feedback cue");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Emitter that records cues for assertions
    #[derive(Debug, Default)]
    pub struct RecordingFeedback {
        pub cues: Mutex<Vec<Cue>>,
    }

    impl FeedbackEmitter for RecordingFeedback {
        fn cue(&self, cue: Cue) {
            self.cues.lock().unwrap().push(cue);
        }
    }

    #[test]
    fn recording_emitter_captures_order() {
        let emitter = RecordingFeedback::default();
        emitter.cue(Cue::SessionStarted);
        emitter.cue(Cue::BargeIn);
        assert_eq!(
            *emitter.cues.lock().unwrap(),
            vec![Cue::SessionStarted, Cue::BargeIn]
        );
    }
}
