//! Append-only conversation transcript
//!
//! Consumed by external renderers; entries are never mutated after insertion.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Who produced a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human speaker
    User,
    /// The remote assistant
    Assistant,
}

/// One finalized utterance in the conversation
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptMessage {
    /// Unique entry id
    pub id: Uuid,
    /// Speaker role
    pub role: Role,
    /// Transcribed text
    pub text: String,
    /// Time the transcript was recorded
    pub timestamp: DateTime<Utc>,
}

impl TranscriptMessage {
    /// Create a new entry stamped with the current time
    #[must_use]
    pub fn new(role: Role, text: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Ordered, append-only transcript log
#[derive(Debug, Default)]
pub struct TranscriptLog {
    entries: Vec<TranscriptMessage>,
}

impl TranscriptLog {
    /// Create an empty log
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a finalized utterance
    pub fn push(&mut self, role: Role, text: &str) {
        self.entries.push(TranscriptMessage::new(role, text));
    }

    /// All entries in arrival order
    #[must_use]
    pub fn entries(&self) -> &[TranscriptMessage] {
        &self.entries
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries (session teardown)
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_keep_arrival_order() {
        let mut log = TranscriptLog::new();
        log.push(Role::User, "find papers on sarcopenia");
        log.push(Role::Assistant, "I found three studies.");

        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[0].role, Role::User);
        assert_eq!(log.entries()[1].role, Role::Assistant);
        assert!(log.entries()[0].timestamp <= log.entries()[1].timestamp);
    }

    #[test]
    fn ids_are_unique() {
        let a = TranscriptMessage::new(Role::User, "one");
        let b = TranscriptMessage::new(Role::User, "one");
        assert_ne!(a.id, b.id);
    }
}
