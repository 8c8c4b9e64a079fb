//! Message model - one immutable submission.

use super::epoch::EpochId;
use chrono::{DateTime, Utc};
use echoes_layers::{LayerIndex, RoomIndex};
use serde::{Deserialize, Serialize};

/// A placed, persisted message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier (Blake3 hash of epoch, sequence and text)
    pub id: String,

    /// Epoch that was active at submission
    pub epoch_id: EpochId,

    /// 0-based position within the epoch
    pub sequence: u64,

    /// Layer computed at insertion
    pub layer_index: LayerIndex,

    /// Room computed at insertion
    pub room_index: RoomIndex,

    /// Trimmed original text
    pub text: String,

    /// Canonical form used for echo detection
    pub normalized_text: String,

    /// Submission time
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Generate ID from the message's position and content.
    pub fn generate_id(epoch_id: EpochId, sequence: u64, normalized_text: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&epoch_id.to_be_bytes());
        hasher.update(&sequence.to_be_bytes());
        hasher.update(normalized_text.as_bytes());
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }
}

/// A validated submission on its way into the store.
///
/// The epoch, sequence and placement are decided by the store under its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    /// Trimmed original text
    pub text: String,

    /// Canonical form
    pub normalized_text: String,

    /// Submission time
    pub created_at: DateTime<Utc>,
}

impl MessageDraft {
    /// Clean and normalize raw text. Callers validate first.
    pub fn new(raw: &str, created_at: DateTime<Utc>) -> Self {
        let text = crate::text::clean(raw).to_string();
        let normalized_text = crate::text::normalize(&text);
        Self {
            text,
            normalized_text,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_id_deterministic() {
        let a = Message::generate_id(1, 0, "hello world");
        let b = Message::generate_id(1, 0, "hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, Message::generate_id(1, 1, "hello world"));
    }

    #[test]
    fn draft_cleans_and_normalizes() {
        let draft = MessageDraft::new("  Hello, World!  ", Utc::now());
        assert_eq!(draft.text, "Hello, World!");
        assert_eq!(draft.normalized_text, "hello world");
    }
}
