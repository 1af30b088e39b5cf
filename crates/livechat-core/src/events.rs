use crate::error::{SubscriptionError, WriteError};
use crate::models::{DisplayRecord, Record, TopicKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The topic's merged, ordered list changed
    Published {
        topic: TopicKey,
        records: Vec<DisplayRecord>,
        /// Malformed documents dropped from the batch behind this publish
        skipped: usize,
    },
    /// Ephemeral records removed by the decay timer
    Decayed { topic: TopicKey, records: Vec<Record> },
    /// An optimistic write was rejected or timed out. The record stays, marked failed.
    WriteFailed {
        topic: TopicKey,
        local_id: String,
        error: WriteError,
    },
    DeleteFailed {
        topic: TopicKey,
        record_id: String,
        error: WriteError,
    },
    /// Feed lost; the last known records stay on screen
    Disconnected {
        topic: TopicKey,
        error: SubscriptionError,
    },
    Reconnected { topic: TopicKey },
    UnreadChanged { topic: TopicKey, count: usize },
}

impl SyncEvent {
    pub fn topic(&self) -> &TopicKey {
        match self {
            Self::Published { topic, .. }
            | Self::Decayed { topic, .. }
            | Self::WriteFailed { topic, .. }
            | Self::DeleteFailed { topic, .. }
            | Self::Disconnected { topic, .. }
            | Self::Reconnected { topic }
            | Self::UnreadChanged { topic, .. } => topic,
        }
    }
}
