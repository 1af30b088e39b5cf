use crate::models::TopicKey;

/// Feed delivery failed or was denied. Never fatal: the topic goes
/// `Disconnected` and can be re-subscribed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    #[error("Feed unavailable: {0}")]
    Unavailable(String),

    #[error("Subscription closed by the store")]
    Closed,
}

/// An optimistic write (or a delete) the store did not confirm.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Write not confirmed within {0}ms")]
    TimedOut(u64),

    #[error("Record not found: {0}")]
    NotFound(String),
}

/// A newly confirmed record matches more than one pending optimistic record.
/// Every candidate stays visible until a write acknowledgement or the write
/// timeout settles it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Record {confirmed_id} matches {} pending records", .candidates.len())]
pub struct ReconciliationAmbiguity {
    pub confirmed_id: String,
    pub candidates: Vec<String>,
}

/// A store document that cannot be mapped onto a `Record`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Malformed record {id}: {problem} field '{field}'")]
pub struct MalformedRecordError {
    pub id: String,
    pub field: &'static str,
    pub problem: &'static str,
}

impl MalformedRecordError {
    pub fn missing(id: impl Into<String>, field: &'static str) -> Self {
        Self {
            id: id.into(),
            field,
            problem: "missing",
        }
    }

    pub fn invalid(id: impl Into<String>, field: &'static str) -> Self {
        Self {
            id: id.into(),
            field,
            problem: "invalid",
        }
    }
}

/// Rejected user intents. Nothing is echoed when these are returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Message is empty")]
    EmptyBody,

    #[error("Message is {len} characters, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("No active topic")]
    NoActiveTopic,

    #[error("Unknown topic: {0}")]
    UnknownTopic(TopicKey),

    #[error("Unknown record: {0}")]
    UnknownRecord(String),

    #[error("Record {0} is still being sent")]
    StillSending(String),

    #[error("Topic {0} has been torn down")]
    TornDown(TopicKey),

    #[error("Time to live is too long")]
    TtlTooLong,

    #[error("Invalid participant id: {0}")]
    InvalidParticipant(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Malformed(#[from] MalformedRecordError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
