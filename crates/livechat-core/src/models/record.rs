use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::constants::{fields, DISPLAY_NAME_ID_CHARS, SYSTEM_AUTHOR_ID};
use crate::error::MalformedRecordError;
use crate::models::TopicKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    User,
    /// Notices generated by the system (joins, banners). Never counted as unread.
    System,
}

/// A single chat message as held locally.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub topic_key: TopicKey,
    pub author_id: String,
    pub author_name: String,
    pub body: String,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub kind: RecordKind,
}

impl Record {
    /// Map a store document onto a typed record.
    ///
    /// `userId` and `text` are required. A missing or null `createdAt` (a server
    /// timestamp that has not resolved yet) becomes `now`.
    pub fn from_document(
        id: &str,
        topic_key: &TopicKey,
        doc: &Value,
        now: u64,
    ) -> Result<Self, MalformedRecordError> {
        let obj = doc
            .as_object()
            .ok_or_else(|| MalformedRecordError::invalid(id, "document"))?;

        let author_id = match obj.get(fields::USER_ID) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::String(_)) | None | Some(Value::Null) => {
                return Err(MalformedRecordError::missing(id, fields::USER_ID))
            }
            Some(_) => return Err(MalformedRecordError::invalid(id, fields::USER_ID)),
        };

        let body = match obj.get(fields::TEXT) {
            Some(Value::String(s)) => s.clone(),
            None | Some(Value::Null) => {
                return Err(MalformedRecordError::missing(id, fields::TEXT))
            }
            Some(_) => return Err(MalformedRecordError::invalid(id, fields::TEXT)),
        };

        let created_at = match obj.get(fields::CREATED_AT) {
            None | Some(Value::Null) => now,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| MalformedRecordError::invalid(id, fields::CREATED_AT))?,
        };

        let expires_at = match obj.get(fields::EXPIRES_AT) {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .ok_or_else(|| MalformedRecordError::invalid(id, fields::EXPIRES_AT))?,
            ),
        };

        let author_name = obj
            .get(fields::USER_NAME)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| fallback_display_name(&author_id));

        let kind = match obj.get(fields::KIND).and_then(|v| v.as_str()) {
            Some("system") => RecordKind::System,
            _ if author_id == SYSTEM_AUTHOR_ID => RecordKind::System,
            _ => RecordKind::User,
        };

        Ok(Self {
            id: id.to_string(),
            topic_key: topic_key.clone(),
            author_id,
            author_name,
            body,
            created_at,
            expires_at,
            kind,
        })
    }

    pub fn is_system(&self) -> bool {
        self.kind == RecordKind::System
    }

    pub fn is_ephemeral(&self) -> bool {
        self.expires_at.is_some()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// `User-` followed by the first few characters of the user id.
pub fn fallback_display_name(user_id: &str) -> String {
    let prefix: String = user_id.chars().take(DISPLAY_NAME_ID_CHARS).collect();
    format!("User-{prefix}")
}

/// What a local send carries before the store has assigned an id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordDraft {
    pub author_id: String,
    pub author_name: String,
    pub body: String,
    pub created_at: u64,
    pub expires_at: Option<u64>,
}

impl RecordDraft {
    /// Build the optimistic record shown until the store confirms the write.
    pub fn to_record(&self, local_id: &str, topic_key: &TopicKey) -> Record {
        Record {
            id: local_id.to_string(),
            topic_key: topic_key.clone(),
            author_id: self.author_id.clone(),
            author_name: self.author_name.clone(),
            body: self.body.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            kind: RecordKind::User,
        }
    }

    /// Document written to the store. `createdAt` is left null so the store
    /// stamps it with its own clock.
    pub fn to_document(&self, app_id: &str) -> Value {
        let mut doc = json!({
            fields::TEXT: self.body,
            fields::USER_ID: self.author_id,
            fields::USER_NAME: self.author_name,
            fields::CREATED_AT: Value::Null,
            fields::APP_ID: app_id,
        });
        if let Some(expires_at) = self.expires_at {
            doc[fields::EXPIRES_AT] = json!(expires_at);
        }
        doc
    }
}
