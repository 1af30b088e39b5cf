use livechat_core::models::{DisplayRecord, TopicKey};

pub(crate) struct ReplState {
    pub(crate) user_id: String,
    /// Topic whose transcript is on screen
    pub(crate) shown_topic: Option<TopicKey>,
    /// (id, delivery label) of every line on screen, to skip redundant redraws
    shown: Vec<(String, &'static str)>,
}

impl ReplState {
    pub(crate) fn new(user_id: String) -> Self {
        Self {
            user_id,
            shown_topic: None,
            shown: Vec::new(),
        }
    }

    /// Remember what is on screen. Returns false when it already was.
    pub(crate) fn mark_shown(&mut self, topic: &TopicKey, records: &[DisplayRecord]) -> bool {
        let fingerprint: Vec<(String, &'static str)> = records
            .iter()
            .map(|r| (r.id().to_string(), r.delivery.label()))
            .collect();
        if self.shown_topic.as_ref() == Some(topic) && self.shown == fingerprint {
            return false;
        }
        self.shown_topic = Some(topic.clone());
        self.shown = fingerprint;
        true
    }

    /// Force the next transcript to be printed
    pub(crate) fn invalidate(&mut self) {
        self.shown_topic = None;
        self.shown.clear();
    }
}

/// Find the record an id (or a unique prefix of one) refers to.
pub(crate) fn resolve_id(records: &[DisplayRecord], input: &str) -> Result<String, String> {
    let input = input.trim().trim_start_matches('#');
    if input.is_empty() {
        return Err("Missing message id".to_string());
    }
    if let Some(exact) = records.iter().find(|r| r.id() == input) {
        return Ok(exact.id().to_string());
    }
    let matches: Vec<&DisplayRecord> = records.iter().filter(|r| r.id().starts_with(input)).collect();
    match matches.as_slice() {
        [only] => Ok(only.id().to_string()),
        [] => Err(format!("No message with id {input}")),
        _ => Err(format!("{input} matches {} messages", matches.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livechat_core::models::{Delivery, Record, RecordKind};

    fn shown(id: &str, delivery: Delivery) -> DisplayRecord {
        DisplayRecord {
            record: Record {
                id: id.to_string(),
                topic_key: TopicKey::Global,
                author_id: "me".to_string(),
                author_name: "Me".to_string(),
                body: "x".to_string(),
                created_at: 0,
                expires_at: None,
                kind: RecordKind::User,
            },
            delivery,
        }
    }

    #[test]
    fn test_mark_shown_skips_identical_lists() {
        let mut state = ReplState::new("me".to_string());
        let records = vec![shown("local-1", Delivery::Pending)];
        assert!(state.mark_shown(&TopicKey::Global, &records));
        assert!(!state.mark_shown(&TopicKey::Global, &records));

        let failed = vec![shown("local-1", Delivery::Failed("x".to_string()))];
        assert!(state.mark_shown(&TopicKey::Global, &failed));
        assert!(state.mark_shown(&TopicKey::direct("bob"), &failed));
    }

    #[test]
    fn test_resolve_id_by_prefix() {
        let records = vec![
            shown("local-abc123", Delivery::Pending),
            shown("local-abd999", Delivery::Pending),
            shown("doc-1", Delivery::Confirmed),
        ];
        assert_eq!(resolve_id(&records, "doc-1"), Ok("doc-1".to_string()));
        assert_eq!(resolve_id(&records, "#local-abc"), Ok("local-abc123".to_string()));
        assert!(resolve_id(&records, "local-ab").is_err());
        assert!(resolve_id(&records, "nope").is_err());
    }
}
