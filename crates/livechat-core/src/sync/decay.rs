//! Expiry tracking for ephemeral records.
//!
//! One scheduler per topic. It only knows ids and deadlines; the owning
//! adapter drops the records it reports as expired.

use std::collections::HashMap;
use std::time::Duration;

use crate::constants::EXPIRED_LABEL;
use crate::models::Record;

#[derive(Debug, Default)]
pub struct EphemeralDecayScheduler {
    /// record id -> expires_at (ms)
    deadlines: HashMap<String, u64>,
}

impl EphemeralDecayScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record. Records without `expires_at` never decay and are
    /// not tracked. Re-tracking an id keeps one entry with the latest deadline.
    pub fn track(&mut self, record: &Record) -> bool {
        match record.expires_at {
            Some(expires_at) => {
                self.deadlines.insert(record.id.clone(), expires_at);
                true
            }
            None => {
                self.deadlines.remove(&record.id);
                false
            }
        }
    }

    pub fn untrack(&mut self, id: &str) -> bool {
        self.deadlines.remove(id).is_some()
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.deadlines.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.deadlines.values().copied().min()
    }

    /// Remove every record with `expires_at <= now`. Returns the removed ids,
    /// earliest deadline first. A removed id is never reported again unless
    /// it is tracked anew.
    pub fn tick(&mut self, now: u64) -> Vec<String> {
        let mut expired: Vec<(u64, String)> = self
            .deadlines
            .iter()
            .filter(|(_, &at)| at <= now)
            .map(|(id, &at)| (at, id.clone()))
            .collect();
        expired.sort();

        for (_, id) in &expired {
            self.deadlines.remove(id);
        }
        expired.into_iter().map(|(_, id)| id).collect()
    }

    /// Forget tracked ids for which `keep` returns false
    pub fn retain(&mut self, keep: impl Fn(&str) -> bool) {
        self.deadlines.retain(|id, _| keep(id));
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }
}

/// `max(0, expires_at - now)`, or None for records that never expire.
pub fn remaining_ttl(record: &Record, now: u64) -> Option<Duration> {
    record
        .expires_at
        .map(|at| Duration::from_millis(at.saturating_sub(now)))
}

/// Whole hours/minutes/seconds, rounded up to the next second, leading zero
/// units omitted. Exactly zero is "expired".
pub fn format_ttl(remaining: Duration) -> String {
    let millis = remaining.as_millis() as u64;
    let secs = millis.div_ceil(1000);
    if secs == 0 {
        return EXPIRED_LABEL.to_string();
    }

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecordKind, TopicKey};

    fn record(id: &str, expires_at: Option<u64>) -> Record {
        Record {
            id: id.to_string(),
            topic_key: TopicKey::Global,
            author_id: "alice".to_string(),
            author_name: "Alice".to_string(),
            body: "poof".to_string(),
            created_at: 0,
            expires_at,
            kind: RecordKind::User,
        }
    }

    #[test]
    fn test_record_without_expiry_never_decays() {
        let mut scheduler = EphemeralDecayScheduler::new();
        assert!(!scheduler.track(&record("a", None)));
        assert!(scheduler.tick(u64::MAX).is_empty());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_tick_removes_exactly_once() {
        let now = 10_000;
        let mut scheduler = EphemeralDecayScheduler::new();
        scheduler.track(&record("a", Some(now + 5_000)));

        assert!(scheduler.tick(now + 4_999).is_empty());
        assert_eq!(scheduler.tick(now + 5_001), vec!["a".to_string()]);
        assert!(scheduler.tick(now + 6_000).is_empty());
        assert!(!scheduler.is_tracked("a"));
    }

    #[test]
    fn test_tick_boundary_is_inclusive() {
        let mut scheduler = EphemeralDecayScheduler::new();
        scheduler.track(&record("a", Some(100)));
        assert_eq!(scheduler.tick(100), vec!["a".to_string()]);
    }

    #[test]
    fn test_tick_orders_by_deadline() {
        let mut scheduler = EphemeralDecayScheduler::new();
        scheduler.track(&record("late", Some(300)));
        scheduler.track(&record("early", Some(100)));
        scheduler.track(&record("keep", Some(900)));
        assert_eq!(scheduler.next_deadline(), Some(100));
        assert_eq!(scheduler.tick(500), vec!["early".to_string(), "late".to_string()]);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_retrack_keeps_single_entry() {
        let mut scheduler = EphemeralDecayScheduler::new();
        scheduler.track(&record("a", Some(100)));
        scheduler.track(&record("a", Some(200)));
        assert_eq!(scheduler.len(), 1);
        assert!(scheduler.tick(150).is_empty());
        assert_eq!(scheduler.tick(200).len(), 1);
    }

    #[test]
    fn test_remaining_ttl() {
        let r = record("a", Some(5_000));
        assert_eq!(remaining_ttl(&r, 1_000), Some(Duration::from_millis(4_000)));
        assert_eq!(remaining_ttl(&r, 9_000), Some(Duration::ZERO));
        assert_eq!(remaining_ttl(&record("b", None), 0), None);
    }

    #[test]
    fn test_format_ttl() {
        assert_eq!(format_ttl(Duration::ZERO), "expired");
        assert_eq!(format_ttl(Duration::from_millis(1)), "1s");
        assert_eq!(format_ttl(Duration::from_secs(5)), "5s");
        assert_eq!(format_ttl(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_ttl(Duration::from_secs(120)), "2m 0s");
        assert_eq!(format_ttl(Duration::from_secs(3725)), "1h 2m 5s");
        assert_eq!(format_ttl(Duration::from_secs(3600)), "1h 0m 0s");
    }
}
