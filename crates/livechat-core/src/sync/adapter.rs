//! Per-topic live list synchronization.
//!
//! Turns the store's full-state snapshots into one ordered, de-duplicated
//! list, merged with optimistic local echo and pruned by the topic's decay
//! scheduler.
//!
//! ## Ordering
//! Records sort by `created_at` ascending. Equal timestamps keep arrival
//! order: the sequence in which each id was first seen by this adapter.
//!
//! ## Reconciliation
//! An optimistic record leaves the pending set when:
//! - its write was acknowledged with an id that is present in a snapshot, or
//! - a newly seen confirmed record has the same author and body, within the
//!   reconcile window, and no other pending record also qualifies.
//!
//! When several pending records qualify, all of them stay until the write
//! acknowledgements name the exact ids or the write timeout fails them.

use std::collections::{HashMap, HashSet};

use crate::backend::{BackingStore, FeedHandle, FeedSink, RawDocument, SubscriptionId};
use crate::error::{
    MalformedRecordError, ReconciliationAmbiguity, SendError, SubscriptionError, WriteError,
};
use crate::models::{Delivery, DisplayRecord, Record, RecordDraft, TopicKey};
use crate::sync::decay::EphemeralDecayScheduler;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic_key: TopicKey,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedStatus {
    Closed,
    Live,
    /// The feed reported an error. Records from before the error are kept.
    Disconnected(SubscriptionError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum PendingState {
    InFlight,
    /// The store accepted the write under this id; waiting for a snapshot to carry it
    Acked(String),
    Failed(String),
}

#[derive(Clone, Debug)]
struct PendingRecord {
    record: Record,
    draft: RecordDraft,
    state: PendingState,
    sent_at: u64,
}

impl PendingRecord {
    fn acked_id(&self) -> Option<&str> {
        match &self.state {
            PendingState::Acked(id) => Some(id),
            _ => None,
        }
    }

    fn delivery(&self) -> Delivery {
        match &self.state {
            PendingState::InFlight | PendingState::Acked(_) => Delivery::Pending,
            PendingState::Failed(reason) => Delivery::Failed(reason.clone()),
        }
    }
}

/// What a snapshot batch changed.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Confirmed records this adapter had never seen before, in arrival order
    pub new_records: Vec<Record>,
    /// Optimistic records the batch confirmed
    pub reconciled: Vec<String>,
    pub skipped: Vec<MalformedRecordError>,
    /// Confirmed records left unmatched because several pending ones qualified
    pub ambiguous: Vec<ReconciliationAmbiguity>,
    /// Records found past their expiry and hidden without going through `tick`
    pub expired: Vec<Record>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// A failed optimistic record was dropped locally
    Local,
    /// A confirmed record; the caller must delete it in the store
    Remote,
}

pub struct SyncedCollectionAdapter {
    topic_key: TopicKey,
    subscription: Option<Subscription>,
    feed_handle: Option<FeedHandle>,
    status: FeedStatus,
    /// Latest snapshot, minus decayed records
    confirmed: Vec<Record>,
    pending: Vec<PendingRecord>,
    /// id -> arrival sequence, for the tie-break
    arrival: HashMap<String, u64>,
    next_arrival: u64,
    /// Ids expired locally that the store may still be re-sending
    decayed: HashSet<String>,
    scheduler: EphemeralDecayScheduler,
    reconcile_window_ms: u64,
    published: Vec<DisplayRecord>,
    publish_count: u64,
}

impl SyncedCollectionAdapter {
    pub fn new(topic_key: TopicKey, reconcile_window_ms: u64) -> Self {
        Self {
            topic_key,
            subscription: None,
            feed_handle: None,
            status: FeedStatus::Closed,
            confirmed: Vec::new(),
            pending: Vec::new(),
            arrival: HashMap::new(),
            next_arrival: 0,
            decayed: HashSet::new(),
            scheduler: EphemeralDecayScheduler::new(),
            reconcile_window_ms,
            published: Vec::new(),
            publish_count: 0,
        }
    }

    pub fn topic_key(&self) -> &TopicKey {
        &self.topic_key
    }

    pub fn status(&self) -> &FeedStatus {
        &self.status
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.subscription.as_ref().is_some_and(|s| s.active)
    }

    /// Current published list
    pub fn records(&self) -> &[DisplayRecord] {
        &self.published
    }

    /// How many times the list has been published
    pub fn publish_count(&self) -> u64 {
        self.publish_count
    }

    pub fn scheduler(&self) -> &EphemeralDecayScheduler {
        &self.scheduler
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn last_error(&self) -> Option<&SubscriptionError> {
        match &self.status {
            FeedStatus::Disconnected(e) => Some(e),
            _ => None,
        }
    }

    pub fn find(&self, id: &str) -> Option<&DisplayRecord> {
        self.published.iter().find(|r| r.id() == id)
    }

    // ===== Feed lifecycle =====

    /// Start the live query. Returns the existing subscription while one is
    /// already open instead of creating a second feed.
    pub async fn open(
        &mut self,
        store: &dyn BackingStore,
        path: &str,
        sink: FeedSink,
    ) -> Result<Subscription, SubscriptionError> {
        if let Some(existing) = self.subscription.as_ref().filter(|s| s.active) {
            return Ok(existing.clone());
        }

        let subscription_id = sink.subscription_id();
        match store.subscribe(path, sink).await {
            Ok(handle) => {
                let subscription = Subscription {
                    id: subscription_id,
                    topic_key: self.topic_key.clone(),
                    active: true,
                };
                self.subscription = Some(subscription.clone());
                self.feed_handle = Some(handle);
                self.status = FeedStatus::Live;
                tracing::debug!(topic = %self.topic_key, subscription_id, "feed opened");
                Ok(subscription)
            }
            Err(e) => {
                self.status = FeedStatus::Disconnected(e.clone());
                Err(e)
            }
        }
    }

    /// Stop delivery and wait for the store to cancel upstream. Once this
    /// returns, `on_snapshot_batch` is a no-op until the adapter is reopened.
    pub async fn close(&mut self) {
        if let Some(subscription) = self.subscription.as_mut() {
            subscription.active = false;
        }
        if let FeedStatus::Live = self.status {
            self.status = FeedStatus::Closed;
        }
        if let Some(handle) = self.feed_handle.take() {
            handle.cancel().await;
        }
        tracing::debug!(topic = %self.topic_key, "feed closed");
    }

    /// Record a feed error. The feed counts as closed from here; retry by
    /// reopening. Returns false when the adapter was not live.
    pub fn on_feed_error(&mut self, error: SubscriptionError) -> bool {
        if !self.is_open() {
            return false;
        }
        tracing::warn!(topic = %self.topic_key, %error, "feed error");
        if let Some(subscription) = self.subscription.as_mut() {
            subscription.active = false;
        }
        self.status = FeedStatus::Disconnected(error);
        true
    }

    /// Upstream handle of a feed that errored, so the caller can cancel it.
    pub fn take_feed_handle(&mut self) -> Option<FeedHandle> {
        self.feed_handle.take()
    }

    // ===== Snapshots =====

    /// Map raw store documents and apply them as one snapshot. Malformed
    /// documents are skipped and reported in the outcome.
    pub fn apply_documents(&mut self, docs: Vec<RawDocument>, now: u64) -> Option<BatchOutcome> {
        let mut records = Vec::with_capacity(docs.len());
        let mut skipped = Vec::new();
        for (id, doc) in docs {
            match Record::from_document(&id, &self.topic_key, &doc, now) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(topic = %self.topic_key, error = %e, "skipping malformed document");
                    skipped.push(e);
                }
            }
        }
        let mut outcome = self.on_snapshot_batch(records, now)?;
        outcome.skipped = skipped;
        Some(outcome)
    }

    /// Replace the confirmed set with a full-state snapshot, reconcile the
    /// optimistic records and publish. Returns None (and changes nothing)
    /// when the feed is not open.
    pub fn on_snapshot_batch(&mut self, records: Vec<Record>, now: u64) -> Option<BatchOutcome> {
        if !self.is_open() {
            tracing::debug!(topic = %self.topic_key, "dropping batch for closed feed");
            return None;
        }

        let mut outcome = BatchOutcome::default();
        let mut seen: HashSet<String> = HashSet::with_capacity(records.len());
        let mut confirmed = Vec::with_capacity(records.len());
        let previous: HashSet<&str> = self.confirmed.iter().map(|r| r.id.as_str()).collect();
        let mut fresh: Vec<Record> = Vec::new();

        for record in records {
            if !seen.insert(record.id.clone()) {
                continue;
            }
            if self.decayed.contains(&record.id) {
                continue;
            }
            if record.is_expired(now) {
                self.decayed.insert(record.id.clone());
                self.scheduler.untrack(&record.id);
                outcome.expired.push(record);
                continue;
            }
            if !previous.contains(record.id.as_str()) {
                fresh.push(record.clone());
            }
            confirmed.push(record);
        }

        for record in &fresh {
            match self.reconcile(record) {
                Ok(Some(local_id)) => {
                    // The confirmed copy takes the optimistic one's place in arrival order
                    let seq = self.arrival.remove(&local_id);
                    self.arrival
                        .entry(record.id.clone())
                        .or_insert_with(|| seq.unwrap_or(self.next_arrival));
                    self.scheduler.untrack(&local_id);
                    outcome.reconciled.push(local_id);
                }
                Ok(None) => outcome.new_records.push(record.clone()),
                Err(ambiguity) => {
                    outcome.new_records.push(record.clone());
                    outcome.ambiguous.push(ambiguity);
                }
            }
            if !self.arrival.contains_key(&record.id) {
                self.arrival.insert(record.id.clone(), self.next_arrival);
            }
            self.next_arrival += 1;
        }

        for record in &confirmed {
            if record.expires_at.is_some() && !self.scheduler.is_tracked(&record.id) {
                self.scheduler.track(record);
            }
        }

        self.decayed.retain(|id| seen.contains(id));
        self.confirmed = confirmed;
        self.prune_bookkeeping();
        self.publish();

        tracing::debug!(
            topic = %self.topic_key,
            confirmed = self.confirmed.len(),
            pending = self.pending.len(),
            new = outcome.new_records.len(),
            reconciled = outcome.reconciled.len(),
            "snapshot applied"
        );
        Some(outcome)
    }

    /// Find the single optimistic record a newly confirmed one stands for.
    fn reconcile(&mut self, confirmed: &Record) -> Result<Option<String>, ReconciliationAmbiguity> {
        if let Some(idx) = self
            .pending
            .iter()
            .position(|p| p.acked_id() == Some(confirmed.id.as_str()))
        {
            return Ok(Some(self.pending.remove(idx).record.id));
        }

        let window = self.reconcile_window_ms;
        let candidates: Vec<usize> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.acked_id().is_none())
            .filter(|(_, p)| {
                p.record.author_id == confirmed.author_id
                    && p.record.body == confirmed.body
                    && p.record.created_at.abs_diff(confirmed.created_at) <= window
            })
            .map(|(i, _)| i)
            .collect();

        match candidates.as_slice() {
            [] => Ok(None),
            [idx] => Ok(Some(self.pending.remove(*idx).record.id)),
            _ => {
                let ambiguity = ReconciliationAmbiguity {
                    confirmed_id: confirmed.id.clone(),
                    candidates: candidates
                        .iter()
                        .map(|&i| self.pending[i].record.id.clone())
                        .collect(),
                };
                tracing::debug!(topic = %self.topic_key, %ambiguity, "keeping all pending copies");
                Err(ambiguity)
            }
        }
    }

    // ===== Local intents =====

    /// Optimistic echo: show the record right away, before the store confirms it.
    pub fn send_local(&mut self, local_id: &str, draft: RecordDraft, now: u64) -> Record {
        let record = draft.to_record(local_id, &self.topic_key);
        self.arrival.insert(record.id.clone(), self.next_arrival);
        self.next_arrival += 1;
        self.scheduler.track(&record);
        self.pending.push(PendingRecord {
            record: record.clone(),
            draft,
            state: PendingState::InFlight,
            sent_at: now,
        });
        self.publish();
        record
    }

    /// The store accepted the write. If a snapshot already carried the
    /// record, the optimistic copy goes away now.
    pub fn on_write_acked(&mut self, local_id: &str, remote_id: &str) -> bool {
        let Some(pending) = self.pending.iter_mut().find(|p| p.record.id == local_id) else {
            // Already reconciled by content
            return false;
        };
        pending.state = PendingState::Acked(remote_id.to_string());

        if self.confirmed.iter().any(|r| r.id == remote_id) {
            self.drop_pending(local_id);
            self.publish();
            return true;
        }
        false
    }

    /// The store rejected the write. The record stays visible, marked failed.
    pub fn on_write_failed(&mut self, local_id: &str, error: &WriteError) -> bool {
        let Some(pending) = self
            .pending
            .iter_mut()
            .find(|p| p.record.id == local_id && p.state == PendingState::InFlight)
        else {
            return false;
        };
        tracing::warn!(topic = %self.topic_key, local_id, %error, "write failed");
        pending.state = PendingState::Failed(error.to_string());
        self.publish();
        true
    }

    /// Mark writes still in flight after `timeout_ms` as failed. Returns their ids.
    pub fn expire_writes(&mut self, now: u64, timeout_ms: u64) -> Vec<String> {
        let mut failed = Vec::new();
        let reason = WriteError::TimedOut(timeout_ms).to_string();
        for pending in self.pending.iter_mut() {
            if pending.state == PendingState::InFlight
                && now.saturating_sub(pending.sent_at) >= timeout_ms
            {
                pending.state = PendingState::Failed(reason.clone());
                failed.push(pending.record.id.clone());
            }
        }
        if !failed.is_empty() {
            tracing::warn!(topic = %self.topic_key, count = failed.len(), "writes timed out");
            self.publish();
        }
        failed
    }

    /// Remove a record: failed optimistic copies go locally, confirmed ones
    /// need a store delete. Records still sending cannot be removed.
    pub fn remove(&mut self, id: &str) -> Result<RemoveOutcome, SendError> {
        if let Some(pending) = self.pending.iter().find(|p| p.record.id == id) {
            return match pending.state {
                PendingState::Failed(_) => {
                    self.drop_pending(id);
                    self.publish();
                    Ok(RemoveOutcome::Local)
                }
                _ => Err(SendError::StillSending(id.to_string())),
            };
        }
        if self.confirmed.iter().any(|r| r.id == id) {
            return Ok(RemoveOutcome::Remote);
        }
        Err(SendError::UnknownRecord(id.to_string()))
    }

    /// Take a failed record out so it can be sent again. Nothing is retried
    /// on its own.
    pub fn take_failed(&mut self, local_id: &str) -> Result<RecordDraft, SendError> {
        let idx = self
            .pending
            .iter()
            .position(|p| p.record.id == local_id)
            .ok_or_else(|| SendError::UnknownRecord(local_id.to_string()))?;
        if !matches!(self.pending[idx].state, PendingState::Failed(_)) {
            return Err(SendError::StillSending(local_id.to_string()));
        }
        let pending = self.pending.remove(idx);
        self.arrival.remove(local_id);
        self.scheduler.untrack(local_id);
        self.publish();
        Ok(pending.draft)
    }

    // ===== Decay =====

    /// Drop every record whose expiry has passed. Returns the removed records.
    /// An optimistic record the store already acknowledged comes back under
    /// its store id, since that copy outlives the local one.
    pub fn tick(&mut self, now: u64) -> Vec<Record> {
        let expired = self.scheduler.tick(now);
        if expired.is_empty() {
            return Vec::new();
        }

        let expired: HashSet<String> = expired.into_iter().collect();
        let mut removed = Vec::new();

        self.confirmed.retain(|r| {
            if expired.contains(&r.id) {
                removed.push(r.clone());
                false
            } else {
                true
            }
        });

        self.pending.retain(|p| {
            if !expired.contains(&p.record.id) {
                return true;
            }
            let mut record = p.record.clone();
            if let Some(remote_id) = p.acked_id() {
                record.id = remote_id.to_string();
            }
            removed.push(record);
            false
        });

        for record in &removed {
            self.decayed.insert(record.id.clone());
        }

        for id in &expired {
            self.arrival.remove(id);
        }
        self.publish();
        removed
    }

    // ===== Internals =====

    fn drop_pending(&mut self, local_id: &str) {
        self.pending.retain(|p| p.record.id != local_id);
        self.arrival.remove(local_id);
        self.scheduler.untrack(local_id);
    }

    fn prune_bookkeeping(&mut self) {
        let live: HashSet<&str> = self
            .confirmed
            .iter()
            .map(|r| r.id.as_str())
            .chain(self.pending.iter().map(|p| p.record.id.as_str()))
            .collect();
        self.arrival.retain(|id, _| live.contains(id.as_str()));
        self.scheduler.retain(|id| live.contains(id));
    }

    fn publish(&mut self) {
        let mut merged: Vec<DisplayRecord> = Vec::with_capacity(self.confirmed.len() + self.pending.len());
        let mut ids: HashSet<&str> = HashSet::new();

        for record in &self.confirmed {
            if ids.insert(record.id.as_str()) {
                merged.push(DisplayRecord::confirmed(record.clone()));
            }
        }
        for pending in &self.pending {
            if ids.insert(pending.record.id.as_str()) {
                merged.push(DisplayRecord {
                    record: pending.record.clone(),
                    delivery: pending.delivery(),
                });
            }
        }

        let arrival = &self.arrival;
        merged.sort_by_key(|r| {
            (
                r.record.created_at,
                arrival.get(&r.record.id).copied().unwrap_or(u64::MAX),
            )
        });

        self.published = merged;
        self.publish_count += 1;
    }
}
