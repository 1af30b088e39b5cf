//! Topic routing.
//!
//! Each conversation (the global room or one private peer) gets its own
//! adapter and decay scheduler, created lazily on first selection. Switching
//! topics never tears anything down; inactive topics keep their feed, their
//! history and their decay timers.
//!
//! ## Lifecycle
//! `Uninitialized -> Subscribed -> (Disconnected <-> Subscribed) -> TornDown`
//!
//! A first subscribe that fails goes straight to `Disconnected`, and so does a
//! feed that errors or is closed. `TornDown` is terminal and only reached
//! through `remove_topic` or `shutdown`.
//!
//! ## Unread
//! A topic's unread count is the number of records from other users, system
//! notices excluded, that arrived while it was inactive and are still in its
//! history. Decayed and deleted records stop counting.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tokio::sync::mpsc::UnboundedSender;

use crate::backend::{BackingStore, FeedEvent, FeedMessage, FeedSink, SubscriptionId};
use crate::config::CoreConfig;
use crate::error::{SendError, SubscriptionError, WriteError};
use crate::events::SyncEvent;
use crate::models::{is_valid_participant, DisplayRecord, Record, RecordDraft, TopicKey};
use crate::sync::adapter::{RemoveOutcome, Subscription, SyncedCollectionAdapter};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicLifecycle {
    Uninitialized,
    Subscribed,
    Disconnected,
    TornDown,
}

impl TopicLifecycle {
    pub fn can_transition_to(self, next: TopicLifecycle) -> bool {
        use TopicLifecycle::*;
        matches!(
            (self, next),
            (Uninitialized, Subscribed)
                | (Uninitialized, Disconnected)
                | (Subscribed, Disconnected)
                | (Disconnected, Subscribed)
                | (Uninitialized | Subscribed | Disconnected, TornDown)
        )
    }
}

struct TopicState {
    adapter: SyncedCollectionAdapter,
    lifecycle: TopicLifecycle,
    /// Ids of unread records still in the history
    unread: HashSet<String>,
    path: String,
}

impl TopicState {
    fn transition(&mut self, next: TopicLifecycle) -> bool {
        if self.lifecycle == next {
            return true;
        }
        if !self.lifecycle.can_transition_to(next) {
            tracing::error!(
                topic = %self.adapter.topic_key(),
                from = ?self.lifecycle,
                to = ?next,
                "invalid topic transition"
            );
            return false;
        }
        tracing::info!(
            topic = %self.adapter.topic_key(),
            from = ?self.lifecycle,
            to = ?next,
            "topic transition"
        );
        self.lifecycle = next;
        true
    }

    /// Forget unread ids that left the history. Returns the new count if it
    /// differs from `before`.
    fn settle_unread(&mut self, before: usize) -> Option<usize> {
        let adapter = &self.adapter;
        self.unread.retain(|id| adapter.find(id).is_some());
        (self.unread.len() != before).then_some(self.unread.len())
    }
}

/// Sidebar view of one topic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicSummary {
    pub key: TopicKey,
    pub lifecycle: TopicLifecycle,
    pub unread: usize,
    pub records: usize,
    pub active: bool,
}

/// A store delete the caller has to issue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteRequest {
    pub topic: TopicKey,
    pub path: String,
    pub record_id: String,
}

/// A store write the caller has to issue for an optimistic record
#[derive(Clone, Debug, PartialEq)]
pub struct WriteRequest {
    pub topic: TopicKey,
    pub path: String,
    pub local_id: String,
    pub document: serde_json::Value,
}

pub struct TopicRouter {
    config: CoreConfig,
    self_id: String,
    topics: BTreeMap<TopicKey, TopicState>,
    /// Live subscriptions only. A feed message whose id is missing here is stale.
    routes: HashMap<SubscriptionId, TopicKey>,
    active: Option<TopicKey>,
    next_subscription_id: SubscriptionId,
    feed_tx: UnboundedSender<FeedMessage>,
    events: VecDeque<SyncEvent>,
}

impl TopicRouter {
    pub fn new(config: CoreConfig, self_id: impl Into<String>, feed_tx: UnboundedSender<FeedMessage>) -> Self {
        Self {
            config,
            self_id: self_id.into(),
            topics: BTreeMap::new(),
            routes: HashMap::new(),
            active: None,
            next_subscription_id: 0,
            feed_tx,
            events: VecDeque::new(),
        }
    }

    // ===== Queries =====

    pub fn active(&self) -> Option<&TopicKey> {
        self.active.as_ref()
    }

    pub fn lifecycle(&self, key: &TopicKey) -> TopicLifecycle {
        self.topics
            .get(key)
            .map(|t| t.lifecycle)
            .unwrap_or(TopicLifecycle::Uninitialized)
    }

    pub fn unread_count(&self, key: &TopicKey) -> usize {
        self.topics.get(key).map(|t| t.unread.len()).unwrap_or(0)
    }

    pub fn records(&self, key: &TopicKey) -> &[DisplayRecord] {
        self.topics
            .get(key)
            .map(|t| t.adapter.records())
            .unwrap_or(&[])
    }

    pub fn adapter(&self, key: &TopicKey) -> Option<&SyncedCollectionAdapter> {
        self.topics.get(key).map(|t| &t.adapter)
    }

    pub fn last_error(&self, key: &TopicKey) -> Option<&SubscriptionError> {
        self.topics.get(key).and_then(|t| t.adapter.last_error())
    }

    /// Topic holding a record with this id, confirmed or optimistic.
    pub fn topic_of(&self, record_id: &str) -> Option<TopicKey> {
        self.topics
            .iter()
            .filter(|(_, t)| t.lifecycle != TopicLifecycle::TornDown)
            .find(|(_, t)| t.adapter.find(record_id).is_some())
            .map(|(k, _)| k.clone())
    }

    pub fn live_subscriptions(&self) -> usize {
        self.routes.len()
    }

    pub fn topics(&self) -> Vec<TopicSummary> {
        self.topics
            .iter()
            .map(|(key, t)| TopicSummary {
                key: key.clone(),
                lifecycle: t.lifecycle,
                unread: t.unread.len(),
                records: t.adapter.records().len(),
                active: self.active.as_ref() == Some(key),
            })
            .collect()
    }

    pub fn pop_event(&mut self) -> Option<SyncEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        self.events.drain(..).collect()
    }

    // ===== Selection & feeds =====

    /// Make `key` the active topic, creating and subscribing it on first use.
    /// A subscribe failure leaves the topic selected but `Disconnected`.
    pub async fn select(&mut self, store: &dyn BackingStore, key: TopicKey) -> Result<(), SendError> {
        if self.lifecycle(&key) == TopicLifecycle::TornDown {
            return Err(SendError::TornDown(key));
        }
        self.check_participants(&key)?;
        self.ensure_topic(&key);
        self.active = Some(key.clone());
        self.mark_read(&key);

        if self.lifecycle(&key) == TopicLifecycle::Uninitialized {
            // Failure is reported through the Disconnected event
            let _ = self.open(store, &key).await;
        }
        Ok(())
    }

    /// Open the live feed for `key`. Idempotent while the feed is open.
    pub async fn open(
        &mut self,
        store: &dyn BackingStore,
        key: &TopicKey,
    ) -> Result<Subscription, SubscriptionError> {
        self.check_participants(key)
            .map_err(|e| SubscriptionError::Unavailable(e.to_string()))?;
        self.ensure_topic(key);
        let Some(topic) = self.topics.get_mut(key) else {
            return Err(SubscriptionError::Closed);
        };
        if topic.lifecycle == TopicLifecycle::TornDown {
            return Err(SubscriptionError::Closed);
        }
        if let Some(existing) = topic.adapter.subscription().filter(|s| s.active) {
            return Ok(existing.clone());
        }

        self.next_subscription_id += 1;
        let subscription_id = self.next_subscription_id;
        let sink = FeedSink::new(subscription_id, self.feed_tx.clone());
        let path = topic.path.clone();

        match topic.adapter.open(store, &path, sink).await {
            Ok(subscription) => {
                topic.transition(TopicLifecycle::Subscribed);
                self.routes.insert(subscription_id, key.clone());
                Ok(subscription)
            }
            Err(error) => {
                topic.transition(TopicLifecycle::Disconnected);
                self.events.push_back(SyncEvent::Disconnected {
                    topic: key.clone(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Re-subscribe a disconnected topic.
    pub async fn reconnect(&mut self, store: &dyn BackingStore, key: &TopicKey) -> Result<(), SubscriptionError> {
        if self.lifecycle(key) != TopicLifecycle::Disconnected {
            return Ok(());
        }
        self.open(store, key).await?;
        self.events.push_back(SyncEvent::Reconnected { topic: key.clone() });
        Ok(())
    }

    /// Stop a subscription. It leaves the routing table before upstream
    /// cancellation starts, so nothing queued for it is applied afterwards.
    /// The topic goes `Disconnected` and comes back through `reconnect`.
    pub async fn close(&mut self, subscription_id: SubscriptionId) {
        self.disconnect(subscription_id, SubscriptionError::Closed).await;
    }

    /// Apply one message from the shared feed channel. Returns the store
    /// deletes to issue for our own records that arrived already expired.
    pub async fn handle_feed(&mut self, message: FeedMessage, now: u64) -> Vec<DeleteRequest> {
        let Some(key) = self.routes.get(&message.subscription_id).cloned() else {
            tracing::debug!(subscription_id = message.subscription_id, "dropping message for closed subscription");
            return Vec::new();
        };
        let docs = match message.event {
            FeedEvent::Batch(docs) => docs,
            FeedEvent::Error(error) => {
                self.disconnect(message.subscription_id, error).await;
                return Vec::new();
            }
        };

        let is_active = self.active.as_ref() == Some(&key);
        let Some(topic) = self.topics.get_mut(&key) else {
            return Vec::new();
        };
        let Some(outcome) = topic.adapter.apply_documents(docs, now) else {
            return Vec::new();
        };

        let before = topic.unread.len();
        if !is_active {
            topic.unread.extend(
                outcome
                    .new_records
                    .iter()
                    .filter(|r| r.author_id != self.self_id && !r.is_system())
                    .map(|r| r.id.clone()),
            );
        }
        let unread = topic.settle_unread(before);
        let deletes = if self.config.delete_expired {
            own_deletes(&key, &topic.path, &outcome.expired, &self.self_id)
        } else {
            Vec::new()
        };
        let records = topic.adapter.records().to_vec();

        if let Some(count) = unread {
            self.events.push_back(SyncEvent::UnreadChanged {
                topic: key.clone(),
                count,
            });
        }
        self.events.push_back(SyncEvent::Published {
            topic: key,
            records,
            skipped: outcome.skipped.len(),
        });
        deletes
    }

    // ===== Local intents =====

    /// Optimistically add a record to `key` and hand back the write to issue.
    pub fn send_local(&mut self, key: &TopicKey, local_id: &str, draft: RecordDraft, now: u64) -> Result<WriteRequest, SendError> {
        let app_id = self.config.app_id.clone();
        let topic = self.live_topic(key)?;
        let document = draft.to_document(&app_id);
        topic.adapter.send_local(local_id, draft, now);
        let path = topic.path.clone();
        self.emit_published(key);
        Ok(WriteRequest {
            topic: key.clone(),
            path,
            local_id: local_id.to_string(),
            document,
        })
    }

    pub fn on_write_result(&mut self, key: &TopicKey, local_id: &str, result: Result<String, WriteError>) {
        let Ok(topic) = self.live_topic(key) else {
            return;
        };
        let changed = match &result {
            Ok(remote_id) => topic.adapter.on_write_acked(local_id, remote_id),
            Err(error) => topic.adapter.on_write_failed(local_id, error),
        };
        if let Err(error) = result {
            if changed {
                self.events.push_back(SyncEvent::WriteFailed {
                    topic: key.clone(),
                    local_id: local_id.to_string(),
                    error,
                });
            }
        }
        if changed {
            self.emit_published(key);
        }
    }

    pub fn on_delete_result(&mut self, key: &TopicKey, record_id: &str, result: Result<(), WriteError>) {
        if let Err(error) = result {
            tracing::warn!(topic = %key, record_id, %error, "delete failed");
            self.events.push_back(SyncEvent::DeleteFailed {
                topic: key.clone(),
                record_id: record_id.to_string(),
                error,
            });
        }
    }

    /// Remove a record from `key`. Returns the store delete to issue for
    /// confirmed records, None when it was dropped locally.
    pub fn remove(&mut self, key: &TopicKey, record_id: &str) -> Result<Option<DeleteRequest>, SendError> {
        let topic = self.live_topic(key)?;
        let path = topic.path.clone();
        match topic.adapter.remove(record_id)? {
            RemoveOutcome::Local => {
                self.emit_published(key);
                Ok(None)
            }
            RemoveOutcome::Remote => Ok(Some(DeleteRequest {
                topic: key.clone(),
                path,
                record_id: record_id.to_string(),
            })),
        }
    }

    /// Pull a failed record out for resubmission.
    pub fn take_failed(&mut self, key: &TopicKey, local_id: &str) -> Result<RecordDraft, SendError> {
        let topic = self.live_topic(key)?;
        let draft = topic.adapter.take_failed(local_id)?;
        self.emit_published(key);
        Ok(draft)
    }

    // ===== Timer =====

    /// Run write timeouts and decay for every topic, active or not. Returns
    /// the store deletes to issue for our own expired records.
    pub fn tick(&mut self, now: u64) -> Vec<DeleteRequest> {
        let timeout = self.config.write_timeout_ms;
        let delete_expired = self.config.delete_expired;
        let mut deletes = Vec::new();
        let keys: Vec<TopicKey> = self
            .topics
            .iter()
            .filter(|(_, t)| t.lifecycle != TopicLifecycle::TornDown)
            .map(|(k, _)| k.clone())
            .collect();

        for key in keys {
            let Some(topic) = self.topics.get_mut(&key) else {
                continue;
            };
            let timed_out = topic.adapter.expire_writes(now, timeout);
            let decayed: Vec<Record> = topic.adapter.tick(now);
            let before = topic.unread.len();
            let unread = topic.settle_unread(before);
            if delete_expired {
                deletes.extend(own_deletes(&key, &topic.path, &decayed, &self.self_id));
            }

            for local_id in &timed_out {
                self.events.push_back(SyncEvent::WriteFailed {
                    topic: key.clone(),
                    local_id: local_id.clone(),
                    error: WriteError::TimedOut(timeout),
                });
            }

            let any_decayed = !decayed.is_empty();
            if any_decayed {
                self.events.push_back(SyncEvent::Decayed {
                    topic: key.clone(),
                    records: decayed,
                });
            }
            if let Some(count) = unread {
                self.events.push_back(SyncEvent::UnreadChanged {
                    topic: key.clone(),
                    count,
                });
            }

            if !timed_out.is_empty() || any_decayed {
                self.emit_published(&key);
            }
        }
        deletes
    }

    // ===== Teardown =====

    /// Close the topic's feed and retire it for good.
    pub async fn remove_topic(&mut self, key: &TopicKey) {
        self.routes.retain(|_, k| *k != *key);
        if let Some(topic) = self.topics.get_mut(key) {
            topic.adapter.close().await;
            topic.transition(TopicLifecycle::TornDown);
            topic.unread.clear();
        }
        if self.active.as_ref() == Some(key) {
            self.active = None;
        }
    }

    pub async fn shutdown(&mut self) {
        let keys: Vec<TopicKey> = self.topics.keys().cloned().collect();
        for key in keys {
            self.remove_topic(&key).await;
        }
        tracing::info!("router shut down");
    }

    // ===== Internals =====

    /// Take a subscription off the routing table, then cancel it upstream.
    async fn disconnect(&mut self, subscription_id: SubscriptionId, error: SubscriptionError) {
        let Some(key) = self.routes.remove(&subscription_id) else {
            return;
        };
        let Some(topic) = self.topics.get_mut(&key) else {
            return;
        };
        if !topic.adapter.on_feed_error(error.clone()) {
            return;
        }
        topic.transition(TopicLifecycle::Disconnected);
        if let Some(handle) = topic.adapter.take_feed_handle() {
            handle.cancel().await;
        }
        self.events.push_back(SyncEvent::Disconnected { topic: key, error });
    }

    fn check_participants(&self, key: &TopicKey) -> Result<(), SendError> {
        let TopicKey::Direct(peer) = key else {
            return Ok(());
        };
        match [peer.as_str(), self.self_id.as_str()]
            .into_iter()
            .find(|id| !is_valid_participant(id))
        {
            Some(id) => Err(SendError::InvalidParticipant(id.to_string())),
            None => Ok(()),
        }
    }

    fn ensure_topic(&mut self, key: &TopicKey) {
        if self.topics.contains_key(key) {
            return;
        }
        let path = key.collection_path(&self.config.app_id, &self.self_id);
        tracing::debug!(topic = %key, %path, "creating topic");
        self.topics.insert(
            key.clone(),
            TopicState {
                adapter: SyncedCollectionAdapter::new(key.clone(), self.config.reconcile_window_ms),
                lifecycle: TopicLifecycle::Uninitialized,
                unread: HashSet::new(),
                path,
            },
        );
    }

    fn live_topic(&mut self, key: &TopicKey) -> Result<&mut TopicState, SendError> {
        match self.topics.get_mut(key) {
            None => Err(SendError::UnknownTopic(key.clone())),
            Some(t) if t.lifecycle == TopicLifecycle::TornDown => Err(SendError::TornDown(key.clone())),
            Some(t) => Ok(t),
        }
    }

    fn mark_read(&mut self, key: &TopicKey) {
        if let Some(topic) = self.topics.get_mut(key) {
            if !topic.unread.is_empty() {
                topic.unread.clear();
                self.events.push_back(SyncEvent::UnreadChanged {
                    topic: key.clone(),
                    count: 0,
                });
            }
        }
    }

    fn emit_published(&mut self, key: &TopicKey) {
        if let Some(topic) = self.topics.get(key) {
            self.events.push_back(SyncEvent::Published {
                topic: key.clone(),
                records: topic.adapter.records().to_vec(),
                skipped: 0,
            });
        }
    }
}

fn is_local_id(id: &str) -> bool {
    id.starts_with(crate::constants::LOCAL_ID_PREFIX)
}

/// Store deletes for the records among `records` that we wrote.
fn own_deletes(key: &TopicKey, path: &str, records: &[Record], self_id: &str) -> Vec<DeleteRequest> {
    records
        .iter()
        .filter(|r| r.author_id == self_id && !is_local_id(&r.id))
        .map(|r| DeleteRequest {
            topic: key.clone(),
            path: path.to_string(),
            record_id: r.id.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{feed_channel, InMemoryStore};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    const ME: &str = "me";

    fn setup() -> (TopicRouter, UnboundedReceiver<FeedMessage>, InMemoryStore) {
        let (tx, rx) = feed_channel();
        let router = TopicRouter::new(CoreConfig::new("app"), ME, tx);
        (router, rx, InMemoryStore::new())
    }

    async fn drain(router: &mut TopicRouter, rx: &mut UnboundedReceiver<FeedMessage>, now: u64) {
        while let Ok(message) = rx.try_recv() {
            router.handle_feed(message, now).await;
        }
    }

    fn global_path() -> String {
        TopicKey::Global.collection_path("app", ME)
    }

    #[test]
    fn test_lifecycle_transitions() {
        use TopicLifecycle::*;
        assert!(Uninitialized.can_transition_to(Subscribed));
        assert!(Subscribed.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Subscribed));
        assert!(Subscribed.can_transition_to(TornDown));
        assert!(!TornDown.can_transition_to(Subscribed));
        assert!(!TornDown.can_transition_to(Disconnected));
        assert!(!Subscribed.can_transition_to(Uninitialized));
    }

    #[tokio::test]
    async fn test_select_creates_and_subscribes_lazily() {
        let (mut router, _rx, store) = setup();
        assert_eq!(router.lifecycle(&TopicKey::Global), TopicLifecycle::Uninitialized);

        router.select(&store, TopicKey::Global).await.unwrap();
        assert_eq!(router.lifecycle(&TopicKey::Global), TopicLifecycle::Subscribed);
        assert_eq!(router.active(), Some(&TopicKey::Global));
        assert_eq!(store.watcher_count(&global_path()), 1);
    }

    #[tokio::test]
    async fn test_open_twice_yields_one_subscription() {
        let (mut router, _rx, store) = setup();
        let first = router.open(&store, &TopicKey::Global).await.unwrap();
        let second = router.open(&store, &TopicKey::Global).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(router.live_subscriptions(), 1);
        assert_eq!(store.watcher_count(&global_path()), 1);
    }

    #[tokio::test]
    async fn test_switching_keeps_history() {
        let (mut router, mut rx, store) = setup();
        store.insert_document(&global_path(), "1", json!({ "text": "hi", "userId": "bob", "createdAt": 1 }));

        router.select(&store, TopicKey::Global).await.unwrap();
        drain(&mut router, &mut rx, 10).await;
        assert_eq!(router.records(&TopicKey::Global).len(), 1);

        router.select(&store, TopicKey::direct("peer-1")).await.unwrap();
        router.select(&store, TopicKey::Global).await.unwrap();
        assert_eq!(router.records(&TopicKey::Global).len(), 1);
        assert_eq!(router.lifecycle(&TopicKey::Global), TopicLifecycle::Subscribed);
        assert_eq!(router.live_subscriptions(), 2);
    }

    #[tokio::test]
    async fn test_unread_counts_only_foreign_user_records_while_inactive() {
        let (mut router, mut rx, store) = setup();
        router.select(&store, TopicKey::Global).await.unwrap();
        drain(&mut router, &mut rx, 0).await;
        router.select(&store, TopicKey::direct("peer-1")).await.unwrap();
        drain(&mut router, &mut rx, 0).await;

        let path = global_path();
        store.insert_document(&path, "a", json!({ "text": "1", "userId": "bob", "createdAt": 1 }));
        store.insert_document(&path, "b", json!({ "text": "2", "userId": "bob", "createdAt": 2 }));
        store.insert_document(&path, "c", json!({ "text": "3", "userId": "carol", "createdAt": 3 }));
        store.insert_document(&path, "d", json!({ "text": "mine", "userId": ME, "createdAt": 4 }));
        store.insert_document(&path, "e", json!({ "text": "joined", "userId": "dave", "kind": "system", "createdAt": 5 }));
        drain(&mut router, &mut rx, 10).await;

        assert_eq!(router.unread_count(&TopicKey::Global), 3);
        router.select(&store, TopicKey::Global).await.unwrap();
        assert_eq!(router.unread_count(&TopicKey::Global), 0);
    }

    #[tokio::test]
    async fn test_active_topic_does_not_accumulate_unread() {
        let (mut router, mut rx, store) = setup();
        router.select(&store, TopicKey::Global).await.unwrap();
        store.insert_document(&global_path(), "a", json!({ "text": "1", "userId": "bob", "createdAt": 1 }));
        drain(&mut router, &mut rx, 10).await;
        assert_eq!(router.unread_count(&TopicKey::Global), 0);
    }

    #[tokio::test]
    async fn test_feed_error_disconnects_and_reconnect_resubscribes() {
        let (mut router, mut rx, store) = setup();
        let path = global_path();
        store.insert_document(&path, "1", json!({ "text": "hi", "userId": "bob", "createdAt": 1 }));
        router.select(&store, TopicKey::Global).await.unwrap();
        drain(&mut router, &mut rx, 10).await;
        router.drain_events();

        store.emit_error(&path, SubscriptionError::Unavailable("offline".to_string()));
        drain(&mut router, &mut rx, 10).await;

        assert_eq!(router.lifecycle(&TopicKey::Global), TopicLifecycle::Disconnected);
        assert!(router.last_error(&TopicKey::Global).is_some());
        assert_eq!(router.records(&TopicKey::Global).len(), 1);
        assert_eq!(store.watcher_count(&path), 0);
        assert!(router
            .drain_events()
            .iter()
            .any(|e| matches!(e, SyncEvent::Disconnected { .. })));

        router.reconnect(&store, &TopicKey::Global).await.unwrap();
        assert_eq!(router.lifecycle(&TopicKey::Global), TopicLifecycle::Subscribed);
        assert_eq!(store.watcher_count(&path), 1);
        assert!(router
            .drain_events()
            .iter()
            .any(|e| matches!(e, SyncEvent::Reconnected { .. })));
    }

    #[tokio::test]
    async fn test_denied_subscribe_goes_disconnected() {
        let (mut router, _rx, store) = setup();
        store.deny_path(&global_path());
        router.select(&store, TopicKey::Global).await.unwrap();
        assert_eq!(router.lifecycle(&TopicKey::Global), TopicLifecycle::Disconnected);

        store.allow_path(&global_path());
        router.reconnect(&store, &TopicKey::Global).await.unwrap();
        assert_eq!(router.lifecycle(&TopicKey::Global), TopicLifecycle::Subscribed);
    }

    #[tokio::test]
    async fn test_in_flight_batch_is_dropped_after_close() {
        let (mut router, mut rx, store) = setup();
        let sub = router.open(&store, &TopicKey::Global).await.unwrap();
        drain(&mut router, &mut rx, 0).await;
        let before = router.adapter(&TopicKey::Global).unwrap().publish_count();

        // Already queued when close is called
        store.insert_document(&global_path(), "1", json!({ "text": "late", "userId": "bob" }));
        router.close(sub.id).await;
        drain(&mut router, &mut rx, 0).await;

        assert_eq!(router.adapter(&TopicKey::Global).unwrap().publish_count(), before);
        assert!(router.records(&TopicKey::Global).is_empty());
        assert_eq!(router.live_subscriptions(), 0);
        assert_eq!(router.lifecycle(&TopicKey::Global), TopicLifecycle::Disconnected);
        assert_eq!(router.last_error(&TopicKey::Global), Some(&SubscriptionError::Closed));
        assert_eq!(store.watcher_count(&global_path()), 0);

        router.reconnect(&store, &TopicKey::Global).await.unwrap();
        drain(&mut router, &mut rx, 0).await;
        assert_eq!(router.lifecycle(&TopicKey::Global), TopicLifecycle::Subscribed);
        assert_eq!(router.records(&TopicKey::Global).len(), 1);
    }

    #[tokio::test]
    async fn test_unread_forgets_records_that_leave_history() {
        let (mut router, mut rx, store) = setup();
        router.select(&store, TopicKey::Global).await.unwrap();
        router.select(&store, TopicKey::direct("peer-1")).await.unwrap();
        drain(&mut router, &mut rx, 100).await;
        router.drain_events();

        let path = global_path();
        for id in ["e1", "e2", "e3"] {
            store.insert_document(
                &path,
                id,
                json!({ "text": id, "userId": "bob", "createdAt": 100, "expiresAt": 200 }),
            );
        }
        store.insert_document(&path, "p", json!({ "text": "stays", "userId": "bob", "createdAt": 150 }));
        drain(&mut router, &mut rx, 100).await;
        assert_eq!(router.unread_count(&TopicKey::Global), 4);
        router.drain_events();

        router.tick(200);
        assert_eq!(router.unread_count(&TopicKey::Global), 1);
        assert!(router
            .drain_events()
            .iter()
            .any(|e| matches!(e, SyncEvent::UnreadChanged { count: 1, .. })));

        store.delete(&path, "p").await.unwrap();
        drain(&mut router, &mut rx, 300).await;
        assert_eq!(router.unread_count(&TopicKey::Global), 0);
        assert!(router
            .drain_events()
            .iter()
            .any(|e| matches!(e, SyncEvent::UnreadChanged { count: 0, .. })));
    }

    #[tokio::test]
    async fn test_participant_ids_that_break_the_pair_path_are_rejected() {
        let (mut router, _rx, store) = setup();
        assert_eq!(
            router.select(&store, TopicKey::direct("b__c")).await,
            Err(SendError::InvalidParticipant("b__c".to_string()))
        );
        assert!(router.open(&store, &TopicKey::direct("x/y")).await.is_err());
        assert!(router.topics().is_empty());
        assert_eq!(router.active(), None);

        // "a__b" talking to "c" would share a collection with "a" talking to "b__c"
        let (tx, _other_rx) = feed_channel();
        let mut odd = TopicRouter::new(CoreConfig::new("app"), "a__b", tx);
        assert_eq!(
            odd.select(&store, TopicKey::direct("c")).await,
            Err(SendError::InvalidParticipant("a__b".to_string()))
        );
        odd.select(&store, TopicKey::Global).await.unwrap();
        assert_eq!(odd.lifecycle(&TopicKey::Global), TopicLifecycle::Subscribed);
    }

    #[tokio::test]
    async fn test_remove_topic_is_terminal() {
        let (mut router, _rx, store) = setup();
        router.select(&store, TopicKey::Global).await.unwrap();
        router.remove_topic(&TopicKey::Global).await;

        assert_eq!(router.lifecycle(&TopicKey::Global), TopicLifecycle::TornDown);
        assert_eq!(router.active(), None);
        assert_eq!(store.watcher_count(&global_path()), 0);
        assert_eq!(
            router.select(&store, TopicKey::Global).await,
            Err(SendError::TornDown(TopicKey::Global))
        );
    }

    #[tokio::test]
    async fn test_tick_decays_inactive_topics() {
        let (mut router, mut rx, store) = setup();
        let path = global_path();
        store.insert_document(
            &path,
            "e",
            json!({ "text": "soon gone", "userId": "bob", "createdAt": 1_000, "expiresAt": 6_000 }),
        );
        router.select(&store, TopicKey::Global).await.unwrap();
        drain(&mut router, &mut rx, 1_000).await;
        router.select(&store, TopicKey::direct("peer-1")).await.unwrap();
        router.drain_events();

        let deletes = router.tick(6_001);
        assert!(deletes.is_empty(), "only our own records are deleted");
        assert!(router.records(&TopicKey::Global).is_empty());
        assert!(router
            .drain_events()
            .iter()
            .any(|e| matches!(e, SyncEvent::Decayed { records, .. } if records.len() == 1)));
    }

    #[tokio::test]
    async fn test_tick_requests_delete_for_own_expired_records() {
        let (mut router, mut rx, store) = setup();
        let path = global_path();
        store.insert_document(
            &path,
            "mine",
            json!({ "text": "poof", "userId": ME, "createdAt": 1_000, "expiresAt": 2_000 }),
        );
        router.select(&store, TopicKey::Global).await.unwrap();
        drain(&mut router, &mut rx, 1_000).await;

        let deletes = router.tick(2_000);
        assert_eq!(
            deletes,
            vec![DeleteRequest {
                topic: TopicKey::Global,
                path,
                record_id: "mine".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_own_record_arriving_expired_is_deleted() {
        let (mut router, mut rx, store) = setup();
        let path = global_path();
        store.insert_document(
            &path,
            "stale",
            json!({ "text": "old", "userId": ME, "createdAt": 1_000, "expiresAt": 2_000 }),
        );
        store.insert_document(
            &path,
            "theirs",
            json!({ "text": "old too", "userId": "bob", "createdAt": 1_000, "expiresAt": 2_000 }),
        );
        router.open(&store, &TopicKey::Global).await.unwrap();

        let mut deletes = Vec::new();
        while let Ok(message) = rx.try_recv() {
            deletes.extend(router.handle_feed(message, 5_000).await);
        }
        assert_eq!(
            deletes,
            vec![DeleteRequest {
                topic: TopicKey::Global,
                path,
                record_id: "stale".to_string(),
            }]
        );
        assert!(router.records(&TopicKey::Global).is_empty());
    }

    #[tokio::test]
    async fn test_acked_echo_that_decays_is_deleted_by_store_id() {
        let (mut router, mut rx, store) = setup();
        router.select(&store, TopicKey::Global).await.unwrap();
        drain(&mut router, &mut rx, 1_000).await;

        let draft = RecordDraft {
            author_id: ME.to_string(),
            author_name: ME.to_string(),
            body: "brief".to_string(),
            created_at: 1_000,
            expires_at: Some(2_000),
        };
        router.send_local(&TopicKey::Global, "local-1", draft, 1_000).unwrap();
        router.on_write_result(&TopicKey::Global, "local-1", Ok("doc-7".to_string()));

        assert_eq!(
            router.tick(2_000),
            vec![DeleteRequest {
                topic: TopicKey::Global,
                path: global_path(),
                record_id: "doc-7".to_string(),
            }]
        );
        assert!(router.records(&TopicKey::Global).is_empty());
    }
}
