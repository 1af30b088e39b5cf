//! Full-state-push store held in memory.
//!
//! Behaves like a live-query document database: every subscriber of a
//! collection gets the whole collection on subscribe and after each change.
//! Used by the REPL and the tests, with knobs for injecting failures and
//! holding deliveries back to simulate a slow network.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{BackingStore, FeedEvent, FeedHandle, FeedSink, RawDocument};
use crate::clock::Clock;
use crate::constants::fields;
use crate::error::{SubscriptionError, WriteError};

struct Watcher {
    watch_id: u64,
    path: String,
    sink: FeedSink,
}

#[derive(Default)]
struct StoreState {
    /// Documents per collection path, in insertion order
    collections: HashMap<String, Vec<RawDocument>>,
    watchers: Vec<Watcher>,
    next_doc_id: u64,
    next_watch_id: u64,
    fail_writes: usize,
    stall_writes: bool,
    write_latency: Option<Duration>,
    denied_paths: HashSet<String>,
    /// Deliveries queued while held, by watch id
    held: Option<Vec<(u64, FeedSink, FeedEvent)>>,
}

impl StoreState {
    fn snapshot(&self, path: &str) -> Vec<RawDocument> {
        self.collections.get(path).cloned().unwrap_or_default()
    }

    /// Push to one watcher, or queue while held. False once the session
    /// behind the sink has gone away.
    fn deliver(&mut self, watch_id: u64, sink: &FeedSink, event: FeedEvent) -> bool {
        match self.held.as_mut() {
            Some(queue) => {
                queue.push((watch_id, sink.clone(), event));
                true
            }
            None => sink.push(event),
        }
    }

    /// Push `event` to every watcher of `path`. Watchers that can no longer
    /// receive are dropped.
    fn broadcast(&mut self, path: &str, event: FeedEvent) {
        let watchers = std::mem::take(&mut self.watchers);
        for watcher in watchers {
            if watcher.path == path && !self.deliver(watcher.watch_id, &watcher.sink, event.clone()) {
                tracing::debug!(path, watch_id = watcher.watch_id, "dropping watcher with closed feed");
                continue;
            }
            self.watchers.push(watcher);
        }
    }

    fn notify(&mut self, path: &str) {
        let snapshot = self.snapshot(path);
        self.broadcast(path, FeedEvent::Batch(snapshot));
    }
}

#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    clock: Clock,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Clock::system())
    }

    /// Server timestamps come from `clock`
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock,
        }
    }

    /// Put a document with a chosen id straight into a collection and notify watchers.
    pub fn insert_document(&self, path: &str, id: impl Into<String>, document: Value) {
        let mut state = self.state.lock();
        state
            .collections
            .entry(path.to_string())
            .or_default()
            .push((id.into(), document));
        state.notify(path);
    }

    pub fn documents(&self, path: &str) -> Vec<RawDocument> {
        self.state.lock().snapshot(path)
    }

    pub fn watcher_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .watchers
            .iter()
            .filter(|w| w.path == path)
            .count()
    }

    /// Reject the next `n` writes
    pub fn fail_next_writes(&self, n: usize) {
        self.state.lock().fail_writes = n;
    }

    /// Writes never resolve while stalled
    pub fn stall_writes(&self, stalled: bool) {
        self.state.lock().stall_writes = stalled;
    }

    pub fn set_write_latency(&self, latency: Option<Duration>) {
        self.state.lock().write_latency = latency;
    }

    pub fn deny_path(&self, path: &str) {
        self.state.lock().denied_paths.insert(path.to_string());
    }

    pub fn allow_path(&self, path: &str) {
        self.state.lock().denied_paths.remove(path);
    }

    /// Push a feed error to every watcher of `path`
    pub fn emit_error(&self, path: &str, error: SubscriptionError) {
        self.state.lock().broadcast(path, FeedEvent::Error(error));
    }

    /// Queue deliveries instead of pushing them, as if the network stalled.
    pub fn hold_deliveries(&self) {
        let mut state = self.state.lock();
        if state.held.is_none() {
            state.held = Some(Vec::new());
        }
    }

    /// Push everything queued while held, in order. Returns how many were pushed.
    pub fn release_deliveries(&self) -> usize {
        let mut state = self.state.lock();
        let queued = state.held.take().unwrap_or_default();
        let count = queued.len();
        let mut gone = HashSet::new();
        for (watch_id, sink, event) in queued {
            if !sink.push(event) {
                gone.insert(watch_id);
            }
        }
        state.watchers.retain(|w| !gone.contains(&w.watch_id));
        count
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for InMemoryStore {
    fn subscribe<'a>(
        &'a self,
        path: &'a str,
        sink: FeedSink,
    ) -> BoxFuture<'a, Result<FeedHandle, SubscriptionError>> {
        Box::pin(async move {
            let watch_id = {
                let mut state = self.state.lock();
                if state.denied_paths.contains(path) {
                    return Err(SubscriptionError::PermissionDenied(path.to_string()));
                }
                state.next_watch_id += 1;
                let watch_id = state.next_watch_id;
                state.watchers.push(Watcher {
                    watch_id,
                    path: path.to_string(),
                    sink: sink.clone(),
                });
                let snapshot = state.snapshot(path);
                if !state.deliver(watch_id, &sink, FeedEvent::Batch(snapshot)) {
                    state.watchers.retain(|w| w.watch_id != watch_id);
                }
                watch_id
            };

            let state = self.state.clone();
            Ok(FeedHandle::new(move || {
                Box::pin(async move {
                    state.lock().watchers.retain(|w| w.watch_id != watch_id);
                })
            }))
        })
    }

    fn write<'a>(
        &'a self,
        path: &'a str,
        mut document: Value,
    ) -> BoxFuture<'a, Result<String, WriteError>> {
        Box::pin(async move {
            let (stalled, latency) = {
                let state = self.state.lock();
                (state.stall_writes, state.write_latency)
            };
            if stalled {
                futures::future::pending::<()>().await;
            }
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            let mut state = self.state.lock();
            if state.fail_writes > 0 {
                state.fail_writes -= 1;
                return Err(WriteError::Rejected("injected failure".to_string()));
            }

            // Server timestamp
            if let Some(obj) = document.as_object_mut() {
                let unset = obj.get(fields::CREATED_AT).map_or(true, Value::is_null);
                if unset {
                    obj.insert(fields::CREATED_AT.to_string(), json!(self.clock.now_ms()));
                }
            }

            state.next_doc_id += 1;
            let id = format!("doc-{}", state.next_doc_id);
            state
                .collections
                .entry(path.to_string())
                .or_default()
                .push((id.clone(), document));
            state.notify(path);
            Ok(id)
        })
    }

    fn delete<'a>(
        &'a self,
        path: &'a str,
        record_id: &'a str,
    ) -> BoxFuture<'a, Result<(), WriteError>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            let docs = state
                .collections
                .get_mut(path)
                .ok_or_else(|| WriteError::NotFound(record_id.to_string()))?;
            let before = docs.len();
            docs.retain(|(id, _)| id != record_id);
            if docs.len() == before {
                return Err(WriteError::NotFound(record_id.to_string()));
            }
            state.notify(path);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{feed_channel, FeedMessage};
    use tokio::sync::mpsc::UnboundedReceiver;

    const PATH: &str = "artifacts/app/public/data/messages";

    fn batch_len(message: FeedMessage) -> usize {
        match message.event {
            FeedEvent::Batch(docs) => docs.len(),
            FeedEvent::Error(e) => panic!("unexpected error {e}"),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<FeedMessage>) -> Vec<FeedMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[tokio::test]
    async fn test_subscribe_pushes_initial_snapshot() {
        let store = InMemoryStore::new();
        store.insert_document(PATH, "a", json!({ "text": "hi", "userId": "u" }));

        let (tx, mut rx) = feed_channel();
        let _handle = store.subscribe(PATH, FeedSink::new(7, tx)).await.unwrap();

        let message = rx.try_recv().unwrap();
        assert_eq!(message.subscription_id, 7);
        assert_eq!(batch_len(message), 1);
    }

    #[tokio::test]
    async fn test_write_stamps_and_notifies() {
        let store = InMemoryStore::with_clock(Clock::starting_at(42));
        let (tx, mut rx) = feed_channel();
        let _handle = store.subscribe(PATH, FeedSink::new(1, tx)).await.unwrap();
        drain(&mut rx);

        let id = store
            .write(PATH, json!({ "text": "hi", "userId": "u", "createdAt": null }))
            .await
            .unwrap();
        assert_eq!(id, "doc-1");
        assert_eq!(store.documents(PATH)[0].1["createdAt"], json!(42));
        assert_eq!(batch_len(rx.try_recv().unwrap()), 1);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = InMemoryStore::new();
        store.fail_next_writes(1);
        let first = store.write(PATH, json!({ "text": "a", "userId": "u" })).await;
        assert!(matches!(first, Err(WriteError::Rejected(_))));
        let second = store.write(PATH, json!({ "text": "b", "userId": "u" })).await;
        assert!(second.is_ok());
        assert_eq!(store.documents(PATH).len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_deliveries() {
        let store = InMemoryStore::new();
        let (tx, mut rx) = feed_channel();
        let handle = store.subscribe(PATH, FeedSink::new(1, tx)).await.unwrap();
        assert_eq!(store.watcher_count(PATH), 1);
        handle.cancel().await;
        assert_eq!(store.watcher_count(PATH), 0);
        drain(&mut rx);

        store.insert_document(PATH, "x", json!({ "text": "late", "userId": "u" }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watchers_of_dropped_sessions_are_pruned() {
        let store = InMemoryStore::new();
        let (tx, rx) = feed_channel();
        let _handle = store.subscribe(PATH, FeedSink::new(1, tx)).await.unwrap();
        let (other_tx, mut other_rx) = feed_channel();
        let _other = store.subscribe(PATH, FeedSink::new(2, other_tx)).await.unwrap();
        assert_eq!(store.watcher_count(PATH), 2);

        drop(rx);
        store.insert_document(PATH, "a", json!({ "text": "a", "userId": "u" }));
        assert_eq!(store.watcher_count(PATH), 1);
        assert_eq!(drain(&mut other_rx).len(), 2);
    }

    #[tokio::test]
    async fn test_denied_path() {
        let store = InMemoryStore::new();
        store.deny_path(PATH);
        let (tx, _rx) = feed_channel();
        let result = store.subscribe(PATH, FeedSink::new(1, tx)).await;
        assert!(matches!(result, Err(SubscriptionError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_hold_and_release() {
        let store = InMemoryStore::new();
        let (tx, mut rx) = feed_channel();
        let _handle = store.subscribe(PATH, FeedSink::new(1, tx)).await.unwrap();
        drain(&mut rx);

        store.hold_deliveries();
        store.insert_document(PATH, "a", json!({ "text": "a", "userId": "u" }));
        store.emit_error(PATH, SubscriptionError::Unavailable("net".to_string()));
        assert!(rx.try_recv().is_err());

        assert_eq!(store.release_deliveries(), 2);
        let delivered = drain(&mut rx);
        assert!(matches!(delivered[0].event, FeedEvent::Batch(_)));
        assert!(matches!(delivered[1].event, FeedEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryStore::new();
        store.insert_document(PATH, "a", json!({ "text": "a", "userId": "u" }));
        store.delete(PATH, "a").await.unwrap();
        assert!(store.documents(PATH).is_empty());
        assert!(matches!(
            store.delete(PATH, "a").await,
            Err(WriteError::NotFound(_))
        ));
    }
}
