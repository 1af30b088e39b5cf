//! Seam between the sync core and the external backing store.
//!
//! The store is an opaque collaborator with three operations: a live-query
//! `subscribe` that pushes full-state snapshots, and asynchronous `write` and
//! `delete`. Everything it pushes goes through one [`FeedSink`] channel per
//! session so delivery order is preserved.

pub mod memory;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::error::{SubscriptionError, WriteError};

pub use memory::InMemoryStore;

/// Identifies one live subscription in the session's routing table.
pub type SubscriptionId = u64;

/// One document of a snapshot: (store-assigned id, raw document)
pub type RawDocument = (String, Value);

#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Full state of the collection; not a diff
    Batch(Vec<RawDocument>),
    Error(SubscriptionError),
}

#[derive(Debug, Clone)]
pub struct FeedMessage {
    pub subscription_id: SubscriptionId,
    pub event: FeedEvent,
}

/// Where a store pushes snapshots for one subscription.
#[derive(Debug, Clone)]
pub struct FeedSink {
    subscription_id: SubscriptionId,
    tx: UnboundedSender<FeedMessage>,
}

impl FeedSink {
    pub fn new(subscription_id: SubscriptionId, tx: UnboundedSender<FeedMessage>) -> Self {
        Self {
            subscription_id,
            tx,
        }
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Returns false once the session side has gone away.
    pub fn push(&self, event: FeedEvent) -> bool {
        self.tx
            .send(FeedMessage {
                subscription_id: self.subscription_id,
                event,
            })
            .is_ok()
    }

    pub fn push_batch(&self, docs: Vec<RawDocument>) -> bool {
        self.push(FeedEvent::Batch(docs))
    }

    pub fn push_error(&self, error: SubscriptionError) -> bool {
        self.push(FeedEvent::Error(error))
    }
}

pub fn feed_channel() -> (UnboundedSender<FeedMessage>, UnboundedReceiver<FeedMessage>) {
    tokio::sync::mpsc::unbounded_channel()
}

type CancelFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Upstream unsubscribe handle returned by [`BackingStore::subscribe`].
pub struct FeedHandle {
    cancel: Option<CancelFn>,
}

impl FeedHandle {
    pub fn new(cancel: impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel upstream
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Ask the store to stop pushing and wait until it has.
    pub async fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel().await;
        }
    }
}

impl std::fmt::Debug for FeedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

pub trait BackingStore: Send + Sync {
    /// Start a live query on `path`. The store pushes the current state right
    /// away and again after every change.
    fn subscribe<'a>(
        &'a self,
        path: &'a str,
        sink: FeedSink,
    ) -> BoxFuture<'a, Result<FeedHandle, SubscriptionError>>;

    /// Add a document; resolves to the id the store assigned.
    fn write<'a>(&'a self, path: &'a str, document: Value) -> BoxFuture<'a, Result<String, WriteError>>;

    fn delete<'a>(&'a self, path: &'a str, record_id: &'a str) -> BoxFuture<'a, Result<(), WriteError>>;
}
