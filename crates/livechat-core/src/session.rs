//! The session driver.
//!
//! `ChatSession` is the single execution context of the client: it owns the
//! topic router, the feed channel every subscription pushes into, the set of
//! store writes and deletes in flight, and the decay/timeout timer. Nothing
//! else mutates the data model.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::backend::{feed_channel, BackingStore, FeedMessage};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::constants::LOCAL_ID_PREFIX;
use crate::error::{SendError, SubscriptionError, WriteError};
use crate::events::SyncEvent;
use crate::models::{fallback_display_name, DisplayRecord, RecordDraft, TopicKey};
use crate::sync::{DeleteRequest, TopicLifecycle, TopicRouter, TopicSummary, WriteRequest};

/// Who the local user is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    /// Without a display name the user shows up as `User-<first 5 chars of id>`.
    pub fn new(user_id: impl Into<String>, display_name: Option<String>) -> Self {
        let user_id = user_id.into();
        let display_name = display_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| fallback_display_name(&user_id));
        Self {
            user_id,
            display_name,
        }
    }
}

/// Everything a session needs, passed in explicitly.
#[derive(Clone)]
pub struct ClientContext {
    pub config: CoreConfig,
    pub store: Arc<dyn BackingStore>,
    pub identity: Identity,
    pub clock: Clock,
}

impl ClientContext {
    pub fn new(config: CoreConfig, store: Arc<dyn BackingStore>, identity: Identity) -> Self {
        Self {
            config,
            store,
            identity,
            clock: Clock::system(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

enum StoreOutcome {
    Write {
        topic: TopicKey,
        local_id: String,
        result: Result<String, WriteError>,
    },
    Delete {
        topic: TopicKey,
        record_id: String,
        result: Result<(), WriteError>,
    },
}

pub struct ChatSession {
    ctx: ClientContext,
    router: TopicRouter,
    feed_rx: UnboundedReceiver<FeedMessage>,
    in_flight: FuturesUnordered<BoxFuture<'static, StoreOutcome>>,
    ticker: Interval,
}

impl ChatSession {
    /// Build the session and open the global topic, which starts out active.
    pub async fn start(ctx: ClientContext) -> Self {
        let (feed_tx, feed_rx) = feed_channel();
        let router = TopicRouter::new(ctx.config.clone(), ctx.identity.user_id.clone(), feed_tx);

        let mut ticker = tokio::time::interval(ctx.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            user_id = %ctx.identity.user_id,
            app_id = %ctx.config.app_id,
            "session started"
        );

        let mut session = Self {
            ctx,
            router,
            feed_rx,
            in_flight: FuturesUnordered::new(),
            ticker,
        };
        // A failed subscribe is reported as a Disconnected event
        let _ = session.select(TopicKey::Global).await;
        session
    }

    pub fn identity(&self) -> &Identity {
        &self.ctx.identity
    }

    pub fn config(&self) -> &CoreConfig {
        &self.ctx.config
    }

    pub fn now(&self) -> u64 {
        self.ctx.clock.now_ms()
    }

    // ===== Driving =====

    /// Wait for the next thing observers need to know about. Feed messages,
    /// finished writes and timer ticks are processed as they come.
    ///
    /// Returns None once the session has shut down.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        loop {
            if let Some(event) = self.router.pop_event() {
                return Some(event);
            }

            tokio::select! {
                message = self.feed_rx.recv() => match message {
                    Some(message) => self.apply_feed(message).await,
                    None => return None,
                },
                Some(outcome) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.apply_outcome(outcome);
                }
                _ = self.ticker.tick() => {
                    self.tick_now();
                }
            }
        }
    }

    /// Process whatever is ready right now without waiting, then hand back
    /// the events that produced.
    pub async fn pump(&mut self) -> Vec<SyncEvent> {
        loop {
            let mut progressed = false;

            while let Ok(message) = self.feed_rx.try_recv() {
                self.apply_feed(message).await;
                progressed = true;
            }
            while let Some(Some(outcome)) = self.in_flight.next().now_or_never() {
                self.apply_outcome(outcome);
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
        self.router.drain_events()
    }

    /// Run write timeouts and decay now, outside the timer.
    pub fn tick_now(&mut self) {
        let now = self.now();
        for request in self.router.tick(now) {
            self.spawn_delete(request);
        }
    }

    // ===== Intents =====

    /// Send a message to the active topic. It shows up at once as pending.
    /// Returns the local id of the optimistic record.
    pub fn send(&mut self, text: &str) -> Result<String, SendError> {
        self.send_with_expiry(text, None)
    }

    /// Send a message that decays `ttl` after it was sent.
    pub fn send_ephemeral(&mut self, text: &str, ttl: Duration) -> Result<String, SendError> {
        let expires_at = u64::try_from(ttl.as_millis())
            .ok()
            .and_then(|ms| self.now().checked_add(ms))
            .ok_or(SendError::TtlTooLong)?;
        self.send_with_expiry(text, Some(expires_at))
    }

    fn send_with_expiry(&mut self, text: &str, expires_at: Option<u64>) -> Result<String, SendError> {
        let body = self.validate(text)?;
        let topic = self.router.active().cloned().ok_or(SendError::NoActiveTopic)?;
        let now = self.now();
        let draft = RecordDraft {
            author_id: self.ctx.identity.user_id.clone(),
            author_name: self.ctx.identity.display_name.clone(),
            body,
            created_at: now,
            expires_at,
        };
        self.dispatch(&topic, draft, now)
    }

    /// Send a failed message again under a new local id.
    pub fn resubmit(&mut self, local_id: &str) -> Result<String, SendError> {
        let topic = self
            .router
            .topic_of(local_id)
            .ok_or_else(|| SendError::UnknownRecord(local_id.to_string()))?;
        let mut draft = self.router.take_failed(&topic, local_id)?;

        // Keep the original time-to-live
        let now = self.now();
        draft.expires_at = draft
            .expires_at
            .map(|at| now.saturating_add(at.saturating_sub(draft.created_at)));
        draft.created_at = now;
        tracing::info!(topic = %topic, local_id, "resubmitting failed message");
        self.dispatch(&topic, draft, now)
    }

    /// Remove a record: confirmed ones are deleted in the store, failed
    /// optimistic ones are dropped locally.
    pub fn remove(&mut self, record_id: &str) -> Result<(), SendError> {
        let topic = self
            .router
            .topic_of(record_id)
            .ok_or_else(|| SendError::UnknownRecord(record_id.to_string()))?;
        if let Some(request) = self.router.remove(&topic, record_id)? {
            self.spawn_delete(request);
        }
        Ok(())
    }

    pub async fn select(&mut self, key: TopicKey) -> Result<(), SendError> {
        let store = self.ctx.store.clone();
        self.router.select(store.as_ref(), key).await
    }

    /// Re-subscribe the topic if it is disconnected.
    pub async fn reconnect(&mut self, key: &TopicKey) -> Result<(), SubscriptionError> {
        let store = self.ctx.store.clone();
        self.router.reconnect(store.as_ref(), key).await
    }

    /// Close the topic for good.
    pub async fn remove_topic(&mut self, key: &TopicKey) {
        self.router.remove_topic(key).await;
    }

    // ===== Queries =====

    pub fn active(&self) -> Option<&TopicKey> {
        self.router.active()
    }

    pub fn records(&self, key: &TopicKey) -> &[DisplayRecord] {
        self.router.records(key)
    }

    pub fn active_records(&self) -> &[DisplayRecord] {
        match self.router.active() {
            Some(key) => self.router.records(key),
            None => &[],
        }
    }

    pub fn unread_count(&self, key: &TopicKey) -> usize {
        self.router.unread_count(key)
    }

    pub fn lifecycle(&self, key: &TopicKey) -> TopicLifecycle {
        self.router.lifecycle(key)
    }

    pub fn last_error(&self, key: &TopicKey) -> Option<&SubscriptionError> {
        self.router.last_error(key)
    }

    pub fn topics(&self) -> Vec<TopicSummary> {
        self.router.topics()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// Close every subscription and tear all topics down. Writes still in
    /// flight are abandoned.
    pub async fn shutdown(&mut self) {
        self.router.shutdown().await;
        self.in_flight.clear();
        self.feed_rx.close();
        tracing::info!("session shut down");
    }

    // ===== Internals =====

    fn validate(&self, text: &str) -> Result<String, SendError> {
        let body = text.trim();
        if body.is_empty() {
            return Err(SendError::EmptyBody);
        }
        let len = body.chars().count();
        let max = self.ctx.config.max_body_len;
        if len > max {
            return Err(SendError::TooLong { len, max });
        }
        Ok(body.to_string())
    }

    fn dispatch(&mut self, topic: &TopicKey, draft: RecordDraft, now: u64) -> Result<String, SendError> {
        let local_id = format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4());
        let request = self.router.send_local(topic, &local_id, draft, now)?;
        tracing::debug!(topic = %topic, %local_id, "optimistic send");
        self.spawn_write(request);
        Ok(local_id)
    }

    fn spawn_write(&mut self, request: WriteRequest) {
        let store = self.ctx.store.clone();
        self.in_flight.push(
            async move {
                let result = store.write(&request.path, request.document).await;
                StoreOutcome::Write {
                    topic: request.topic,
                    local_id: request.local_id,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn spawn_delete(&mut self, request: DeleteRequest) {
        let store = self.ctx.store.clone();
        self.in_flight.push(
            async move {
                let result = store.delete(&request.path, &request.record_id).await;
                StoreOutcome::Delete {
                    topic: request.topic,
                    record_id: request.record_id,
                    result,
                }
            }
            .boxed(),
        );
    }

    async fn apply_feed(&mut self, message: FeedMessage) {
        let now = self.now();
        for request in self.router.handle_feed(message, now).await {
            self.spawn_delete(request);
        }
    }

    fn apply_outcome(&mut self, outcome: StoreOutcome) {
        match outcome {
            StoreOutcome::Write {
                topic,
                local_id,
                result,
            } => self.router.on_write_result(&topic, &local_id, result),
            StoreOutcome::Delete {
                topic,
                record_id,
                result,
            } => self.router.on_delete_result(&topic, &record_id, result),
        }
    }
}
