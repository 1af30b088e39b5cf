//! Live list synchronization: per-topic adapters, decay timers and the
//! router that owns them.

pub mod adapter;
pub mod decay;
pub mod router;

pub use adapter::{BatchOutcome, FeedStatus, RemoveOutcome, Subscription, SyncedCollectionAdapter};
pub use decay::{format_ttl, remaining_ttl, EphemeralDecayScheduler};
pub use router::{DeleteRequest, TopicLifecycle, TopicRouter, TopicSummary, WriteRequest};
