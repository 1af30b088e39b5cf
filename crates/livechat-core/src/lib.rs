pub mod backend;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod models;
pub mod session;
pub mod sync;
pub mod tracing_setup;

pub use backend::{BackingStore, InMemoryStore};
pub use config::CoreConfig;
pub use error::{
    ConfigError, CoreError, MalformedRecordError, ReconciliationAmbiguity, SendError,
    SubscriptionError, WriteError,
};
pub use events::SyncEvent;
pub use models::{Delivery, DisplayRecord, Record, RecordKind, TopicKey};
pub use session::{ChatSession, ClientContext, Identity};
