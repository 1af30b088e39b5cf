pub mod display;
pub mod record;
pub mod topic_key;

pub use display::{Delivery, DisplayRecord};
pub use record::{fallback_display_name, Record, RecordDraft, RecordKind};
pub use topic_key::{is_valid_participant, TopicKey};
