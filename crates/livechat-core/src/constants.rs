//! Application-wide constants
//!
//! Centralized location for collection path segments, document field names
//! and default tuning values shared across modules.

/// App id used when none is configured
pub const DEFAULT_APP_ID: &str = "default-app-id";

/// Author id reserved for system notices (joins, topic banners)
pub const SYSTEM_AUTHOR_ID: &str = "system";

/// Prefix of ids assigned to optimistic records before the store confirms them
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Sentinel shown by `format_ttl` once an ephemeral record has run out
pub const EXPIRED_LABEL: &str = "expired";

/// Number of user id characters used for the fallback display name
pub const DISPLAY_NAME_ID_CHARS: usize = 5;

// Timing defaults (milliseconds)
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 10_000;
/// Confirmed and optimistic copies of one message further apart than this are not matched
pub const DEFAULT_RECONCILE_WINDOW_MS: u64 = 60_000;

pub const DEFAULT_MAX_BODY_LEN: usize = 2000;

// Collection path segments: artifacts/{app_id}/public/data/messages
pub mod paths {
    pub const ROOT: &str = "artifacts";
    pub const PUBLIC: &str = "public";
    pub const PUBLIC_DATA: &str = "data";
    pub const PRIVATE: &str = "private";
    pub const MESSAGES: &str = "messages";
    /// Joins the two sorted participant ids of a private conversation
    pub const PAIR_SEPARATOR: &str = "__";
}

// Document field names as written by the backing store
pub mod fields {
    pub const TEXT: &str = "text";
    pub const USER_ID: &str = "userId";
    pub const USER_NAME: &str = "userName";
    pub const CREATED_AT: &str = "createdAt";
    pub const EXPIRES_AT: &str = "expiresAt";
    pub const KIND: &str = "kind";
    pub const APP_ID: &str = "appId";
}
