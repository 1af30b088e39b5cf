use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_APP_ID, DEFAULT_MAX_BODY_LEN, DEFAULT_RECONCILE_WINDOW_MS, DEFAULT_TICK_INTERVAL_MS,
    DEFAULT_WRITE_TIMEOUT_MS,
};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Namespaces every collection path in the backing store
    pub app_id: String,
    /// Period of the decay / write-timeout timer
    pub tick_interval_ms: u64,
    /// Optimistic records unconfirmed for longer than this are marked failed
    pub write_timeout_ms: u64,
    /// Max distance between an optimistic and a confirmed copy for them to be matched
    pub reconcile_window_ms: u64,
    pub max_body_len: usize,
    /// Delete our own ephemeral records from the store once they expire
    pub delete_expired: bool,
}

impl CoreConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Overlay `LIVECHAT_APP_ID`, `LIVECHAT_TICK_MS` and `LIVECHAT_WRITE_TIMEOUT_MS`.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_vars(|key| std::env::var(key).ok())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    fn with_vars(mut self, get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(app_id) = get("LIVECHAT_APP_ID").filter(|v| !v.is_empty()) {
            self.app_id = app_id;
        }
        if let Some(value) = get("LIVECHAT_TICK_MS") {
            self.tick_interval_ms = parse_ms("LIVECHAT_TICK_MS", value)?;
        }
        if let Some(value) = get("LIVECHAT_WRITE_TIMEOUT_MS") {
            self.write_timeout_ms = parse_ms("LIVECHAT_WRITE_TIMEOUT_MS", value)?;
        }
        Ok(self)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn parse_ms(key: &'static str, value: String) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(ms),
        _ => Err(ConfigError::InvalidEnv { key, value }),
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            reconcile_window_ms: DEFAULT_RECONCILE_WINDOW_MS,
            max_body_len: DEFAULT_MAX_BODY_LEN,
            delete_expired: true,
        }
    }
}
