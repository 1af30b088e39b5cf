use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Wall-clock milliseconds anchored on a tokio `Instant`, so paused test
/// runtimes advance it with `tokio::time::advance`.
#[derive(Clone, Debug)]
pub struct Clock {
    base_ms: u64,
    start: Instant,
}

impl Clock {
    pub fn system() -> Self {
        Self::starting_at(system_now_ms())
    }

    pub fn starting_at(base_ms: u64) -> Self {
        Self {
            base_ms,
            start: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.base_ms + self.start.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

pub fn system_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
