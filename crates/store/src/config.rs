//! Batching thresholds for observed queries.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_MAX_RECORDS: usize = 1_000;
pub const DEFAULT_MAX_TIME: Duration = Duration::from_secs(2);
/// Shortest accepted flush window; a zero window would spin the timer.
pub const MIN_MAX_TIME: Duration = Duration::from_millis(1);

/// Flush policy: a snapshot is emitted when `max_records` changes are pending
/// or, with changes pending, `max_time` has passed since the last flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveQueryConfig {
    pub max_records: usize,
    pub max_time: Duration,
    /// Once a snapshot reported the model as synced, flush every change right away.
    pub emit_when_synced: bool,
}

impl Default for ObserveQueryConfig {
    fn default() -> Self {
        Self { max_records: DEFAULT_MAX_RECORDS, max_time: DEFAULT_MAX_TIME, emit_when_synced: true }
    }
}

impl ObserveQueryConfig {
    /// Read `LQ_OBSERVE_MAX_RECORDS`, `LQ_OBSERVE_MAX_TIME_MS` and
    /// `LQ_OBSERVE_EMIT_WHEN_SYNCED`, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_records: env_parse("LQ_OBSERVE_MAX_RECORDS").unwrap_or(d.max_records).max(1),
            max_time: env_parse::<u64>("LQ_OBSERVE_MAX_TIME_MS").map(Duration::from_millis).unwrap_or(d.max_time).max(MIN_MAX_TIME),
            emit_when_synced: env_parse("LQ_OBSERVE_EMIT_WHEN_SYNCED").unwrap_or(d.emit_when_synced),
        }
    }

    pub fn with_max_records(mut self, n: usize) -> Self {
        self.max_records = n.max(1);
        self
    }

    pub fn with_max_time(mut self, t: Duration) -> Self {
        self.max_time = t.max(MIN_MAX_TIME);
        self
    }

    pub fn with_emit_when_synced(mut self, on: bool) -> Self {
        self.emit_when_synced = on;
        self
    }
}

pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable env override");
            None
        }
    }
}
