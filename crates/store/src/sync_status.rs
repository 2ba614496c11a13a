//! Whether a model's local cache counts as fully synced.

use std::sync::Arc;
use std::time::Duration;

use livequery_core::{DataStoreError, DataStoreResult, LastSyncMetadata, SqlQueryProcessor};
use tracing::warn;

use crate::config::env_parse;

/// Base syncs older than this are considered stale.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub trait SyncStatus: Send + Sync {
    /// `true` when the last sync of `model_name` is recent enough. Errors are
    /// handed to `on_error` and read as "not synced".
    fn get(&self, model_name: &str, on_error: &dyn Fn(DataStoreError)) -> bool;
}

/// Sync status backed by the `last sync` metadata rows of the local store.
pub struct MetadataSyncStatus {
    processor: Arc<dyn SqlQueryProcessor>,
    sync_interval: Duration,
}

impl MetadataSyncStatus {
    pub fn new(processor: Arc<dyn SqlQueryProcessor>, sync_interval: Duration) -> Self {
        Self { processor, sync_interval }
    }

    /// Interval from `LQ_SYNC_INTERVAL_MS`, else [`DEFAULT_SYNC_INTERVAL`].
    pub fn from_env(processor: Arc<dyn SqlQueryProcessor>) -> Self {
        let interval = env_parse::<u64>("LQ_SYNC_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SYNC_INTERVAL);
        Self::new(processor, interval)
    }

    pub fn sync_interval(&self) -> Duration { self.sync_interval }

    pub fn check(&self, model_name: &str) -> DataStoreResult<bool> {
        self.check_at(model_name, chrono::Utc::now().timestamp_millis())
    }

    fn check_at(&self, model_name: &str, now_ms: i64) -> DataStoreResult<bool> {
        let rows = self.processor.last_sync_metadata(model_name)?;
        match rows.as_slice() {
            [] => Ok(false),
            [row] => Ok(is_recent(row, self.sync_interval, now_ms)),
            many => Err(DataStoreError::AmbiguousSyncMetadata { model: model_name.to_string(), found: many.len() }),
        }
    }
}

fn is_recent(row: &LastSyncMetadata, interval: Duration, now_ms: i64) -> bool {
    let window = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
    row.last_sync_time.map(|t| now_ms.saturating_sub(t) <= window).unwrap_or(false)
}

impl SyncStatus for MetadataSyncStatus {
    fn get(&self, model_name: &str, on_error: &dyn Fn(DataStoreError)) -> bool {
        match self.check(model_name) {
            Ok(synced) => synced,
            Err(e) => {
                warn!(model = %model_name, error = %e, "sync status unavailable; treating as not synced");
                on_error(e);
                false
            }
        }
    }
}
