//! livequery persistence: SQLite model store and local query processor.
//!
//! Rows are stored as JSON per `(model_name, id)`. Every committed save or
//! delete is published on the store's change subject while the connection
//! lock is held, so subscribers see changes in commit order.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use livequery_core::{
    ChangeType, DataStoreError, DataStoreResult, FieldValue, Initiator, LastSyncMetadata, Model, ObserveQueryOptions,
    QueryPredicate, QuerySortBy, SqlQueryProcessor, StorageItemChange, SyncType,
};
use livequery_store::ItemChangeSubject;
use metrics::{counter, histogram};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

/// SQLite-backed model store. Simple, synchronous.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
    changes: ItemChangeSubject,
}

impl SqliteStore {
    /// Open `LQ_DB_PATH`, else `$HOME/.livequery/livequery.db`.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("LQ_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        let me = Self::init(db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?)
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS models (
                model_name TEXT NOT NULL,
                id         TEXT NOT NULL,
                data       TEXT NOT NULL,
                PRIMARY KEY (model_name, id)
            )",
            [],
        )
        .context("creating models table")?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS last_sync_metadata (
                model_name     TEXT NOT NULL PRIMARY KEY,
                last_sync_time INTEGER,
                sync_type      TEXT NOT NULL
            )",
            [],
        )
        .context("creating last_sync_metadata table")?;
        Ok(Self { db: Mutex::new(db), changes: ItemChangeSubject::new() })
    }

    fn lock(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subject carrying every committed change of this store.
    pub fn changes(&self) -> ItemChangeSubject { self.changes.clone() }

    /// Save a model on behalf of the application.
    pub fn save<T: Model>(&self, item: &T) -> Result<ChangeType> {
        let raw = serde_json::to_value(item).context("encoding model")?;
        self.save_raw(T::MODEL_NAME, &item.primary_key(), raw, Initiator::DataStoreApi)
    }

    /// Delete a model on behalf of the application. `false` when it was not stored.
    pub fn delete<T: Model>(&self, item: &T) -> Result<bool> {
        self.delete_raw(T::MODEL_NAME, &item.primary_key(), Initiator::DataStoreApi)
    }

    pub fn save_from_sync(&self, model_name: &str, id: &str, item: serde_json::Value) -> Result<ChangeType> {
        self.save_raw(model_name, id, item, Initiator::SyncEngine)
    }

    pub fn delete_from_sync(&self, model_name: &str, id: &str) -> Result<bool> {
        self.delete_raw(model_name, id, Initiator::SyncEngine)
    }

    /// Upsert one row and publish `Create` or `Update` accordingly.
    pub fn save_raw(&self, model_name: &str, id: &str, item: serde_json::Value, initiator: Initiator) -> Result<ChangeType> {
        let started = std::time::Instant::now();
        let data = serde_json::to_string(&item)?;
        let mut db = self.lock();
        let tx = db.transaction()?;
        let existed = tx
            .query_row("SELECT 1 FROM models WHERE model_name = ?1 AND id = ?2", params![model_name, id], |_| Ok(()))
            .optional()?
            .is_some();
        tx.execute(
            "INSERT INTO models(model_name, id, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(model_name, id) DO UPDATE SET data = excluded.data",
            params![model_name, id, data],
        )?;
        tx.commit()?;
        let kind = if existed { ChangeType::Update } else { ChangeType::Create };
        let delivered = self.changes.publish(StorageItemChange::new(model_name, id, kind, initiator, item));
        drop(db);
        histogram!("persist_save_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_save_total", 1u64);
        debug!(model = model_name, id, ?kind, delivered, "saved");
        Ok(kind)
    }

    /// Delete one row and publish `Delete` with the row as it was.
    pub fn delete_raw(&self, model_name: &str, id: &str, initiator: Initiator) -> Result<bool> {
        let mut db = self.lock();
        let tx = db.transaction()?;
        let old: Option<String> = tx
            .query_row("SELECT data FROM models WHERE model_name = ?1 AND id = ?2", params![model_name, id], |r| r.get(0))
            .optional()?;
        let Some(old) = old else {
            return Ok(false);
        };
        tx.execute("DELETE FROM models WHERE model_name = ?1 AND id = ?2", params![model_name, id])?;
        tx.commit()?;
        let item: serde_json::Value = serde_json::from_str(&old).context("decoding stored row")?;
        self.changes.publish(StorageItemChange::new(model_name, id, ChangeType::Delete, initiator, item));
        drop(db);
        counter!("persist_delete_total", 1u64);
        debug!(model = model_name, id, "deleted");
        Ok(true)
    }

    pub fn get_raw(&self, model_name: &str, id: &str) -> Result<Option<serde_json::Value>> {
        let db = self.lock();
        let data: Option<String> = db
            .query_row("SELECT data FROM models WHERE model_name = ?1 AND id = ?2", params![model_name, id], |r| r.get(0))
            .optional()?;
        data.map(|d| serde_json::from_str(&d).context("decoding stored row")).transpose()
    }

    /// All rows of a model in primary key order.
    pub fn list_raw(&self, model_name: &str) -> Result<Vec<serde_json::Value>> {
        let started = std::time::Instant::now();
        let db = self.lock();
        let mut stmt = db.prepare("SELECT data FROM models WHERE model_name = ?1 ORDER BY id")?;
        let mut rows = stmt.query([model_name])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let data: String = row.get(0)?;
            out.push(serde_json::from_str(&data).context("decoding stored row")?);
        }
        histogram!("persist_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    /// Record a completed sync of `model_name` at `time_ms` (Unix millis).
    pub fn record_sync(&self, model_name: &str, sync_type: SyncType, time_ms: i64) -> Result<()> {
        let db = self.lock();
        db.execute(
            "INSERT INTO last_sync_metadata(model_name, last_sync_time, sync_type) VALUES (?1, ?2, ?3)
             ON CONFLICT(model_name) DO UPDATE SET last_sync_time = excluded.last_sync_time, sync_type = excluded.sync_type",
            params![model_name, time_ms, sync_type_str(sync_type)],
        )?;
        debug!(model = model_name, ?sync_type, time_ms, "sync recorded");
        Ok(())
    }

    pub fn sync_metadata(&self, model_name: &str) -> Result<Vec<LastSyncMetadata>> {
        let db = self.lock();
        let mut stmt =
            db.prepare("SELECT model_name, last_sync_time, sync_type FROM last_sync_metadata WHERE model_name = ?1")?;
        let mut rows = stmt.query([model_name])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(2)?;
            out.push(LastSyncMetadata {
                model_name: row.get(0)?,
                last_sync_time: row.get(1)?,
                sync_type: parse_sync_type(&kind)?,
            });
        }
        Ok(out)
    }

    /// Rows matching `options`, filtered and ordered in process.
    pub fn query_raw(&self, model_name: &str, options: &ObserveQueryOptions) -> Result<Vec<serde_json::Value>> {
        let started = std::time::Instant::now();
        let mut rows: Vec<serde_json::Value> =
            self.list_raw(model_name)?.into_iter().filter(|r| options.predicate.matches(r)).collect();
        sort_rows(&mut rows, &options.sort_by);
        histogram!("persist_query_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(rows)
    }
}

fn sort_rows(rows: &mut [serde_json::Value], sort_by: &[QuerySortBy]) {
    if sort_by.is_empty() {
        return;
    }
    let read = |row: &serde_json::Value, f: &str| FieldValue::from_json(row.get(f).unwrap_or(&serde_json::Value::Null));
    rows.sort_by(|a, b| {
        sort_by
            .iter()
            .map(|s| s.direct(read(a, &s.field).ordering(&read(b, &s.field)).unwrap_or(std::cmp::Ordering::Equal)))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn sync_type_str(t: SyncType) -> &'static str {
    match t {
        SyncType::Base => "BASE",
        SyncType::Delta => "DELTA",
    }
}

fn parse_sync_type(s: &str) -> Result<SyncType> {
    match s {
        "BASE" => Ok(SyncType::Base),
        "DELTA" => Ok(SyncType::Delta),
        other => anyhow::bail!("unknown sync type {:?}", other),
    }
}

fn storage(e: anyhow::Error) -> DataStoreError { DataStoreError::Storage(format!("{:#}", e)) }

impl SqlQueryProcessor for SqliteStore {
    fn query_offline_data(&self, model_name: &str, options: &ObserveQueryOptions) -> DataStoreResult<Vec<serde_json::Value>> {
        self.query_raw(model_name, options).map_err(storage)
    }

    fn model_exists(&self, model_name: &str, item_id: &str, predicate: &QueryPredicate) -> DataStoreResult<bool> {
        Ok(self.get_raw(model_name, item_id).map_err(storage)?.map(|r| predicate.matches(&r)).unwrap_or(false))
    }

    fn last_sync_metadata(&self, model_name: &str) -> DataStoreResult<Vec<LastSyncMetadata>> {
        self.sync_metadata(model_name).map_err(storage)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".livequery");
        let _ = std::fs::create_dir_all(&p);
        p.push("livequery.db");
        return p.to_string_lossy().to_string();
    }
    "livequery.db".to_string()
}

pub fn now_ms() -> i64 { chrono::Utc::now().timestamp_millis() }
