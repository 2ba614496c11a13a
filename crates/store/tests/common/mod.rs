#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use livequery_core::prelude::*;
use livequery_store::{
    ItemChangeSubject, ObservationHandle, ObserveEvent, ObserveQueryConfig, ObserveQueryExecutor, SyncStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlogOwner {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub wea: Option<String>,
    #[serde(default)]
    pub rating: Option<i64>,
}

impl BlogOwner {
    pub fn new(id: &str, name: &str) -> Self {
        Self { id: id.into(), name: name.into(), wea: None, rating: None }
    }

    pub fn rated(mut self, rating: i64) -> Self {
        self.rating = Some(rating);
        self
    }
}

impl Model for BlogOwner {
    const MODEL_NAME: &'static str = "BlogOwner";
    fn primary_key(&self) -> String { self.id.clone() }
    fn field_accessor(field: &str) -> Option<FieldAccessor<Self>> {
        match field {
            "id" => Some(|b: &BlogOwner| FieldValue::from(b.id.as_str())),
            "name" => Some(|b: &BlogOwner| FieldValue::from(b.name.as_str())),
            "wea" => Some(|b: &BlogOwner| FieldValue::from(b.wea.clone())),
            "rating" => Some(|b: &BlogOwner| FieldValue::from(b.rating)),
            _ => None,
        }
    }
}

type QueryHook = Box<dyn FnOnce(&MemStore) + Send>;

/// In-memory rows of a single model, queried the way the local store would.
#[derive(Default)]
pub struct MemStore {
    rows: Mutex<BTreeMap<String, serde_json::Value>>,
    pub fail_query: AtomicBool,
    pub fail_exists: AtomicBool,
    pub queries: AtomicUsize,
    /// Runs once, after the next baseline query has read its rows.
    pub after_query: Mutex<Option<QueryHook>>,
}

impl MemStore {
    pub fn put(&self, owner: &BlogOwner) -> bool {
        let raw = serde_json::to_value(owner).unwrap();
        self.rows.lock().unwrap().insert(owner.id.clone(), raw).is_some()
    }

    pub fn remove(&self, id: &str) -> Option<serde_json::Value> { self.rows.lock().unwrap().remove(id) }
}

impl SqlQueryProcessor for MemStore {
    fn query_offline_data(&self, model_name: &str, options: &ObserveQueryOptions) -> DataStoreResult<Vec<serde_json::Value>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_query.load(Ordering::SeqCst) {
            return Err(DataStoreError::Storage("query failed".into()));
        }
        if model_name != BlogOwner::MODEL_NAME {
            return Ok(Vec::new());
        }
        let mut out: Vec<serde_json::Value> =
            self.rows.lock().unwrap().values().filter(|r| options.predicate.matches(r)).cloned().collect();
        out.sort_by(|a, b| {
            for s in options.sort_by.iter() {
                let va = FieldValue::from_json(a.get(&s.field).unwrap_or(&serde_json::Value::Null));
                let vb = FieldValue::from_json(b.get(&s.field).unwrap_or(&serde_json::Value::Null));
                let ord = s.direct(va.ordering(&vb).unwrap_or(std::cmp::Ordering::Equal));
                if ord.is_ne() {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        let hook = self.after_query.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(self);
        }
        Ok(out)
    }

    fn model_exists(&self, _model_name: &str, item_id: &str, predicate: &QueryPredicate) -> DataStoreResult<bool> {
        if self.fail_exists.load(Ordering::SeqCst) {
            return Err(DataStoreError::Storage("exists failed".into()));
        }
        Ok(self.rows.lock().unwrap().get(item_id).map(|r| predicate.matches(r)).unwrap_or(false))
    }

    fn last_sync_metadata(&self, _model_name: &str) -> DataStoreResult<Vec<LastSyncMetadata>> { Ok(Vec::new()) }
}

#[derive(Default)]
pub struct FixedSync(pub AtomicBool);

impl SyncStatus for FixedSync {
    fn get(&self, _model_name: &str, _on_error: &dyn Fn(DataStoreError)) -> bool { self.0.load(Ordering::SeqCst) }
}

/// Store rows, change subject and sync status wired together.
pub struct Harness {
    pub store: Arc<MemStore>,
    pub subject: ItemChangeSubject,
    pub sync: Arc<FixedSync>,
}

impl Harness {
    pub fn new() -> Self {
        Self { store: Arc::new(MemStore::default()), subject: ItemChangeSubject::new(), sync: Arc::new(FixedSync::default()) }
    }

    pub fn synced(self, on: bool) -> Self {
        self.sync.0.store(on, Ordering::SeqCst);
        self
    }

    pub fn executor(&self, config: ObserveQueryConfig) -> ObserveQueryExecutor {
        ObserveQueryExecutor::new(
            Arc::new(self.subject.clone()),
            self.store.clone(),
            self.sync.clone(),
            tokio::runtime::Handle::current(),
            config,
        )
    }

    pub fn save(&self, owner: &BlogOwner, initiator: Initiator) {
        let kind = if self.store.put(owner) { ChangeType::Update } else { ChangeType::Create };
        self.subject.publish(StorageItemChange::for_model(owner, kind, initiator).unwrap());
    }

    pub fn delete(&self, owner: &BlogOwner, initiator: Initiator) {
        self.store.remove(&owner.id);
        self.publish_delete(owner, initiator);
    }

    /// Delete event without touching the stored row.
    pub fn publish_delete(&self, owner: &BlogOwner, initiator: Initiator) {
        self.subject.publish(StorageItemChange::for_model(owner, ChangeType::Delete, initiator).unwrap());
    }
}

pub fn config(max_records: usize, max_time_ms: u64) -> ObserveQueryConfig {
    ObserveQueryConfig::default()
        .with_max_records(max_records)
        .with_max_time(Duration::from_millis(max_time_ms))
        .with_emit_when_synced(false)
}

pub async fn next_event<T>(rx: &mut UnboundedReceiver<ObserveEvent<T>>) -> Option<ObserveEvent<T>> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.expect("timed out waiting for event")
}

pub async fn next_snapshot<T: std::fmt::Debug>(rx: &mut UnboundedReceiver<ObserveEvent<T>>) -> QuerySnapshot<T> {
    loop {
        match next_event(rx).await {
            Some(ObserveEvent::Snapshot(s)) => return s,
            Some(ObserveEvent::Started(_)) => continue,
            other => panic!("expected snapshot, got {:?}", other),
        }
    }
}

/// Waits until the handle has published at least `n` snapshots.
pub async fn wait_for_epoch<T: Model>(handle: &ObservationHandle<T>, n: u64) {
    let mut epoch = handle.subscribe_epoch();
    let reached = async {
        while *epoch.borrow_and_update() < n {
            if epoch.changed().await.is_err() {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), reached).await.expect("timed out waiting for snapshot");
}

/// Asserts nothing arrives within `ms`.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut UnboundedReceiver<ObserveEvent<T>>, ms: u64) {
    if let Ok(ev) = tokio::time::timeout(Duration::from_millis(ms), rx.recv()).await {
        panic!("unexpected event {:?}", ev);
    }
}

pub fn names<T>(s: &QuerySnapshot<T>, f: impl Fn(&T) -> &str) -> Vec<String> {
    s.items.iter().map(|i| f(i).to_string()).collect()
}
