//! livequery core types: models, field values, change events and snapshots.
//!
//! This crate holds the vocabulary shared by the store (live query executor)
//! and persistence layers, plus the collaborator traits they meet at.

#![forbid(unsafe_code)]

use std::cmp::Ordering;

use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod query;

pub use query::{field, CompareOp, ObserveQueryOptions, QueryField, QueryPredicate, QuerySortBy, QuerySortOrder, SortSpec};

/// Errors surfaced by the data store layers.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum DataStoreError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("subscription: {0}")]
    Subscription(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("unknown field `{field}` on model {model}")]
    UnknownField { model: String, field: String },
    #[error("values of field `{field}` on model {model} are not comparable: {detail}")]
    Incomparable { model: String, field: String, detail: String },
    #[error("expected at most one sync metadata row for {model}, found {found}")]
    AmbiguousSyncMetadata { model: String, found: usize },
    #[error("internal: {0}")]
    Internal(String),
}

pub type DataStoreResult<T> = Result<T, DataStoreError>;

/// Scalar value read from a model field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Int(i),
                None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => FieldValue::Text(s.clone()),
            // Composite values have no scalar ordering; render them so equality still works.
            other => FieldValue::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "int",
            FieldValue::Float(_) => "float",
            FieldValue::Text(_) => "text",
        }
    }

    /// Natural ordering between two values.
    ///
    /// Strings compare ordinally, numbers numerically (ints and floats mix),
    /// bools `false < true`. `Null` sorts before everything else. Returns
    /// `None` when the two values belong to different classes.
    pub fn ordering(&self, other: &FieldValue) -> Option<Ordering> {
        use FieldValue::*;
        match (self, other) {
            (Null, Null) => Some(Ordering::Equal),
            (Null, _) => Some(Ordering::Less),
            (_, Null) => Some(Ordering::Greater),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Int(a), Float(b)) => Some((*a as f64).total_cmp(b)),
            (Float(a), Int(b)) => Some(a.total_cmp(&(*b as f64))),
            (Float(a), Float(b)) => Some(a.total_cmp(b)),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self { FieldValue::Text(v.to_string()) }
}
impl From<String> for FieldValue {
    fn from(v: String) -> Self { FieldValue::Text(v) }
}
impl From<i64> for FieldValue {
    fn from(v: i64) -> Self { FieldValue::Int(v) }
}
impl From<i32> for FieldValue {
    fn from(v: i32) -> Self { FieldValue::Int(v as i64) }
}
impl From<f64> for FieldValue {
    fn from(v: f64) -> Self { FieldValue::Float(v) }
}
impl From<bool> for FieldValue {
    fn from(v: bool) -> Self { FieldValue::Bool(v) }
}
impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self { v.map(Into::into).unwrap_or(FieldValue::Null) }
}

/// Reads one field of a model. Resolved once per field name, then called per item.
pub type FieldAccessor<T> = fn(&T) -> FieldValue;

/// A persistable, observable model type.
pub trait Model: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Schema name; change events are routed by this name.
    const MODEL_NAME: &'static str;

    /// Stable primary key rendered as a string.
    fn primary_key(&self) -> String;

    /// Accessor for a named field, or `None` when the model has no such field.
    fn field_accessor(field: &str) -> Option<FieldAccessor<Self>>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// Who committed a change to local storage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Initiator {
    DataStoreApi,
    SyncEngine,
}

/// A committed mutation of the local store, as published on the change stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageItemChange {
    pub change_id: Uuid,
    pub initiator: Initiator,
    pub change_type: ChangeType,
    pub model_name: String,
    pub item_id: String,
    /// Item after a save, or as it was before a deletion.
    pub item: serde_json::Value,
}

impl StorageItemChange {
    pub fn new(
        model_name: impl Into<String>,
        item_id: impl Into<String>,
        change_type: ChangeType,
        initiator: Initiator,
        item: serde_json::Value,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4(),
            initiator,
            change_type,
            model_name: model_name.into(),
            item_id: item_id.into(),
            item,
        }
    }

    pub fn for_model<T: Model>(item: &T, change_type: ChangeType, initiator: Initiator) -> DataStoreResult<Self> {
        let raw = serde_json::to_value(item).map_err(|e| DataStoreError::Decode(e.to_string()))?;
        Ok(Self::new(T::MODEL_NAME, item.primary_key(), change_type, initiator, raw))
    }

    pub fn is_for<T: Model>(&self) -> bool {
        self.model_name == T::MODEL_NAME
    }

    pub fn decode<T: Model>(&self) -> DataStoreResult<T> {
        serde_json::from_value(self.item.clone())
            .map_err(|e| DataStoreError::Decode(format!("{} {}: {}", self.model_name, self.item_id, e)))
    }
}

/// Typed change reported inside a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemChange<T> {
    pub change_id: Uuid,
    pub change_type: ChangeType,
    pub initiator: Initiator,
    pub item: T,
}

/// Self-consistent view of all items matching an observed query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuerySnapshot<T> {
    pub items: Vec<T>,
    /// Changes applied since the previous snapshot; empty for the baseline.
    pub item_changes: Vec<ItemChange<T>>,
    pub is_synced: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncType {
    Base,
    Delta,
}

/// Last completed sync for one model, as recorded by the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastSyncMetadata {
    pub model_name: String,
    /// Milliseconds since the Unix epoch; `None` when never synced.
    pub last_sync_time: Option<i64>,
    pub sync_type: SyncType,
}

/// Local query engine over the persisted rows of each model.
///
/// Implementations are synchronous and may block; callers run them off
/// any latency-sensitive thread.
pub trait SqlQueryProcessor: Send + Sync {
    /// Rows of `model_name` matching the options' predicate, in the options' sort order.
    fn query_offline_data(
        &self,
        model_name: &str,
        options: &ObserveQueryOptions,
    ) -> DataStoreResult<Vec<serde_json::Value>>;

    /// Whether the row with `item_id` exists and matches `predicate`.
    fn model_exists(&self, model_name: &str, item_id: &str, predicate: &QueryPredicate) -> DataStoreResult<bool>;

    /// Sync metadata rows recorded for `model_name`.
    fn last_sync_metadata(&self, model_name: &str) -> DataStoreResult<Vec<LastSyncMetadata>>;
}

pub type ChangeStream = BoxStream<'static, DataStoreResult<StorageItemChange>>;

/// Push-based source of committed storage changes.
pub trait ItemChangeSource: Send + Sync {
    /// Start a new subscription. Dropping the stream unsubscribes.
    fn subscribe(&self) -> ChangeStream;
}

pub mod prelude {
    pub use super::{
        field, ChangeStream, ChangeType, DataStoreError, DataStoreResult, FieldAccessor, FieldValue,
        Initiator, ItemChange, ItemChangeSource, LastSyncMetadata, Model, ObserveQueryOptions,
        QueryPredicate, QuerySnapshot, QuerySortBy, QuerySortOrder, SortSpec, SqlQueryProcessor,
        StorageItemChange, SyncType,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_mixes_numbers_and_rejects_classes() {
        assert_eq!(FieldValue::Int(2).ordering(&FieldValue::Float(2.5)), Some(Ordering::Less));
        assert_eq!(FieldValue::Float(3.0).ordering(&FieldValue::Int(3)), Some(Ordering::Equal));
        assert_eq!(FieldValue::from("b").ordering(&FieldValue::from("a")), Some(Ordering::Greater));
        assert_eq!(FieldValue::Null.ordering(&FieldValue::Int(0)), Some(Ordering::Less));
        assert_eq!(FieldValue::from("1").ordering(&FieldValue::Int(1)), None);
        assert_eq!(FieldValue::Bool(true).ordering(&FieldValue::Int(1)), None);
    }

    #[test]
    fn strings_compare_ordinally() {
        // uppercase sorts before lowercase in codepoint order
        assert_eq!(FieldValue::from("Zed").ordering(&FieldValue::from("alan")), Some(Ordering::Less));
    }

    #[test]
    fn from_json_maps_scalars() {
        assert_eq!(FieldValue::from_json(&serde_json::json!(7)), FieldValue::Int(7));
        assert_eq!(FieldValue::from_json(&serde_json::json!(1.5)), FieldValue::Float(1.5));
        assert_eq!(FieldValue::from_json(&serde_json::json!("x")), FieldValue::from("x"));
        assert_eq!(FieldValue::from_json(&serde_json::Value::Null), FieldValue::Null);
    }
}
