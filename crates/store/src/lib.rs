//! livequery store: live query views over the local model store.
//!
//! An observed query starts from a baseline query, then folds committed
//! storage changes into a private working set and emits re-sorted snapshots
//! in batches (see [`ObserveQueryExecutor`]).

#![forbid(unsafe_code)]

use livequery_core::{DataStoreResult, Model};
use rustc_hash::FxHashMap;

pub mod config;
pub mod observe;
pub mod sort;
pub mod subject;
pub mod sync_status;

pub use config::ObserveQueryConfig;
pub use observe::{
    channel_sink, Callbacks, ChannelSink, ObservationHandle, ObservationSink, ObservationState, ObserveEvent,
    ObserveQueryExecutor,
};
pub use sort::{ModelComparator, ModelSorter};
pub use subject::ItemChangeSubject;
pub use sync_status::{MetadataSyncStatus, SyncStatus, DEFAULT_SYNC_INTERVAL};

/// Items currently known to an observation, unique by primary key.
///
/// Keeps insertion (or last sort) order; replacing an item keeps its slot.
/// Removal leaves a hole that the next [`WorkingSet::sort`] compacts, so a
/// batch of removals costs one pass over the set.
pub struct WorkingSet<T> {
    slots: Vec<Option<T>>,
    index: FxHashMap<String, usize>,
}

impl<T: Model> Default for WorkingSet<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Model> WorkingSet<T> {
    pub fn new() -> Self { Self { slots: Vec::new(), index: FxHashMap::default() } }

    pub fn len(&self) -> usize { self.index.len() }
    pub fn is_empty(&self) -> bool { self.index.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &T> { self.slots.iter().flatten() }
    pub fn to_vec(&self) -> Vec<T> { self.iter().cloned().collect() }

    pub fn contains(&self, key: &str) -> bool { self.index.contains_key(key) }

    /// Replace the contents, collapsing duplicate keys onto their first slot.
    pub fn reset(&mut self, items: Vec<T>) {
        self.clear();
        for item in items {
            self.upsert(item);
        }
    }

    pub fn upsert(&mut self, item: T) {
        let key = item.primary_key();
        match self.index.get(&key) {
            Some(&i) => self.slots[i] = Some(item),
            None => {
                self.index.insert(key, self.slots.len());
                self.slots.push(Some(item));
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        let i = self.index.remove(key)?;
        self.slots[i].take()
    }

    /// Compact holes left by removals and apply `sorter`. On error the items
    /// keep their previous relative order.
    pub fn sort(&mut self, sorter: &ModelSorter<T>) -> DataStoreResult<()> {
        let mut items: Vec<T> = std::mem::take(&mut self.slots).into_iter().flatten().collect();
        let sorted = if sorter.is_empty() { Ok(()) } else { sorter.sort(&mut items) };
        self.index.clear();
        for (i, item) in items.iter().enumerate() {
            self.index.insert(item.primary_key(), i);
        }
        self.slots = items.into_iter().map(Some).collect();
        sorted
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }
}
