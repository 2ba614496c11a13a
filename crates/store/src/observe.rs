//! Observed queries: baseline snapshot, then batched snapshots of live changes.
//!
//! Each observation runs as one task on the injected runtime. Blocking work
//! (baseline query, existence checks, sync status reads, sorting) runs on the
//! runtime's blocking pool while holding the observation's state lock, so the
//! append path and the flush path never interleave and at most one flush is
//! in flight per observation.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, ThreadId};
use std::time::Instant as StdInstant;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use livequery_core::{
    ChangeType, DataStoreError, DataStoreResult, Initiator, ItemChange, ItemChangeSource, Model,
    ObserveQueryOptions, QueryPredicate, QuerySnapshot, SqlQueryProcessor, StorageItemChange,
};
use metrics::{counter, histogram};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ObserveQueryConfig;
use crate::sort::ModelSorter;
use crate::sync_status::SyncStatus;
use crate::WorkingSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObservationState {
    NotStarted = 0,
    Running = 1,
    Cancelled = 2,
    Completed = 3,
    Failed = 4,
}

impl ObservationState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ObservationState::NotStarted,
            1 => ObservationState::Running,
            2 => ObservationState::Cancelled,
            3 => ObservationState::Completed,
            _ => ObservationState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ObservationState::Cancelled | ObservationState::Completed | ObservationState::Failed)
    }
}

/// Receives the outcome of one observation.
///
/// `on_snapshot` is called at least once unless the observation is cancelled
/// or fails first. `on_error` and `on_complete` are mutually exclusive and
/// called at most once.
pub trait ObservationSink<T>: Send + Sync + 'static {
    fn on_started(&self, _handle: ObservationHandle<T>) {}
    fn on_snapshot(&self, snapshot: QuerySnapshot<T>);
    fn on_error(&self, _error: DataStoreError) {}
    fn on_complete(&self) {}
}

type StartedFn<T> = Box<dyn Fn(ObservationHandle<T>) + Send + Sync>;
type SnapshotFn<T> = Box<dyn Fn(QuerySnapshot<T>) + Send + Sync>;
type ErrorFn = Box<dyn Fn(DataStoreError) + Send + Sync>;
type CompleteFn = Box<dyn Fn() + Send + Sync>;

/// Closure-based sink.
pub struct Callbacks<T> {
    started: Option<StartedFn<T>>,
    snapshot: SnapshotFn<T>,
    error: Option<ErrorFn>,
    complete: Option<CompleteFn>,
}

impl<T: Model> Callbacks<T> {
    pub fn new(on_snapshot: impl Fn(QuerySnapshot<T>) + Send + Sync + 'static) -> Self {
        Self { started: None, snapshot: Box::new(on_snapshot), error: None, complete: None }
    }

    pub fn on_started(mut self, f: impl Fn(ObservationHandle<T>) + Send + Sync + 'static) -> Self {
        self.started = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(DataStoreError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }
}

impl<T: Model> ObservationSink<T> for Callbacks<T> {
    fn on_started(&self, handle: ObservationHandle<T>) {
        if let Some(f) = &self.started {
            f(handle)
        }
    }
    fn on_snapshot(&self, snapshot: QuerySnapshot<T>) { (self.snapshot)(snapshot) }
    fn on_error(&self, error: DataStoreError) {
        if let Some(f) = &self.error {
            f(error)
        }
    }
    fn on_complete(&self) {
        if let Some(f) = &self.complete {
            f()
        }
    }
}

/// Event form of the sink callbacks, for consumers that prefer a channel.
#[derive(Debug)]
pub enum ObserveEvent<T> {
    Started(ObservationHandle<T>),
    Snapshot(QuerySnapshot<T>),
    Error(DataStoreError),
    Complete,
}

/// Channel-backed sink. Dropping the receiver cancels the observation at the
/// next delivery.
pub struct ChannelSink<T> {
    tx: mpsc::UnboundedSender<ObserveEvent<T>>,
    handle: OnceLock<ObservationHandle<T>>,
}

pub fn channel_sink<T: Model>() -> (ChannelSink<T>, mpsc::UnboundedReceiver<ObserveEvent<T>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx, handle: OnceLock::new() }, rx)
}

impl<T: Model> ChannelSink<T> {
    fn send(&self, event: ObserveEvent<T>) {
        if self.tx.send(event).is_err() {
            if let Some(handle) = self.handle.get() {
                debug!(model = T::MODEL_NAME, "event receiver dropped; cancelling observation");
                handle.cancel();
            }
        }
    }
}

impl<T: Model> ObservationSink<T> for ChannelSink<T> {
    fn on_started(&self, handle: ObservationHandle<T>) {
        let _ = self.handle.set(handle.clone());
        self.send(ObserveEvent::Started(handle));
    }
    fn on_snapshot(&self, snapshot: QuerySnapshot<T>) { self.send(ObserveEvent::Snapshot(snapshot)) }
    fn on_error(&self, error: DataStoreError) { self.send(ObserveEvent::Error(error)) }
    fn on_complete(&self) { self.send(ObserveEvent::Complete) }
}

struct Inner<T> {
    working: WorkingSet<T>,
    pending: Vec<StorageItemChange>,
    /// Sync status seen at the last emission.
    synced: bool,
}

struct Shared<T> {
    state: AtomicU8,
    cancel: CancellationToken,
    inner: Mutex<Inner<T>>,
    /// Held while a sink callback runs; `cancel` waits on it.
    gate: Mutex<()>,
    /// Thread currently inside a gated callback.
    delivering: Mutex<Option<ThreadId>>,
    latest: ArcSwapOption<QuerySnapshot<T>>,
    epoch_tx: watch::Sender<u64>,
}

impl<T: Model> Shared<T> {
    fn new(epoch_tx: watch::Sender<u64>) -> Self {
        Self {
            state: AtomicU8::new(ObservationState::NotStarted as u8),
            cancel: CancellationToken::new(),
            inner: Mutex::new(Inner { working: WorkingSet::new(), pending: Vec::new(), synced: false }),
            gate: Mutex::new(()),
            delivering: Mutex::new(None),
            latest: ArcSwapOption::empty(),
            epoch_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> { recover(&self.inner) }

    /// Run a sink callback under the delivery gate.
    fn gated<R>(&self, f: impl FnOnce() -> R) -> R {
        let _gate = recover(&self.gate);
        let _mark = Delivering::enter(&self.delivering);
        f()
    }

    /// Block until no callback is in flight, unless called from inside one.
    fn wait_for_delivery(&self) {
        if *recover(&self.delivering) == Some(thread::current().id()) {
            return;
        }
        drop(recover(&self.gate));
    }

    fn state(&self) -> ObservationState { ObservationState::from_u8(self.state.load(Ordering::SeqCst)) }

    fn is_running(&self) -> bool { self.state() == ObservationState::Running }

    /// Move to `to` if the current state is one of `from`.
    fn transition(&self, from: &[ObservationState], to: ObservationState) -> bool {
        let mut cur = self.state.load(Ordering::SeqCst);
        loop {
            if !from.iter().any(|s| *s as u8 == cur) {
                return false;
            }
            match self.state.compare_exchange(cur, to as u8, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn pending_len(&self) -> usize { self.lock().pending.len() }

    fn clear(&self) {
        let mut inner = self.lock();
        inner.working.clear();
        inner.pending.clear();
        drop(inner);
        self.latest.store(None);
    }

    /// Queue a change; returns the pending count and last known sync status.
    fn push(&self, change: StorageItemChange) -> (usize, bool) {
        let mut inner = self.lock();
        inner.pending.push(change);
        (inner.pending.len(), inner.synced)
    }

    fn seed(&self, models: Vec<T>, sorter: &ModelSorter<T>, sync: &dyn SyncStatus) -> DataStoreResult<Option<QuerySnapshot<T>>> {
        let mut inner = self.lock();
        if !self.is_running() {
            return Ok(None);
        }
        inner.working.reset(models);
        inner.working.sort(sorter)?;
        inner.synced = read_sync_status::<T>(sync);
        Ok(Some(QuerySnapshot { items: inner.working.to_vec(), item_changes: Vec::new(), is_synced: inner.synced }))
    }

    /// Apply the pending batch in delivery order, re-sort, and build the next snapshot.
    fn flush(
        &self,
        processor: &dyn SqlQueryProcessor,
        sync: &dyn SyncStatus,
        predicate: &QueryPredicate,
        sorter: &ModelSorter<T>,
    ) -> DataStoreResult<Option<QuerySnapshot<T>>> {
        let mut inner = self.lock();
        if !self.is_running() {
            return Ok(None);
        }
        let batch = std::mem::take(&mut inner.pending);
        if batch.is_empty() {
            return Ok(None);
        }
        let synced_before = inner.synced;
        let mut applied = Vec::with_capacity(batch.len());
        for change in batch {
            let item: T = match change.decode() {
                Ok(item) => item,
                Err(e) => {
                    warn!(model = T::MODEL_NAME, change_id = %change.change_id, error = %e, "skipping undecodable change");
                    counter!("observe_soft_failures_total", 1u64, "kind" => "decode");
                    continue;
                }
            };
            let key = item.primary_key();
            match change.change_type {
                ChangeType::Create | ChangeType::Update => {
                    let matches = match processor.model_exists(T::MODEL_NAME, &key, predicate) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(model = T::MODEL_NAME, id = %key, error = %e, "predicate re-check failed; matching change payload");
                            counter!("observe_soft_failures_total", 1u64, "kind" => "exists");
                            predicate.matches(&change.item)
                        }
                    };
                    if matches {
                        inner.working.upsert(item.clone());
                    } else {
                        inner.working.remove(&key);
                    }
                }
                ChangeType::Delete => {
                    // local deletes are only trusted outright once the cache is known synced
                    let verify = change.initiator == Initiator::DataStoreApi && !synced_before;
                    let still_stored = verify
                        && match processor.model_exists(T::MODEL_NAME, &key, &QueryPredicate::All) {
                            Ok(exists) => exists,
                            Err(e) => {
                                warn!(model = T::MODEL_NAME, id = %key, error = %e, "delete verification failed; deleting");
                                counter!("observe_soft_failures_total", 1u64, "kind" => "exists");
                                false
                            }
                        };
                    if still_stored {
                        debug!(model = T::MODEL_NAME, id = %key, "delete not confirmed by store; item kept");
                    } else {
                        inner.working.remove(&key);
                    }
                }
            }
            applied.push(ItemChange {
                change_id: change.change_id,
                change_type: change.change_type,
                initiator: change.initiator,
                item,
            });
        }
        inner.working.sort(sorter)?;
        inner.synced = read_sync_status::<T>(sync);
        Ok(Some(QuerySnapshot { items: inner.working.to_vec(), item_changes: applied, is_synced: inner.synced }))
    }
}

fn recover<G>(m: &Mutex<G>) -> MutexGuard<'_, G> { m.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) }

struct Delivering<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> Delivering<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>) -> Self {
        *recover(slot) = Some(thread::current().id());
        Self(slot)
    }
}

impl Drop for Delivering<'_> {
    fn drop(&mut self) { *recover(self.0) = None; }
}

fn read_sync_status<T: Model>(sync: &dyn SyncStatus) -> bool {
    sync.get(T::MODEL_NAME, &|e| {
        warn!(model = T::MODEL_NAME, error = %e, "sync status read failed");
        counter!("observe_soft_failures_total", 1u64, "kind" => "sync_status");
    })
}

fn load_baseline<T: Model>(processor: &dyn SqlQueryProcessor, options: &ObserveQueryOptions) -> DataStoreResult<Vec<T>> {
    processor
        .query_offline_data(T::MODEL_NAME, options)?
        .into_iter()
        .map(|row| serde_json::from_value(row).map_err(|e| DataStoreError::Decode(format!("{}: {}", T::MODEL_NAME, e))))
        .collect()
}

/// Caller-side handle of one observation. Cloning shares the observation.
pub struct ObservationHandle<T> {
    shared: Arc<Shared<T>>,
    epoch_rx: watch::Receiver<u64>,
}

impl<T> Clone for ObservationHandle<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared), epoch_rx: self.epoch_rx.clone() }
    }
}

impl<T: Model> ObservationHandle<T> {
    /// Stop the observation. No callback fires after this returns: a callback
    /// already running on another thread is waited for. Safe to call from
    /// inside a callback. The change subscription is dropped and accumulated
    /// state is released.
    pub fn cancel(&self) {
        if self.shared.transition(&[ObservationState::NotStarted, ObservationState::Running], ObservationState::Cancelled) {
            info!(model = T::MODEL_NAME, "observation cancelled");
        }
        self.shared.cancel.cancel();
        self.shared.wait_for_delivery();
        self.shared.clear();
    }

    pub fn state(&self) -> ObservationState { self.shared.state() }

    pub fn is_cancelled(&self) -> bool { self.state() == ObservationState::Cancelled }

    /// Changes received but not yet folded into a snapshot.
    pub fn pending_len(&self) -> usize { self.shared.pending_len() }

    pub fn working_set_len(&self) -> usize { self.shared.lock().working.len() }

    /// Most recently emitted snapshot.
    pub fn latest(&self) -> Option<Arc<QuerySnapshot<T>>> { self.shared.latest.load_full() }

    /// Counter bumped after every emitted snapshot (the baseline is 1).
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

impl<T> fmt::Debug for ObservationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationHandle")
            .field("model", &std::any::type_name::<T>())
            .field("state", &ObservationState::from_u8(self.shared.state.load(Ordering::SeqCst)))
            .field("epoch", &*self.epoch_rx.borrow())
            .finish()
    }
}

/// Runs observed queries against a local query processor and change source.
///
/// The runtime is injected; the executor only submits work to it and never
/// owns its lifecycle.
pub struct ObserveQueryExecutor {
    changes: Arc<dyn ItemChangeSource>,
    processor: Arc<dyn SqlQueryProcessor>,
    sync_status: Arc<dyn SyncStatus>,
    runtime: Handle,
    config: ObserveQueryConfig,
}

impl ObserveQueryExecutor {
    pub fn new(
        changes: Arc<dyn ItemChangeSource>,
        processor: Arc<dyn SqlQueryProcessor>,
        sync_status: Arc<dyn SyncStatus>,
        runtime: Handle,
        config: ObserveQueryConfig,
    ) -> Self {
        Self { changes, processor, sync_status, runtime, config }
    }

    pub fn config(&self) -> &ObserveQueryConfig { &self.config }

    /// Start observing `T` under `options`. Returns immediately; every outcome,
    /// including failures, is delivered through `sink`.
    pub fn observe_query<T, S>(&self, options: ObserveQueryOptions, sink: S) -> ObservationHandle<T>
    where
        T: Model,
        S: ObservationSink<T>,
    {
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let handle = ObservationHandle { shared: Arc::new(Shared::new(epoch_tx)), epoch_rx };
        let observation = Observation {
            handle: handle.clone(),
            changes: Arc::clone(&self.changes),
            processor: Arc::clone(&self.processor),
            sync_status: Arc::clone(&self.sync_status),
            runtime: self.runtime.clone(),
            config: self.config,
            options: Arc::new(options),
            sink: Arc::new(sink),
        };
        self.runtime.spawn(observation.run());
        handle
    }
}

struct Observation<T, S> {
    handle: ObservationHandle<T>,
    changes: Arc<dyn ItemChangeSource>,
    processor: Arc<dyn SqlQueryProcessor>,
    sync_status: Arc<dyn SyncStatus>,
    runtime: Handle,
    config: ObserveQueryConfig,
    options: Arc<ObserveQueryOptions>,
    sink: Arc<S>,
}

impl<T: Model, S: ObservationSink<T>> Observation<T, S> {
    fn shared(&self) -> &Arc<Shared<T>> { &self.handle.shared }

    async fn run(self) {
        let model = T::MODEL_NAME;
        if !self.shared().transition(&[ObservationState::NotStarted], ObservationState::Running) {
            debug!(model, "observation cancelled before start");
            return;
        }
        self.sink.on_started(self.handle.clone());
        if !self.shared().is_running() {
            debug!(model, "observation cancelled from on_started");
            return;
        }

        let sorter = match ModelSorter::<T>::new(&self.options.sort_by) {
            Ok(s) => Arc::new(s),
            Err(e) => return self.fail(e),
        };
        // subscribe first so nothing committed during the baseline query is missed
        let mut changes = self.changes.subscribe();

        let t0 = StdInstant::now();
        let baseline = {
            let shared = Arc::clone(self.shared());
            let processor = Arc::clone(&self.processor);
            let sync = Arc::clone(&self.sync_status);
            let options = Arc::clone(&self.options);
            let sorter = Arc::clone(&sorter);
            self.runtime
                .spawn_blocking(move || {
                    let models = load_baseline::<T>(&*processor, &options)?;
                    shared.seed(models, &sorter, &*sync)
                })
                .await
        };
        match flatten(baseline) {
            Ok(Some(snapshot)) => {
                info!(model, items = snapshot.items.len(), took_ms = %t0.elapsed().as_millis(), "baseline loaded");
                if !self.emit(snapshot) {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => return self.fail(e),
        }

        let cancel = self.shared().cancel.clone();
        // recurring flush timer, re-armed after every tick and every flush
        let mut deadline = Instant::now() + self.config.max_time;
        loop {
            let mut flush_now = false;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(model, "observation loop stopped by cancel");
                    return;
                }
                _ = sleep_until(deadline) => {
                    deadline = Instant::now() + self.config.max_time;
                    flush_now = self.shared().pending_len() > 0;
                }
                next = changes.next() => match next {
                    Some(Ok(change)) => {
                        if change.is_for::<T>() {
                            counter!("observe_changes_total", 1u64);
                            let (pending, synced) = self.shared().push(change);
                            flush_now = pending >= self.config.max_records || (self.config.emit_when_synced && synced);
                        }
                    }
                    Some(Err(e)) => return self.fail(e),
                    None => return self.complete(&sorter).await,
                }
            }
            if flush_now {
                if !self.flush(&sorter).await {
                    return;
                }
                deadline = Instant::now() + self.config.max_time;
            }
        }
    }

    /// Returns `false` once the observation has ended.
    async fn flush(&self, sorter: &Arc<ModelSorter<T>>) -> bool {
        if !self.shared().is_running() {
            return false;
        }
        let t0 = StdInstant::now();
        let job = {
            let shared = Arc::clone(self.shared());
            let processor = Arc::clone(&self.processor);
            let sync = Arc::clone(&self.sync_status);
            let options = Arc::clone(&self.options);
            let sorter = Arc::clone(sorter);
            self.runtime
                .spawn_blocking(move || shared.flush(&*processor, &*sync, &options.predicate, &sorter))
                .await
        };
        match flatten(job) {
            Ok(Some(snapshot)) => {
                histogram!("observe_flush_ms", t0.elapsed().as_secs_f64() * 1000.0);
                debug!(model = T::MODEL_NAME, changes = snapshot.item_changes.len(), items = snapshot.items.len(), "flushed");
                self.emit(snapshot)
            }
            Ok(None) => self.shared().is_running(),
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn emit(&self, snapshot: QuerySnapshot<T>) -> bool {
        let shared = self.shared();
        shared.gated(|| {
            if !shared.is_running() {
                return false;
            }
            shared.latest.store(Some(Arc::new(snapshot.clone())));
            shared.epoch_tx.send_modify(|e| *e += 1);
            counter!("observe_snapshots_total", 1u64);
            self.sink.on_snapshot(snapshot);
            true
        })
    }

    async fn complete(&self, sorter: &Arc<ModelSorter<T>>) {
        let idle = self.shared().pending_len() == 0;
        if idle || self.flush(sorter).await {
            self.shared().gated(|| {
                if self.shared().transition(&[ObservationState::Running], ObservationState::Completed) {
                    info!(model = T::MODEL_NAME, "change stream completed; observation finished");
                    self.sink.on_complete();
                }
            })
        }
    }

    fn fail(&self, error: DataStoreError) {
        let shared = self.shared();
        shared.gated(|| {
            if shared.transition(&[ObservationState::Running], ObservationState::Failed) {
                warn!(model = T::MODEL_NAME, error = %error, "observation failed");
                counter!("observe_failures_total", 1u64);
                shared.cancel.cancel();
                shared.clear();
                self.sink.on_error(error);
            }
        })
    }
}

fn flatten<V>(joined: Result<DataStoreResult<V>, tokio::task::JoinError>) -> DataStoreResult<V> {
    joined.map_err(|e| DataStoreError::Internal(format!("worker task failed: {}", e)))?
}
