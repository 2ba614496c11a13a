//! Multi-producer publish/subscribe subject for storage change events.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use livequery_core::{ChangeStream, DataStoreError, DataStoreResult, ItemChangeSource, StorageItemChange};
use tokio::sync::mpsc;
use tracing::debug;

type Subscriber = mpsc::UnboundedSender<DataStoreResult<StorageItemChange>>;

#[derive(Default)]
struct Inner {
    subscribers: Vec<Subscriber>,
    terminated: bool,
}

/// Fans committed changes out to every live subscription.
///
/// Publishing holds the subject lock, so concurrent producers are serialized
/// and each subscriber sees one total order. Subscriptions are unbounded.
#[derive(Clone, Default)]
pub struct ItemChangeSubject {
    inner: Arc<Mutex<Inner>>,
}

impl ItemChangeSubject {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver `change` to all subscribers; returns how many received it.
    /// Subscribers whose stream was dropped are pruned here.
    pub fn publish(&self, change: StorageItemChange) -> usize {
        let mut inner = self.lock();
        if inner.terminated {
            return 0;
        }
        inner.subscribers.retain(|tx| tx.send(Ok(change.clone())).is_ok());
        inner.subscribers.len()
    }

    /// Terminate every subscription with `error`.
    pub fn fail(&self, error: DataStoreError) {
        let mut inner = self.lock();
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(Err(error.clone()));
        }
        inner.terminated = true;
        debug!(error = %error, "change subject failed");
    }

    /// End every subscription gracefully.
    pub fn complete(&self) {
        let mut inner = self.lock();
        inner.subscribers.clear();
        inner.terminated = true;
        debug!("change subject completed");
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}

impl ItemChangeSource for ItemChangeSubject {
    fn subscribe(&self) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.lock();
            // a terminated subject hands out streams that end immediately
            if !inner.terminated {
                inner.subscribers.push(tx);
            }
        }
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) }).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livequery_core::{ChangeType, Initiator};

    fn change(id: &str) -> StorageItemChange {
        StorageItemChange::new("Post", id, ChangeType::Create, Initiator::DataStoreApi, serde_json::json!({ "id": id }))
    }

    #[tokio::test]
    async fn fans_out_in_publish_order() {
        let subject = ItemChangeSubject::new();
        let mut a = subject.subscribe();
        let mut b = subject.subscribe();
        assert_eq!(subject.publish(change("1")), 2);
        assert_eq!(subject.publish(change("2")), 2);
        for s in [&mut a, &mut b] {
            assert_eq!(s.next().await.unwrap().unwrap().item_id, "1");
            assert_eq!(s.next().await.unwrap().unwrap().item_id, "2");
        }
    }

    #[tokio::test]
    async fn dropped_streams_unsubscribe() {
        let subject = ItemChangeSubject::new();
        let a = subject.subscribe();
        let _b = subject.subscribe();
        drop(a);
        assert_eq!(subject.subscriber_count(), 1);
        assert_eq!(subject.publish(change("1")), 1);
    }

    #[tokio::test]
    async fn complete_and_fail_terminate_streams() {
        let subject = ItemChangeSubject::new();
        let mut a = subject.subscribe();
        subject.complete();
        assert!(a.next().await.is_none());
        assert_eq!(subject.publish(change("1")), 0);

        let failing = ItemChangeSubject::new();
        let mut b = failing.subscribe();
        failing.fail(DataStoreError::Subscription("boom".into()));
        assert!(matches!(b.next().await, Some(Err(DataStoreError::Subscription(_)))));
        assert!(b.next().await.is_none());
    }
}
