use async_nats::jetstream::kv;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::{FeedError, WorkerError};
use crate::executor::ProcessRegistry;
use crate::feed::{ChangeFeed, FeedEvent, KeyTracker, Subscription};
use crate::kv::load_snapshot_and_watch;
use crate::model::ProcessVal;

/// Concrete `ChangeFeed` backed by a NATS KV bucket.
#[derive(Clone)]
pub struct NatsKvFeed {
    store: kv::Store,
}

impl NatsKvFeed {
    pub fn new(store: kv::Store) -> Self {
        Self { store }
    }
}

impl ChangeFeed for NatsKvFeed {
    type Error = FeedError;
    type Events = BoxStream<'static, Result<FeedEvent, FeedError>>;

    async fn subscribe(&self, prefix: &str) -> Result<Subscription<Self::Events>, FeedError> {
        let (snapshot, watcher) = load_snapshot_and_watch(&self.store, prefix).await?;
        let mut tracker = KeyTracker::from_snapshot(&snapshot);
        let prefix = prefix.to_string();

        let events = watcher
            .map(move |entry| -> Result<FeedEvent, FeedError> {
                let entry = entry.map_err(|e| FeedError::Stream {
                    prefix: prefix.clone(),
                    reason: e.to_string(),
                })?;
                Ok(match entry.operation {
                    kv::Operation::Put => FeedEvent {
                        kind: tracker.put(&entry.key),
                        key: entry.key,
                        value: entry.value,
                    },
                    kv::Operation::Delete | kv::Operation::Purge => {
                        tracker.delete(&entry.key);
                        FeedEvent::delete(entry.key)
                    }
                })
            })
            .boxed();

        Ok(Subscription { snapshot, events })
    }
}

/// Concrete `ProcessRegistry` writing `proc.` records to a NATS KV bucket.
#[derive(Clone)]
pub struct NatsProcessRegistry {
    store: kv::Store,
}

impl NatsProcessRegistry {
    pub fn new(store: kv::Store) -> Self {
        Self { store }
    }
}

impl ProcessRegistry for NatsProcessRegistry {
    type Error = WorkerError;

    async fn register(&self, key: String, val: ProcessVal) -> Result<(), WorkerError> {
        let payload = serde_json::to_vec(&val)?;
        self.store
            .put(key, payload.into())
            .await
            .map(|_| ())
            .map_err(|e| WorkerError::Kv(e.to_string()))
    }

    async fn deregister(&self, key: String) -> Result<(), WorkerError> {
        self.store
            .delete(key)
            .await
            .map_err(|e| WorkerError::Kv(e.to_string()))
    }
}
