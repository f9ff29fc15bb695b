//! Change feeds: prefix subscriptions delivering an initial snapshot followed
//! by an ordered stream of create/modify/delete events, plus the supervisor
//! that keeps a subscription alive.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::RetryPolicy;
use crate::error::FeedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
}

/// One change under a watched prefix. `value` is empty for deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: Bytes,
}

impl FeedEvent {
    pub fn create(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            kind: EventKind::Create,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn modify(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            kind: EventKind::Modify,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.into(),
            value: Bytes::new(),
        }
    }
}

pub struct Subscription<S> {
    pub snapshot: Vec<KeyValue>,
    pub events: S,
}

/// Prefix subscription on the coordination store.
///
/// The event stream is single-pass; after it ends or fails the caller
/// subscribes again and receives a fresh snapshot.
pub trait ChangeFeed: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync + 'static;
    type Events: Stream<Item = Result<FeedEvent, Self::Error>> + Send + Unpin + 'static;

    fn subscribe(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Subscription<Self::Events>, Self::Error>> + Send;
}

/// Turns the store's put/delete operations into create/modify/delete by
/// remembering which keys currently exist.
#[derive(Debug, Default)]
pub struct KeyTracker {
    known: HashSet<String>,
}

impl KeyTracker {
    pub fn from_snapshot(snapshot: &[KeyValue]) -> Self {
        Self {
            known: snapshot.iter().map(|kv| kv.key.clone()).collect(),
        }
    }

    pub fn put(&mut self, key: &str) -> EventKind {
        if self.known.insert(key.to_string()) {
            EventKind::Create
        } else {
            EventKind::Modify
        }
    }

    pub fn delete(&mut self, key: &str) {
        self.known.remove(key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedName {
    Jobs,
    Once,
    Proc,
}

impl FeedName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jobs => "jobs",
            Self::Once => "once",
            Self::Proc => "proc",
        }
    }
}

impl fmt::Display for FeedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedStatus {
    Connecting,
    Live,
    Degraded { attempts: u32, last_error: String },
    Failed { last_error: String },
}

/// Shared view of every feed's state, read by the health endpoint.
#[derive(Debug, Clone, Default)]
pub struct FeedHealth(Arc<RwLock<BTreeMap<FeedName, FeedStatus>>>);

impl FeedHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, feed: FeedName, status: FeedStatus) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(feed, status);
    }

    pub fn get(&self, feed: FeedName) -> Option<FeedStatus> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&feed)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<FeedName, FeedStatus> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// True when at least one feed is registered and all of them are live.
    pub fn is_healthy(&self) -> bool {
        let feeds = self.0.read().unwrap_or_else(PoisonError::into_inner);
        !feeds.is_empty() && feeds.values().all(|s| *s == FeedStatus::Live)
    }
}

/// Consumer of one feed. Calls are strictly sequential, in arrival order.
pub trait FeedSink: Send + 'static {
    /// `initial` is true for the first successful subscription only.
    fn on_snapshot(
        &mut self,
        snapshot: Vec<KeyValue>,
        initial: bool,
    ) -> impl Future<Output = ()> + Send;

    fn on_event(&mut self, event: FeedEvent) -> impl Future<Output = ()> + Send;
}

/// Keep `prefix` subscribed and pump it into `sink` until `shutdown` fires.
///
/// Subscription failures are retried per `policy`; once `max_attempts`
/// consecutive attempts fail the feed is marked failed and this returns
/// [`FeedError::Exhausted`]. A stream that ends, or keeps erroring, is
/// re-subscribed and its fresh snapshot handed to the sink.
pub async fn supervise<F, K>(
    feed: F,
    name: FeedName,
    prefix: String,
    policy: RetryPolicy,
    health: FeedHealth,
    shutdown: CancellationToken,
    mut sink: K,
) -> Result<(), FeedError>
where
    F: ChangeFeed,
    K: FeedSink,
{
    let mut initial = true;
    let mut failures = 0u32;
    health.set(name, FeedStatus::Connecting);

    loop {
        let subscribed = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = feed.subscribe(&prefix) => result,
        };

        let Subscription {
            snapshot,
            mut events,
        } = match subscribed {
            Ok(sub) => sub,
            Err(e) => {
                failures += 1;
                if failures >= policy.max_attempts {
                    error!(feed = %name, prefix = %prefix, attempts = failures, error = %e, "Giving up on feed subscription");
                    health.set(
                        name,
                        FeedStatus::Failed {
                            last_error: e.to_string(),
                        },
                    );
                    return Err(FeedError::Exhausted {
                        prefix,
                        attempts: failures,
                    });
                }

                let delay = policy.delay(failures);
                warn!(
                    feed = %name,
                    prefix = %prefix,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Feed subscription failed, retrying"
                );
                health.set(
                    name,
                    FeedStatus::Degraded {
                        attempts: failures,
                        last_error: e.to_string(),
                    },
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        failures = 0;
        health.set(name, FeedStatus::Live);
        info!(feed = %name, prefix = %prefix, entries = snapshot.len(), "Feed subscribed");
        sink.on_snapshot(snapshot, initial).await;
        initial = false;

        let mut stream_errors = 0u32;
        let reason = loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    stream_errors = 0;
                    sink.on_event(event).await;
                }
                Some(Err(e)) => {
                    stream_errors += 1;
                    warn!(feed = %name, prefix = %prefix, error = %e, "Feed stream error");
                    if stream_errors >= policy.max_attempts {
                        break e.to_string();
                    }
                }
                None => break "stream ended".to_string(),
            }
        };

        warn!(feed = %name, prefix = %prefix, reason = %reason, "Feed interrupted, re-subscribing");
        health.set(
            name,
            FeedStatus::Degraded {
                attempts: 0,
                last_error: reason,
            },
        );
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(policy.delay(1)) => {}
        }
    }
}
