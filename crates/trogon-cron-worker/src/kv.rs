use std::time::Duration;

use async_nats::jetstream::{self, kv};
use futures::{Stream, StreamExt};

use crate::error::{FeedError, WorkerError};
use crate::feed::KeyValue;
use crate::keys;

/// Longest gap between snapshot entries. On an empty prefix this is how
/// long the snapshot takes to come back empty.
const SNAPSHOT_IDLE: Duration = Duration::from_millis(500);

pub async fn get_or_create_bucket(
    js: &jetstream::Context,
    bucket: &str,
) -> Result<kv::Store, WorkerError> {
    let config = kv::Config {
        bucket: bucket.to_string(),
        history: 5,
        ..Default::default()
    };
    match js.create_key_value(config).await {
        Ok(store) => Ok(store),
        Err(_) => js
            .get_key_value(bucket)
            .await
            .map_err(|e| WorkerError::Kv(e.to_string())),
    }
}

/// Watch every key below `prefix` and split the watch into the current
/// snapshot and the live remainder.
///
/// `watch_with_history` delivers the last value of every matching key first
/// and then keeps streaming on the same consumer, so nothing can slip in
/// between the snapshot and the stream. Keys whose last operation is a
/// delete are left out of the snapshot.
pub async fn load_snapshot_and_watch(
    store: &kv::Store,
    prefix: &str,
) -> Result<(Vec<KeyValue>, kv::Watch), FeedError> {
    let mut watcher = store
        .watch_with_history(keys::watch_pattern(prefix))
        .await
        .map_err(|e| FeedError::Subscribe {
            prefix: prefix.to_string(),
            reason: e.to_string(),
        })?;

    let snapshot = drain_snapshot(&mut watcher, SNAPSHOT_IDLE, |entry: kv::Entry| {
        let is_last = entry.delta == 0;
        let put = (entry.operation == kv::Operation::Put).then(|| KeyValue {
            key: entry.key,
            value: entry.value,
        });
        (put, is_last)
    })
    .await
    .map_err(|e| FeedError::Subscribe {
        prefix: prefix.to_string(),
        reason: e.to_string(),
    })?;

    tracing::debug!(prefix, entries = snapshot.len(), "Snapshot loaded");
    Ok((snapshot, watcher))
}

/// Pull the snapshot part off the front of a history watch.
///
/// `split` maps each item to its snapshot entry (if any) and whether it is
/// the last one. Stops after the last entry, at end of stream, or when no
/// item arrives within `idle`; whatever follows stays in `items`.
async fn drain_snapshot<S, T, E>(
    items: &mut S,
    idle: Duration,
    mut split: impl FnMut(T) -> (Option<KeyValue>, bool),
) -> Result<Vec<KeyValue>, E>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    let mut snapshot = Vec::new();
    loop {
        let Ok(next) = tokio::time::timeout(idle, items.next()).await else {
            break;
        };
        match next {
            Some(Ok(item)) => {
                let (entry, is_last) = split(item);
                snapshot.extend(entry);
                if is_last {
                    break;
                }
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    type Item = Result<(u32, bool), String>;

    fn split((n, is_last): (u32, bool)) -> (Option<KeyValue>, bool) {
        let kv = KeyValue {
            key: format!("once.h.{n}"),
            value: Bytes::new(),
        };
        (Some(kv), is_last)
    }

    /// Five entries 40 ms apart, the last flagged, then one live entry.
    fn slow_backlog() -> impl Stream<Item = Item> {
        futures::stream::unfold(0u32, |n| async move {
            if n > 5 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(40)).await;
            Some((Ok((n, n == 4)), n + 1))
        })
    }

    #[tokio::test]
    async fn slow_snapshot_is_not_cut_off_by_idle_window() {
        let mut items = Box::pin(slow_backlog());

        let snapshot = drain_snapshot(&mut items, Duration::from_millis(100), split)
            .await
            .unwrap();

        let keys: Vec<_> = snapshot.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["once.h.0", "once.h.1", "once.h.2", "once.h.3", "once.h.4"]);
        assert_eq!(items.next().await, Some(Ok((5, false))));
    }

    #[tokio::test]
    async fn silent_prefix_yields_empty_snapshot() {
        let mut items = futures::stream::pending::<Item>();

        let snapshot = drain_snapshot(&mut items, Duration::from_millis(20), split)
            .await
            .unwrap();

        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn stream_error_aborts_the_snapshot() {
        let mut items = futures::stream::iter(vec![Ok((0, false)), Err("boom".to_string())]);

        let result = drain_snapshot(&mut items, Duration::from_millis(20), split).await;

        assert_eq!(result, Err("boom".to_string()));
    }
}
