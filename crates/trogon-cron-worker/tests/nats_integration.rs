//! Integration tests against a real NATS server.
//!
//! Run with:
//!   NATS_TEST_URL=nats://localhost:4222 cargo test -p trogon-cron-worker --test nats_integration -- --include-ignored
//!
//! Every test uses its own bucket, so they can run in parallel.

use std::time::Duration;

use async_nats::jetstream::{self, kv};
use futures::StreamExt;
use trogon_cron_worker::backoff::RetryPolicy;
use trogon_cron_worker::feed::{ChangeFeed, EventKind};
use trogon_cron_worker::mocks::MockKiller;
use trogon_cron_worker::{
    EngineStats, NatsKvFeed, NatsProcessRegistry, Worker, WorkerSettings, keys,
};

fn test_url() -> String {
    std::env::var("NATS_TEST_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

fn unique(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

async fn bucket() -> kv::Store {
    let nats = async_nats::connect(test_url())
        .await
        .expect("Failed to connect to NATS; is NATS_TEST_URL set and NATS running?");
    let js = jetstream::new(nats);
    trogon_cron_worker::kv::get_or_create_bucket(&js, &unique("cron_test"))
        .await
        .expect("Failed to create bucket")
}

fn job_json(id: &str, cron: &str, host: &str) -> bytes::Bytes {
    serde_json::json!({
        "id": id,
        "command": "true",
        "timers": [{ "timer_id": "t1", "cron": cron, "nodes": [host] }]
    })
    .to_string()
    .into()
}

#[tokio::test]
#[ignore]
async fn feed_splits_snapshot_from_live_events() {
    let store = bucket().await;
    store.put("job.a", job_json("a", "* * * * *", "h")).await.unwrap();
    store.put("job.b", job_json("b", "* * * * *", "h")).await.unwrap();
    store.delete("job.b").await.unwrap();

    let feed = NatsKvFeed::new(store.clone());
    let mut sub = feed.subscribe(keys::JOB_KEY_PREFIX).await.unwrap();
    let snapshot_keys: Vec<_> = sub.snapshot.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(snapshot_keys, vec!["job.a"]);

    store.put("job.a", job_json("a", "*/5 * * * *", "h")).await.unwrap();
    store.put("job.c", job_json("c", "* * * * *", "h")).await.unwrap();
    store.delete("job.c").await.unwrap();

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.events.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("stream error");
        kinds.push((event.kind, event.key));
    }
    assert_eq!(
        kinds,
        vec![
            (EventKind::Modify, "job.a".to_string()),
            (EventKind::Create, "job.c".to_string()),
            (EventKind::Delete, "job.c".to_string()),
        ]
    );
}

#[tokio::test]
#[ignore]
async fn worker_tracks_bucket_and_records_one_shot_runs() {
    let store = bucket().await;
    store.put("job.a", job_json("a", "0 0 1 1 *", "it-host")).await.unwrap();

    let settings = WorkerSettings {
        host_name: "it-host".to_string(),
        node_id: "it-node".to_string(),
        shell: "/bin/sh".to_string(),
        feed_retry: RetryPolicy::default(),
    };
    let handle = Worker::new(
        settings,
        NatsKvFeed::new(store.clone()),
        MockKiller::new(),
        NatsProcessRegistry::new(store.clone()),
    )
    .run();

    let mut proc_watch = store.watch("proc.it-node.>").await.unwrap();

    let mut stats = None;
    for _ in 0..100 {
        stats = handle.engine().stats().await;
        if stats == Some(EngineStats { jobs: 1, commands: 1 }) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(stats, Some(EngineStats { jobs: 1, commands: 1 }));

    // one-shot requests present before the subscription are not replayed
    for _ in 0..100 {
        if handle.feeds().is_healthy() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(handle.feeds().is_healthy());

    store
        .put(
            "once.it-host.t-1",
            r#"{"id":"a","command":"sleep 1"}"#.into(),
        )
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(10), proc_watch.next())
        .await
        .expect("no process record published")
        .unwrap()
        .unwrap();
    assert_eq!(first.operation, kv::Operation::Put);
    assert!(first.key.starts_with("proc.it-node.a."));

    let second = tokio::time::timeout(Duration::from_secs(10), proc_watch.next())
        .await
        .expect("process record not removed")
        .unwrap()
        .unwrap();
    assert_eq!(second.operation, kv::Operation::Delete);

    handle.shutdown().await;
}
