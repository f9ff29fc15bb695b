//! One-shot runs, kill requests and the assembled worker, using the
//! `test-support` mocks in place of NATS.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use trogon_cron_worker::backoff::RetryPolicy;
use trogon_cron_worker::feed::{FeedEvent, FeedName, FeedStatus, KeyValue};
use trogon_cron_worker::mocks::{
    MockFeed, MockKiller, MockProcessRegistry, MockRunner, RegistryOp,
};
use trogon_cron_worker::{EngineHandle, EngineStats, ExecutionController, Outcome, Worker, WorkerSettings};

const HOST: &str = "web-1";
const NODE: &str = "node-a";

fn controller() -> (ExecutionController<MockRunner, MockKiller>, MockRunner, MockKiller) {
    let runner = MockRunner::new();
    let killer = MockKiller::new();
    let ctl = ExecutionController::new(HOST, NODE, runner.clone(), killer.clone());
    (ctl, runner, killer)
}

fn once_value(command: &str) -> Vec<u8> {
    json!({ "id": "backup", "command": command }).to_string().into_bytes()
}

// ── one-shot path ─────────────────────────────────────────────────────────────

#[test]
fn once_request_launches_exactly_one_execution() {
    let (ctl, runner, _) = controller();

    let outcome = ctl.handle_once(&FeedEvent::create("once.web-1.9001", once_value("echo hi")));

    assert_eq!(outcome, Outcome::Launched { task_id: "9001".to_string() });
    assert_eq!(runner.launch_count(), 1);
    assert_eq!(runner.launched()[0].id, "9001");
}

/// Counts WARN events emitted while installed.
#[derive(Clone, Default)]
struct WarnCounter(Arc<AtomicUsize>);

impl WarnCounter {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn malformed_once_request_launches_nothing() {
    let (ctl, runner, _) = controller();
    let warnings = WarnCounter::default();
    let subscriber = tracing_subscriber::registry().with(warnings.clone());

    let outcome = tracing::subscriber::with_default(subscriber, || {
        ctl.handle_once(&FeedEvent::create("once.web-1.9001", "{\"id\":"))
    });

    assert_eq!(outcome, Outcome::Rejected);
    assert_eq!(runner.launch_count(), 0);
    assert_eq!(warnings.count(), 1);
}

#[test]
fn valid_once_request_logs_no_warning() {
    let (ctl, runner, _) = controller();
    let warnings = WarnCounter::default();
    let subscriber = tracing_subscriber::registry().with(warnings.clone());

    tracing::subscriber::with_default(subscriber, || {
        ctl.handle_once(&FeedEvent::create("once.web-1.9001", once_value("echo hi")))
    });

    assert_eq!(runner.launch_count(), 1);
    assert_eq!(warnings.count(), 0);
}

#[test]
fn once_modify_also_launches() {
    let (ctl, runner, _) = controller();
    ctl.handle_once(&FeedEvent::modify("once.web-1.1", once_value("echo hi")));
    assert_eq!(runner.launch_count(), 1);
}

// ── kill path ─────────────────────────────────────────────────────────────────

#[test]
fn kill_request_for_this_node_terminates_pid() {
    let (ctl, _, killer) = controller();

    let outcome = ctl.handle_proc(&FeedEvent::modify(
        "proc.node-a.backup.4242",
        r#"{"killed":true,"time":"2026-01-01T00:00:00Z"}"#,
    ));

    assert_eq!(outcome, Outcome::Killed { pid: 4242 });
    assert_eq!(killer.killed(), vec![4242]);
}

#[test]
fn kill_request_for_other_node_is_ignored() {
    let (ctl, _, killer) = controller();

    let outcome = ctl.handle_proc(&FeedEvent::modify("proc.node-b.backup.4242", r#"{"killed":true}"#));

    assert_eq!(outcome, Outcome::NotOwned);
    assert!(killer.killed().is_empty());
}

#[test]
fn dotted_node_ids_are_matched_exactly() {
    let killer = MockKiller::new();
    let ctl = ExecutionController::new(HOST, "web-1.dc1", MockRunner::new(), killer.clone());

    ctl.handle_proc(&FeedEvent::modify("proc.web-1.dc2.backup.7", r#"{"killed":true}"#));
    ctl.handle_proc(&FeedEvent::modify("proc.web-1.dc1.backup.8", r#"{"killed":true}"#));

    assert_eq!(killer.killed(), vec![8]);
}

// ── assembled worker ──────────────────────────────────────────────────────────

fn settings() -> WorkerSettings {
    WorkerSettings {
        host_name: HOST.to_string(),
        node_id: NODE.to_string(),
        shell: "/bin/sh".to_string(),
        feed_retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
    }
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Poll the engine until it reports `expected`; returns the last stats seen.
async fn stats_when(engine: &EngineHandle, expected: EngineStats) -> Option<EngineStats> {
    let mut stats = None;
    for _ in 0..200 {
        stats = engine.stats().await;
        if stats == Some(expected) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    stats
}

fn job_entry(id: &str) -> KeyValue {
    KeyValue {
        key: format!("job.{id}"),
        value: json!({
            "id": id,
            "command": "true",
            "timers": [{ "timer_id": "t1", "cron": "0 0 1 1 *", "nodes": [HOST] }]
        })
        .to_string()
        .into(),
    }
}

#[tokio::test]
async fn worker_loads_snapshot_and_applies_events() {
    let feed = MockFeed::new();
    feed.set_snapshot("job.", vec![job_entry("a"), job_entry("b")]);
    let handle = Worker::new(settings(), feed.clone(), MockKiller::new(), MockProcessRegistry::new()).run();

    let engine = handle.engine().clone();
    assert!(eventually(|| handle.feeds().is_healthy()).await);

    feed.send("job.", FeedEvent::delete("job.a"));
    assert_eq!(
        stats_when(&engine, EngineStats { jobs: 1, commands: 1 }).await,
        Some(EngineStats { jobs: 1, commands: 1 })
    );

    handle.shutdown().await;
    assert!(engine.stats().await.is_none());
}

#[tokio::test]
async fn worker_runs_once_request_and_records_process() {
    let feed = MockFeed::new();
    let registry = MockProcessRegistry::new();
    let handle = Worker::new(settings(), feed.clone(), MockKiller::new(), registry.clone()).run();
    assert!(eventually(|| handle.feeds().is_healthy()).await);

    feed.send("once.web-1.", FeedEvent::create("once.web-1.42", once_value("exit 0")));

    assert!(eventually(|| registry.ops().len() == 2).await);
    let ops = registry.ops();
    let RegistryOp::Register { key, val } = &ops[0] else {
        panic!("expected register first, got {ops:?}");
    };
    assert!(key.starts_with("proc.node-a.backup."));
    assert_eq!(val.task_id.as_deref(), Some("42"));
    assert_eq!(ops[1], RegistryOp::Deregister { key: key.clone() });

    handle.shutdown().await;
}

#[tokio::test]
async fn worker_kills_only_its_own_processes() {
    let feed = MockFeed::new();
    let killer = MockKiller::new();
    let registry = MockProcessRegistry::new();
    let handle = Worker::new(settings(), feed.clone(), killer.clone(), registry.clone()).run();
    assert!(eventually(|| handle.feeds().is_healthy()).await);

    feed.send("once.web-1.", FeedEvent::create("once.web-1.7", once_value("sleep 30")));
    assert!(eventually(|| !registry.ops().is_empty()).await);
    let RegistryOp::Register { key, .. } = registry.ops()[0].clone() else {
        panic!("expected a register op");
    };
    let pid: i32 = key.rsplit('.').next().unwrap().parse().unwrap();

    // another node's record, and one of ours whose pid is not a live child
    feed.send("proc.", FeedEvent::modify(format!("proc.node-b.backup.{pid}"), r#"{"killed":true}"#));
    feed.send("proc.", FeedEvent::modify(format!("proc.node-a.backup.{}", pid + 1), r#"{"killed":true}"#));
    feed.send("proc.", FeedEvent::modify(key.as_str(), r#"{"killed":true}"#));

    assert!(eventually(|| !killer.killed().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(killer.killed(), vec![pid]);

    handle.shutdown().await;
    assert!(last_record_removed(&registry));
}

fn last_record_removed(registry: &MockProcessRegistry) -> bool {
    matches!(registry.ops().last(), Some(RegistryOp::Deregister { .. }))
}

#[tokio::test]
async fn worker_survives_failing_subscriptions() {
    let feed = MockFeed::new();
    feed.fail_next_subscribes(2);
    feed.set_snapshot("job.", vec![job_entry("a")]);
    let handle = Worker::new(settings(), feed.clone(), MockKiller::new(), MockProcessRegistry::new()).run();

    assert!(eventually(|| handle.feeds().is_healthy()).await);
    assert_eq!(
        stats_when(handle.engine(), EngineStats { jobs: 1, commands: 1 }).await,
        Some(EngineStats { jobs: 1, commands: 1 })
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn exhausted_feed_is_reported_failed() {
    let feed = MockFeed::new();
    feed.fail_next_subscribes(100);
    let handle = Worker::new(settings(), feed, MockKiller::new(), MockProcessRegistry::new()).run();

    assert!(
        eventually(|| {
            let feeds = handle.feeds().snapshot();
            feeds.len() == 3 && feeds.values().all(|s| matches!(s, FeedStatus::Failed { .. }))
        })
        .await
    );
    assert!(!handle.feeds().is_healthy());
    assert!(handle.engine().stats().await.is_some());

    handle.shutdown().await;
}

#[tokio::test]
async fn job_feed_resyncs_after_stream_ends() {
    let feed = MockFeed::new();
    feed.set_snapshot("job.", vec![job_entry("a"), job_entry("b")]);
    let handle = Worker::new(settings(), feed.clone(), MockKiller::new(), MockProcessRegistry::new()).run();
    assert!(eventually(|| handle.feeds().get(FeedName::Jobs) == Some(FeedStatus::Live)).await);

    // b disappeared while the stream was down
    feed.set_snapshot("job.", vec![job_entry("a")]);
    feed.close("job.");

    assert!(eventually(|| feed.subscribe_count("job.") >= 2).await);
    assert_eq!(
        stats_when(handle.engine(), EngineStats { jobs: 1, commands: 1 }).await,
        Some(EngineStats { jobs: 1, commands: 1 })
    );

    handle.shutdown().await;
}
