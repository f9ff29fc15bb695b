//! Mock implementations for testing without a NATS server or real processes.
//!
//! Enabled with the `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! trogon-cron-worker = { path = "...", features = ["test-support"] }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::convert::Infallible;
use std::future::Future;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};

use crate::error::{KillError, ScheduleError};
use crate::executor::{Execution, JobRunner, ProcessRegistry};
use crate::feed::{ChangeFeed, FeedEvent, KeyValue, Subscription};
use crate::model::ProcessVal;
use crate::process::ProcessKiller;
use crate::scheduler::{CronScheduler, EntryId, Task, parse_schedule};

// ── MockScheduler ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCall {
    Register { entry: EntryId, expr: String },
    Unregister(EntryId),
}

/// Records every register/unregister call in order. Clones share state, so
/// a test can keep one while the engine owns another.
#[derive(Clone, Default)]
pub struct MockScheduler {
    inner: Arc<Mutex<SchedulerState>>,
}

#[derive(Default)]
struct SchedulerState {
    calls: Vec<SchedulerCall>,
    entries: BTreeMap<EntryId, (String, Task)>,
    rejected: HashSet<String>,
    next_id: u64,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    /// Number of live registrations.
    pub fn live(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn expr(&self, entry: EntryId) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&entry)
            .map(|(expr, _)| expr.clone())
    }

    /// Make `register` fail for this expression even if it parses.
    pub fn reject(&self, expr: &str) {
        self.inner.lock().unwrap().rejected.insert(expr.to_string());
    }

    /// Run the entry's task as if its schedule fired. Returns false for an
    /// unknown entry.
    pub fn fire(&self, entry: EntryId) -> bool {
        let task = self
            .inner
            .lock()
            .unwrap()
            .entries
            .get(&entry)
            .map(|(_, task)| Arc::clone(task));
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }
}

impl CronScheduler for MockScheduler {
    fn register(&mut self, expr: &str, task: Task) -> Result<EntryId, ScheduleError> {
        let mut state = self.inner.lock().unwrap();
        if state.rejected.contains(expr) {
            return Err(ScheduleError::InvalidExpression {
                expr: expr.to_string(),
                reason: "rejected by mock".to_string(),
            });
        }
        parse_schedule(expr)?;

        state.next_id += 1;
        let entry = EntryId::new(state.next_id);
        state.entries.insert(entry, (expr.to_string(), task));
        state.calls.push(SchedulerCall::Register {
            entry,
            expr: expr.to_string(),
        });
        Ok(entry)
    }

    fn unregister(&mut self, entry: EntryId) {
        let mut state = self.inner.lock().unwrap();
        state.entries.remove(&entry);
        state.calls.push(SchedulerCall::Unregister(entry));
    }
}

// ── MockRunner ────────────────────────────────────────────────────────────────

/// Records launched executions without running anything. Claims every pid
/// as its own unless told otherwise with [`MockRunner::disown`].
#[derive(Clone, Default)]
pub struct MockRunner {
    launched: Arc<Mutex<Vec<Execution>>>,
    foreign: Arc<Mutex<HashSet<i32>>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disown(&self, pid: i32) {
        self.foreign.lock().unwrap().insert(pid);
    }

    pub fn launched(&self) -> Vec<Execution> {
        self.launched.lock().unwrap().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }
}

impl JobRunner for MockRunner {
    fn launch(&self, execution: Execution) {
        self.launched.lock().unwrap().push(execution);
    }

    fn owns_process(&self, pid: i32) -> bool {
        !self.foreign.lock().unwrap().contains(&pid)
    }
}

// ── MockKiller ────────────────────────────────────────────────────────────────

/// Records kill requests. Succeeds unless [`MockKiller::fail_kills`] was called.
#[derive(Clone, Default)]
pub struct MockKiller {
    killed: Arc<Mutex<Vec<i32>>>,
    fail: Arc<AtomicBool>,
}

impl MockKiller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pid a kill was attempted on, including failed attempts.
    pub fn killed(&self) -> Vec<i32> {
        self.killed.lock().unwrap().clone()
    }

    pub fn fail_kills(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl ProcessKiller for MockKiller {
    fn kill(&self, pid: i32) -> Result<(), KillError> {
        self.killed.lock().unwrap().push(pid);
        if self.fail.load(Ordering::SeqCst) {
            return Err(KillError::Signal {
                pid,
                source: nix::errno::Errno::EPERM,
            });
        }
        Ok(())
    }
}

// ── MockProcessRegistry ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryOp {
    Register { key: String, val: ProcessVal },
    Deregister { key: String },
}

#[derive(Clone, Default)]
pub struct MockProcessRegistry {
    ops: Arc<Mutex<Vec<RegistryOp>>>,
}

impl MockProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<RegistryOp> {
        self.ops.lock().unwrap().clone()
    }
}

impl ProcessRegistry for MockProcessRegistry {
    type Error = Infallible;

    async fn register(&self, key: String, val: ProcessVal) -> Result<(), Infallible> {
        self.ops.lock().unwrap().push(RegistryOp::Register { key, val });
        Ok(())
    }

    async fn deregister(&self, key: String) -> Result<(), Infallible> {
        self.ops.lock().unwrap().push(RegistryOp::Deregister { key });
        Ok(())
    }
}

// ── MockFeed ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct MockFeedError(pub String);

type EventTx = UnboundedSender<Result<FeedEvent, MockFeedError>>;

/// In-memory change feed. Events sent while a prefix has no live subscriber
/// are buffered and delivered to the next subscription.
#[derive(Clone, Default)]
pub struct MockFeed {
    inner: Arc<Mutex<FeedState>>,
}

#[derive(Default)]
struct FeedState {
    snapshots: HashMap<String, Vec<KeyValue>>,
    senders: HashMap<String, EventTx>,
    pending: HashMap<String, Vec<Result<FeedEvent, MockFeedError>>>,
    subscribes: HashMap<String, u32>,
    fail_subscribes: u32,
}

impl MockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot returned by every later subscription to `prefix`.
    pub fn set_snapshot(&self, prefix: &str, snapshot: Vec<KeyValue>) {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .insert(prefix.to_string(), snapshot);
    }

    pub fn send(&self, prefix: &str, event: FeedEvent) {
        self.push(prefix, Ok(event));
    }

    pub fn send_error(&self, prefix: &str, message: &str) {
        self.push(prefix, Err(MockFeedError(message.to_string())));
    }

    /// End the current event stream for `prefix`.
    pub fn close(&self, prefix: &str) {
        self.inner.lock().unwrap().senders.remove(prefix);
    }

    /// Fail the next `n` subscribe calls, whatever the prefix.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.inner.lock().unwrap().fail_subscribes = n;
    }

    pub fn subscribe_count(&self, prefix: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .subscribes
            .get(prefix)
            .copied()
            .unwrap_or(0)
    }

    fn push(&self, prefix: &str, item: Result<FeedEvent, MockFeedError>) {
        let mut state = self.inner.lock().unwrap();
        let item = match state.senders.get(prefix) {
            Some(tx) => match tx.unbounded_send(item) {
                Ok(()) => return,
                Err(e) => e.into_inner(),
            },
            None => item,
        };
        state.pending.entry(prefix.to_string()).or_default().push(item);
    }

    fn subscribe_now(
        &self,
        prefix: &str,
    ) -> Result<Subscription<UnboundedReceiver<Result<FeedEvent, MockFeedError>>>, MockFeedError> {
        let mut state = self.inner.lock().unwrap();
        *state.subscribes.entry(prefix.to_string()).or_default() += 1;
        if state.fail_subscribes > 0 {
            state.fail_subscribes -= 1;
            return Err(MockFeedError(format!("subscribe to '{prefix}' refused")));
        }

        let (tx, rx) = unbounded();
        for item in state.pending.remove(prefix).unwrap_or_default() {
            let _ = tx.unbounded_send(item);
        }
        state.senders.insert(prefix.to_string(), tx);

        Ok(Subscription {
            snapshot: state.snapshots.get(prefix).cloned().unwrap_or_default(),
            events: rx,
        })
    }
}

impl ChangeFeed for MockFeed {
    type Error = MockFeedError;
    type Events = UnboundedReceiver<Result<FeedEvent, MockFeedError>>;

    fn subscribe(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Subscription<Self::Events>, Self::Error>> + Send {
        std::future::ready(self.subscribe_now(prefix))
    }
}
