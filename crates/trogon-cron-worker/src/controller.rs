//! Out-of-band execution driven by the `once.` and `proc.` feeds.

use tracing::{debug, info, warn};

use crate::decode::{decode_once_job, decode_process_val, parse_proc_key};
use crate::executor::{Execution, JobRunner};
use crate::feed::{EventKind, FeedEvent, FeedSink, KeyValue};
use crate::keys;
use crate::process::ProcessKiller;

/// What the controller did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Launched { task_id: String },
    Killed { pid: i32 },
    KillFailed { pid: i32 },
    /// Decode or validation failure; logged.
    Rejected,
    /// Process owned by another node.
    NotOwned,
    /// Record names this node but no live child of ours has that pid.
    Stale { pid: i32 },
    /// Event kind or key this path does not act on.
    Ignored,
}

#[derive(Clone)]
pub struct ExecutionController<R, K> {
    host_name: String,
    node_id: String,
    runner: R,
    killer: K,
}

impl<R: JobRunner, K: ProcessKiller> ExecutionController<R, K> {
    pub fn new(host_name: impl Into<String>, node_id: impl Into<String>, runner: R, killer: K) -> Self {
        Self {
            host_name: host_name.into(),
            node_id: node_id.into(),
            runner,
            killer,
        }
    }

    /// Launch a one-shot run for a create/modify on `once.<host_name>.*`.
    pub fn handle_once(&self, event: &FeedEvent) -> Outcome {
        if !matches!(event.kind, EventKind::Create | EventKind::Modify) {
            return Outcome::Ignored;
        }
        if !event.key.starts_with(&keys::once_prefix(&self.host_name)) {
            return Outcome::Ignored;
        }

        let mut once = match decode_once_job(&event.key, &event.value) {
            Ok(once) => once,
            Err(e) => {
                warn!(key = %event.key, error = %e, "Ignoring invalid one-shot request");
                return Outcome::Rejected;
            }
        };
        once.job.run_on = Some(self.node_id.clone());

        let task_id = once.task_id.clone();
        info!(job_id = %once.job.id, task_id = %task_id, "Launching one-shot run");
        self.runner.launch(Execution::once(once));
        Outcome::Launched { task_id }
    }

    /// Force-terminate a local process whose record was flagged `killed`.
    pub fn handle_proc(&self, event: &FeedEvent) -> Outcome {
        if event.kind != EventKind::Modify {
            return Outcome::Ignored;
        }

        let key = match parse_proc_key(&event.key) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed process key");
                return Outcome::Rejected;
            }
        };
        if key.node_id != self.node_id {
            return Outcome::NotOwned;
        }

        let val = match decode_process_val(&event.key, &event.value) {
            Ok(val) => val,
            Err(e) => {
                warn!(key = %event.key, error = %e, "Ignoring invalid process record");
                return Outcome::Rejected;
            }
        };
        if !val.killed {
            debug!(job_id = %key.job_id, pid = key.pid, "Process record updated without kill flag");
            return Outcome::Ignored;
        }

        if !self.runner.owns_process(key.pid) {
            warn!(job_id = %key.job_id, pid = key.pid, "No running job process with this pid, not signalling");
            return Outcome::Stale { pid: key.pid };
        }

        match self.killer.kill(key.pid) {
            Ok(()) => {
                info!(job_id = %key.job_id, pid = key.pid, "Killed process on request");
                Outcome::Killed { pid: key.pid }
            }
            Err(e) => {
                warn!(job_id = %key.job_id, pid = key.pid, error = %e, "Failed to kill process");
                Outcome::KillFailed { pid: key.pid }
            }
        }
    }
}

/// Feeds the `once.` subscription into an [`ExecutionController`].
pub struct OnceSink<R, K>(pub ExecutionController<R, K>);

impl<R: JobRunner, K: ProcessKiller> FeedSink for OnceSink<R, K> {
    async fn on_snapshot(&mut self, snapshot: Vec<KeyValue>, _initial: bool) {
        if !snapshot.is_empty() {
            debug!(pending = snapshot.len(), "Not replaying one-shot requests from snapshot");
        }
    }

    async fn on_event(&mut self, event: FeedEvent) {
        self.0.handle_once(&event);
    }
}

/// Feeds the `proc.` subscription into an [`ExecutionController`].
pub struct ProcSink<R, K>(pub ExecutionController<R, K>);

impl<R: JobRunner, K: ProcessKiller> FeedSink for ProcSink<R, K> {
    async fn on_snapshot(&mut self, _snapshot: Vec<KeyValue>, _initial: bool) {}

    async fn on_event(&mut self, event: FeedEvent) {
        self.0.handle_proc(&event);
    }
}
