//! Job execution: spawning the job's command, publishing its process record,
//! timeouts, retries and in-process cancellation.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::keys;
use crate::model::{Job, OnceJob, ProcessVal};
use crate::process::terminate_child;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Once,
}

/// A single run of a job. Holds its own snapshot of the definition.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Execution identity; also the key in [`RunningJobs`].
    pub id: String,
    pub job: Arc<Job>,
    pub timer_id: Option<String>,
    pub trigger: Trigger,
}

impl Execution {
    pub fn scheduled(job: Arc<Job>, timer_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job,
            timer_id: Some(timer_id.to_string()),
            trigger: Trigger::Scheduled,
        }
    }

    pub fn once(once: OnceJob) -> Self {
        Self {
            id: once.task_id,
            job: Arc::new(once.job),
            timer_id: None,
            trigger: Trigger::Once,
        }
    }
}

/// Starts job executions. `launch` must not block: the run happens on its
/// own task and nobody awaits it.
pub trait JobRunner: Send + Sync + Clone + 'static {
    fn launch(&self, execution: Execution);

    /// Whether `pid` is a process this runner started and has not yet reaped.
    fn owns_process(&self, pid: i32) -> bool;
}

/// Publishes the records of locally running processes to the
/// coordination store.
pub trait ProcessRegistry: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync;

    fn register(
        &self,
        key: String,
        val: ProcessVal,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn deregister(&self, key: String) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

#[derive(Debug)]
struct RunningEntry {
    token: CancellationToken,
    /// Pid of the attempt currently alive, if any.
    pid: Option<u32>,
}

/// In-flight executions, keyed by execution id. An id is tracked by at
/// most one run at a time.
#[derive(Debug, Clone, Default)]
pub struct RunningJobs(Arc<Mutex<HashMap<String, RunningEntry>>>);

impl RunningJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `id`. Returns `None` if a run with that id is already
    /// in flight.
    fn try_insert(&self, id: &str) -> Option<CancellationToken> {
        let mut running = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if running.contains_key(id) {
            return None;
        }
        let token = CancellationToken::new();
        running.insert(
            id.to_string(),
            RunningEntry {
                token: token.clone(),
                pid: None,
            },
        );
        Some(token)
    }

    fn remove(&self, id: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn set_pid(&self, id: &str, pid: Option<u32>) {
        if let Some(entry) = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(id)
        {
            entry.pid = pid;
        }
    }

    /// Whether some tracked execution's live child has this pid.
    pub fn owns_pid(&self, pid: u32) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|entry| entry.pid == Some(pid))
    }

    /// Request early termination of one execution. Returns false if it is
    /// not running.
    pub fn cancel(&self, id: &str) -> bool {
        match self.0.lock().unwrap_or_else(PoisonError::into_inner).get(id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let running = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in running.values() {
            entry.token.cancel();
        }
        running.len()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }
}

/// Drops the execution from [`RunningJobs`] however the run ends.
struct RunningGuard {
    running: RunningJobs,
    id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
    /// Terminated by SIGKILL from outside, e.g. an operator kill request.
    Killed,
    Cancelled,
    /// The command could not be started at all; never retried.
    SpawnFailed(String),
    /// Another run with the same execution id was still in flight.
    AlreadyRunning,
}

impl RunOutcome {
    /// Failures worth another attempt. A process killed from outside or a
    /// command that cannot be spawned is not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::TimedOut)
    }
}

/// Runs jobs as `<shell> -c <command>` child processes.
#[derive(Clone)]
pub struct Executor<P> {
    node_id: Arc<str>,
    shell: Arc<str>,
    registry: P,
    running: RunningJobs,
}

impl<P: ProcessRegistry> Executor<P> {
    pub fn new(node_id: &str, shell: &str, registry: P, running: RunningJobs) -> Self {
        Self {
            node_id: node_id.into(),
            shell: shell.into(),
            registry,
            running,
        }
    }

    pub fn running(&self) -> &RunningJobs {
        &self.running
    }

    /// Run `execution` to completion, including retries.
    pub async fn run(&self, execution: Execution) -> RunOutcome {
        let Some(token) = self.running.try_insert(&execution.id) else {
            warn!(
                job_id = %execution.job.id,
                execution_id = %execution.id,
                "Execution already running, skipping duplicate launch"
            );
            return RunOutcome::AlreadyRunning;
        };
        let _guard = RunningGuard {
            running: self.running.clone(),
            id: execution.id.clone(),
        };

        let job = Arc::clone(&execution.job);
        let attempts = job.retry_count.saturating_add(1);
        let mut outcome = RunOutcome::Cancelled;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = Duration::from_secs(job.retry_interval_sec);
                warn!(
                    job_id = %job.id,
                    execution_id = %execution.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Job failed, retrying"
                );
                tokio::select! {
                    _ = token.cancelled() => return RunOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            outcome = self.run_attempt(&execution, &token).await;
            if outcome == RunOutcome::Succeeded {
                info!(job_id = %job.id, execution_id = %execution.id, attempt, "Job completed");
                return outcome;
            }
            if !outcome.is_retryable() {
                break;
            }
        }

        if outcome != RunOutcome::Cancelled {
            error!(
                job_id = %job.id,
                execution_id = %execution.id,
                outcome = ?outcome,
                "Job did not complete successfully"
            );
        }
        outcome
    }

    async fn run_attempt(&self, execution: &Execution, token: &CancellationToken) -> RunOutcome {
        let job = &execution.job;

        let mut cmd = tokio::process::Command::new(&*self.shell);
        cmd.arg("-c")
            .arg(&job.command)
            .env("CRON_JOB_ID", &job.id)
            .env("CRON_TASK_ID", &execution.id)
            .env("CRON_NODE_ID", &*self.node_id)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(timer_id) = &execution.timer_id {
            cmd.env("CRON_TIMER_ID", timer_id);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(job_id = %job.id, shell = %self.shell, error = %e, "Failed to spawn job process");
                return RunOutcome::SpawnFailed(e.to_string());
            }
        };

        self.running.set_pid(&execution.id, child.id());
        let proc_key = child.id().map(|pid| keys::proc_key(&self.node_id, &job.id, pid));
        if let Some(key) = &proc_key {
            let val = ProcessVal {
                time: Some(Utc::now()),
                killed: false,
                task_id: Some(execution.id.clone()),
            };
            if let Err(e) = self.registry.register(key.clone(), val).await {
                warn!(job_id = %job.id, key = %key, error = %e, "Failed to publish process record");
            }
        }
        debug!(job_id = %job.id, execution_id = %execution.id, pid = ?child.id(), "Job process started");

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) if status.success() => RunOutcome::Succeeded,
                Ok(status) if was_sigkilled(&status) => {
                    warn!(job_id = %job.id, execution_id = %execution.id, "Job process was killed");
                    RunOutcome::Killed
                }
                Ok(status) => {
                    warn!(job_id = %job.id, %status, "Job process exited with non-zero status");
                    RunOutcome::Failed(format!("process exited with {status}"))
                }
                Err(e) => RunOutcome::Failed(e.to_string()),
            },
            _ = expire(job.timeout_sec.map(Duration::from_secs)) => {
                warn!(job_id = %job.id, timeout_sec = ?job.timeout_sec, "Job timed out");
                terminate_child(&mut child, &job.id).await;
                RunOutcome::TimedOut
            }
            _ = token.cancelled() => {
                info!(job_id = %job.id, execution_id = %execution.id, "Job cancelled");
                terminate_child(&mut child, &job.id).await;
                RunOutcome::Cancelled
            }
        };

        self.running.set_pid(&execution.id, None);
        if let Some(key) = proc_key {
            if let Err(e) = self.registry.deregister(key.clone()).await {
                warn!(job_id = %job.id, key = %key, error = %e, "Failed to remove process record");
            }
        }
        outcome
    }
}

impl<P: ProcessRegistry> JobRunner for Executor<P> {
    fn launch(&self, execution: Execution) {
        let executor = self.clone();
        tokio::spawn(async move {
            let execution_id = execution.id.clone();
            let job_id = execution.job.id.clone();
            if let Err(panic) = AssertUnwindSafe(executor.run(execution)).catch_unwind().await {
                error!(
                    job_id = %job_id,
                    execution_id = %execution_id,
                    panic = panic_message(&*panic),
                    "Job execution panicked"
                );
            }
        });
    }

    fn owns_process(&self, pid: i32) -> bool {
        u32::try_from(pid).is_ok_and(|pid| self.running.owns_pid(pid))
    }
}

async fn expire(timeout: Option<Duration>) {
    match timeout {
        Some(after) => tokio::time::sleep(after).await,
        None => std::future::pending().await,
    }
}

fn was_sigkilled(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(nix::sys::signal::Signal::SIGKILL as i32)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
