use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cron schedule plus the nodes it should run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timer {
    #[serde(rename = "timer_id")]
    pub id: String,
    pub cron: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl Timer {
    pub fn targets(&self, host_name: &str) -> bool {
        self.nodes.iter().any(|n| n == host_name)
    }
}

/// Job definition stored under `job.<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Shell command line, run as `<shell> -c <command>`.
    pub command: String,
    #[serde(default)]
    pub timers: Vec<Timer>,
    /// A paused job keeps its definition but schedules nothing.
    #[serde(default)]
    pub pause: bool,
    /// Kill the process after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    /// Extra attempts after a failed run.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_interval_sec: u64,
    /// Node holding this job in memory; stamped locally, never serialized.
    #[serde(skip)]
    pub run_on: Option<String>,
}

impl Job {
    /// One command per timer, in timer order. Paused jobs have none.
    pub fn cmds(&self) -> Vec<Cmd> {
        if self.pause {
            return Vec::new();
        }
        self.timers
            .iter()
            .map(|timer| Cmd {
                id: CmdId::new(&self.id, &timer.id),
                timer: timer.clone(),
            })
            .collect()
    }
}

/// Identity of a command: job id + timer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmdId {
    pub job_id: String,
    pub timer_id: String,
}

impl CmdId {
    pub fn new(job_id: impl Into<String>, timer_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            timer_id: timer_id.into(),
        }
    }
}

impl fmt::Display for CmdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.timer_id)
    }
}

/// A job paired with one of its timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub id: CmdId,
    pub timer: Timer,
}

impl Cmd {
    pub fn targets(&self, host_name: &str) -> bool {
        self.timer.targets(host_name)
    }
}

/// One-shot run request stored under `once.<host>.<task_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnceJob {
    #[serde(flatten)]
    pub job: Job,
    #[serde(default)]
    pub task_id: String,
}

/// Identity parsed from a `proc.<node_id>.<job_id>.<pid>` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessKey {
    pub node_id: String,
    pub job_id: String,
    pub pid: i32,
}

/// Value of a process record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessVal {
    /// When the process was started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Set by an operator to request a forced kill.
    #[serde(default)]
    pub killed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub key: ProcessKey,
    pub val: ProcessVal,
}

/// Shared cell holding the current definition of a job.
///
/// Scheduled tasks read it when they fire; a modify event swaps the
/// contents so tasks whose schedule did not change pick up the new
/// definition without being re-registered.
///
/// The swap is the only write. A task registered once for an unchanged
/// cron expression has no other path to the new definition, and each run
/// clones out its own `Arc<Job>`, so a running execution never sees the
/// definition change under it.
#[derive(Debug, Clone)]
pub struct JobSlot(Arc<RwLock<Arc<Job>>>);

impl JobSlot {
    pub fn new(job: Job) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(job))))
    }

    pub fn current(&self) -> Arc<Job> {
        Arc::clone(&self.0.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn replace(&self, job: Job) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(job);
    }
}
