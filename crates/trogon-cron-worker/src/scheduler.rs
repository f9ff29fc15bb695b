use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::error::ScheduleError;

/// Handle of a live scheduler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Work run every time an entry fires. Must return quickly; long work is
/// expected to be spawned.
pub type Task = Arc<dyn Fn() + Send + Sync + 'static>;

/// Registration primitive of a cron-capable scheduler.
pub trait CronScheduler: Send + 'static {
    /// Fails only when `expr` is not a valid cron expression.
    fn register(&mut self, expr: &str, task: Task) -> Result<EntryId, ScheduleError>;

    /// Unknown ids are ignored.
    fn unregister(&mut self, id: EntryId);
}

/// Parse a cron expression.
///
/// Classic 5-field expressions (`min hour dom month dow`) get a `0` seconds
/// field prepended; 6/7-field expressions and `@` shortcuts are passed to
/// the `cron` crate unchanged.
pub fn parse_schedule(expr: &str) -> Result<::cron::Schedule, ScheduleError> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(ScheduleError::InvalidExpression {
            expr: expr.to_string(),
            reason: "expression is empty".to_string(),
        });
    }

    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    ::cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidExpression {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Scheduler backed by one tokio task per entry.
///
/// Entries registered before [`TokioCron::start`] wait for it before their
/// first tick. Dropping the scheduler aborts every entry.
pub struct TokioCron {
    entries: HashMap<EntryId, AbortHandle>,
    next_id: u64,
    started: watch::Sender<bool>,
}

impl TokioCron {
    pub fn new() -> Self {
        let (started, _) = watch::channel(false);
        Self {
            entries: HashMap::new(),
            next_id: 0,
            started,
        }
    }

    pub fn start(&self) {
        self.started.send_replace(true);
        tracing::info!(entries = self.entries.len(), "Cron scheduler started");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TokioCron {
    fn default() -> Self {
        Self::new()
    }
}

impl CronScheduler for TokioCron {
    fn register(&mut self, expr: &str, task: Task) -> Result<EntryId, ScheduleError> {
        let schedule = parse_schedule(expr)?;

        self.next_id += 1;
        let id = EntryId(self.next_id);
        let mut started = self.started.subscribe();

        let handle = tokio::spawn(async move {
            if started.wait_for(|running| *running).await.is_err() {
                return;
            }

            let mut last = Utc::now();
            loop {
                // Never re-fire a tick that already ran, even if the timer woke early.
                let from = last.max(Utc::now());
                let Some(next) = schedule.after(&from).next() else {
                    tracing::warn!(entry = %id, "Schedule has no upcoming fire time");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                tracing::debug!(entry = %id, fired_at = %next, "Cron entry fired");
                task();
                last = next;
            }
        });

        self.entries.insert(id, handle.abort_handle());
        Ok(id)
    }

    fn unregister(&mut self, id: EntryId) {
        if let Some(handle) = self.entries.remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for TokioCron {
    fn drop(&mut self) {
        for (_, handle) in self.entries.drain() {
            handle.abort();
        }
    }
}
