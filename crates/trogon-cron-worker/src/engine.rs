//! Reconciliation engine: keeps the local scheduler in step with the job
//! definitions in the coordination store.
//!
//! [`Reconciler`] holds the node-local Jobs and Commands maps and is only
//! ever mutated from one task (see [`spawn_engine`]); feed consumers talk to
//! it through an [`EngineHandle`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decode::decode_job;
use crate::executor::{Execution, JobRunner};
use crate::feed::{EventKind, FeedEvent, FeedSink, KeyValue};
use crate::keys;
use crate::model::{Cmd, CmdId, Job, JobSlot, Timer};
use crate::scheduler::{CronScheduler, EntryId, Task};

const ENGINE_QUEUE: usize = 256;

#[derive(Debug)]
struct CmdEntry {
    entry: EntryId,
    timer: Timer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub jobs: usize,
    pub commands: usize,
}

pub struct Reconciler<S, R> {
    host_name: String,
    node_id: String,
    scheduler: S,
    runner: R,
    jobs: HashMap<String, JobSlot>,
    cmds: HashMap<CmdId, CmdEntry>,
}

impl<S: CronScheduler, R: JobRunner> Reconciler<S, R> {
    pub fn new(host_name: impl Into<String>, node_id: impl Into<String>, scheduler: S, runner: R) -> Self {
        Self {
            host_name: host_name.into(),
            node_id: node_id.into(),
            scheduler,
            runner,
            jobs: HashMap::new(),
            cmds: HashMap::new(),
        }
    }

    /// Initial load from a `job.` snapshot. Entries that fail to decode are
    /// logged and skipped. On an engine that already holds jobs this is a
    /// [`resync`](Self::resync).
    pub fn load_jobs(&mut self, snapshot: Vec<KeyValue>) {
        if !self.jobs.is_empty() {
            self.resync(snapshot);
            return;
        }

        let total = snapshot.len();
        for job in self.decode_snapshot(&snapshot) {
            self.add_job(job);
        }
        info!(
            entries = total,
            jobs = self.jobs.len(),
            commands = self.cmds.len(),
            "Loaded jobs"
        );
    }

    /// Converge on a fresh snapshot after a re-subscription: jobs missing
    /// from it are deleted, every decoded job goes through `modify_job`.
    ///
    /// A key that is present but fails to decode keeps its previous local
    /// definition.
    pub fn resync(&mut self, snapshot: Vec<KeyValue>) {
        let present: HashSet<&str> = snapshot
            .iter()
            .filter_map(|kv| keys::job_id_from_key(&kv.key))
            .collect();
        let gone: Vec<String> = self
            .jobs
            .keys()
            .filter(|id| !present.contains(id.as_str()))
            .cloned()
            .collect();

        for id in &gone {
            self.delete_job(id);
        }
        for job in self.decode_snapshot(&snapshot) {
            self.modify_job(job);
        }
        info!(
            removed = gone.len(),
            jobs = self.jobs.len(),
            commands = self.cmds.len(),
            "Resynced jobs"
        );
    }

    /// Apply one live event from the `job.` feed.
    pub fn apply(&mut self, event: FeedEvent) {
        let Some(id) = keys::job_id_from_key(&event.key) else {
            debug!(key = %event.key, "Ignoring event outside the job prefix");
            return;
        };

        match event.kind {
            EventKind::Delete => {
                self.delete_job(id);
            }
            kind => {
                let mut job = match decode_job(&event.key, &event.value) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(error = %e, "Ignoring invalid job definition");
                        return;
                    }
                };
                job.run_on = Some(self.node_id.clone());
                if kind == EventKind::Create {
                    self.add_job(job);
                } else {
                    self.modify_job(job);
                }
            }
        }
    }

    /// Insert a job and register every command that targets this host.
    /// A job that is already known is handled as a modification.
    pub fn add_job(&mut self, job: Job) {
        if self.jobs.contains_key(&job.id) {
            self.modify_job(job);
            return;
        }

        let cmds = self.local_cmds(&job);
        let slot = JobSlot::new(job);
        let job_id = slot.current().id.clone();
        self.jobs.insert(job_id.clone(), slot.clone());

        for cmd in cmds {
            self.add_cmd(cmd, &slot);
        }
        info!(job_id = %job_id, "Job added");
    }

    /// Replace a job's definition and diff its commands against the ones
    /// registered before. Commands whose cron expression did not change
    /// keep their scheduler entry.
    pub fn modify_job(&mut self, job: Job) {
        let Some(slot) = self.jobs.get(&job.id).cloned() else {
            self.add_job(job);
            return;
        };

        let job_id = job.id.clone();
        let prior: Vec<CmdId> = self
            .cmds
            .keys()
            .filter(|id| id.job_id == job_id)
            .cloned()
            .collect();
        let cmds = self.local_cmds(&job);
        slot.replace(job);

        let mut kept = HashSet::new();
        for cmd in cmds {
            kept.insert(cmd.id.clone());
            if self.cmds.contains_key(&cmd.id) {
                self.modify_cmd(cmd, &slot);
            } else {
                self.add_cmd(cmd, &slot);
            }
        }

        for id in prior.iter().filter(|id| !kept.contains(*id)) {
            self.remove_cmd(id);
        }
        info!(job_id = %job_id, "Job modified");
    }

    /// Forget a job and every command registered for it. Unknown ids are a
    /// no-op. Returns whether the job was known.
    pub fn delete_job(&mut self, job_id: &str) -> bool {
        if self.jobs.remove(job_id).is_none() {
            debug!(job_id, "Delete for unknown job ignored");
            return false;
        }

        let cmds: Vec<CmdId> = self
            .cmds
            .keys()
            .filter(|id| id.job_id == job_id)
            .cloned()
            .collect();
        for id in &cmds {
            self.remove_cmd(id);
        }
        info!(job_id, removed_commands = cmds.len(), "Job deleted");
        true
    }

    pub fn job(&self, job_id: &str) -> Option<Arc<Job>> {
        self.jobs.get(job_id).map(JobSlot::current)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn cmd_count(&self) -> usize {
        self.cmds.len()
    }

    /// Scheduler entry currently backing a command.
    pub fn entry(&self, id: &CmdId) -> Option<EntryId> {
        self.cmds.get(id).map(|c| c.entry)
    }

    pub fn cmd_ids(&self) -> Vec<CmdId> {
        let mut ids: Vec<CmdId> = self.cmds.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            jobs: self.jobs.len(),
            commands: self.cmds.len(),
        }
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Commands of `job` that target this host.
    fn local_cmds(&self, job: &Job) -> Vec<Cmd> {
        job.cmds()
            .into_iter()
            .filter(|c| c.targets(&self.host_name))
            .collect()
    }

    fn decode_snapshot(&self, snapshot: &[KeyValue]) -> Vec<Job> {
        snapshot
            .iter()
            .filter_map(|kv| match decode_job(&kv.key, &kv.value) {
                Ok(mut job) => {
                    job.run_on = Some(self.node_id.clone());
                    Some(job)
                }
                Err(e) => {
                    warn!(error = %e, "Skipping invalid job definition");
                    None
                }
            })
            .collect()
    }

    fn add_cmd(&mut self, cmd: Cmd, slot: &JobSlot) {
        let task = self.task(slot, &cmd.id.timer_id);
        match self.scheduler.register(&cmd.timer.cron, task) {
            Ok(entry) => {
                debug!(cmd = %cmd.id, %entry, cron = %cmd.timer.cron, "Command scheduled");
                self.cmds.insert(
                    cmd.id,
                    CmdEntry {
                        entry,
                        timer: cmd.timer,
                    },
                );
            }
            Err(e) => {
                warn!(cmd = %cmd.id, error = %e, "Dropping command with unschedulable timer");
            }
        }
    }

    fn modify_cmd(&mut self, cmd: Cmd, slot: &JobSlot) {
        let Some(current) = self.cmds.get_mut(&cmd.id) else {
            self.add_cmd(cmd, slot);
            return;
        };
        if current.timer.cron == cmd.timer.cron {
            current.timer = cmd.timer;
            return;
        }

        debug!(cmd = %cmd.id, from = %current.timer.cron, to = %cmd.timer.cron, "Rescheduling command");
        self.remove_cmd(&cmd.id);
        self.add_cmd(cmd, slot);
    }

    fn remove_cmd(&mut self, id: &CmdId) {
        if let Some(current) = self.cmds.get(id) {
            self.scheduler.unregister(current.entry);
            debug!(cmd = %id, entry = %current.entry, "Command unscheduled");
        }
        self.cmds.remove(id);
    }

    fn task(&self, slot: &JobSlot, timer_id: &str) -> Task {
        let slot = slot.clone();
        let timer_id = timer_id.to_string();
        let runner = self.runner.clone();
        Arc::new(move || runner.launch(Execution::scheduled(slot.current(), &timer_id)))
    }

    fn dispatch(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Load(snapshot) => self.load_jobs(snapshot),
            EngineCommand::Resync(snapshot) => self.resync(snapshot),
            EngineCommand::Apply(event) => self.apply(event),
            EngineCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }
}

pub enum EngineCommand {
    Load(Vec<KeyValue>),
    Resync(Vec<KeyValue>),
    Apply(FeedEvent),
    Stats(oneshot::Sender<EngineStats>),
}

/// Producer side of the engine task. Sends return `false` once the engine
/// has stopped.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn load(&self, snapshot: Vec<KeyValue>) -> bool {
        self.tx.send(EngineCommand::Load(snapshot)).await.is_ok()
    }

    pub async fn resync(&self, snapshot: Vec<KeyValue>) -> bool {
        self.tx.send(EngineCommand::Resync(snapshot)).await.is_ok()
    }

    pub async fn apply(&self, event: FeedEvent) -> bool {
        self.tx.send(EngineCommand::Apply(event)).await.is_ok()
    }

    /// Counts as of every command queued before this call.
    pub async fn stats(&self) -> Option<EngineStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Stats(reply)).await.ok()?;
        rx.await.ok()
    }
}

/// Move `reconciler` onto its own task. The task ends when `shutdown`
/// fires or every handle is dropped, and hands the reconciler back.
pub fn spawn_engine<S, R>(
    mut reconciler: Reconciler<S, R>,
    shutdown: CancellationToken,
) -> (EngineHandle, JoinHandle<Reconciler<S, R>>)
where
    S: CronScheduler,
    R: JobRunner,
{
    let (tx, mut rx) = mpsc::channel(ENGINE_QUEUE);

    let task = tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = rx.recv() => command,
            };
            match command {
                Some(command) => reconciler.dispatch(command),
                None => break,
            }
        }
        debug!("Engine stopped");
        reconciler
    });

    (EngineHandle { tx }, task)
}

/// Feeds the `job.` subscription into the engine. The first snapshot is a
/// load, later ones (after a re-subscription) are resyncs.
pub struct JobSink(pub EngineHandle);

impl FeedSink for JobSink {
    async fn on_snapshot(&mut self, snapshot: Vec<KeyValue>, initial: bool) {
        let delivered = if initial {
            self.0.load(snapshot).await
        } else {
            self.0.resync(snapshot).await
        };
        if !delivered {
            warn!("Engine stopped, dropping job snapshot");
        }
    }

    async fn on_event(&mut self, event: FeedEvent) {
        if !self.0.apply(event).await {
            warn!("Engine stopped, dropping job event");
        }
    }
}
