use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::RetryPolicy;
use crate::config::WorkerConfig;
use crate::controller::{ExecutionController, OnceSink, ProcSink};
use crate::engine::{EngineHandle, JobSink, Reconciler, spawn_engine};
use crate::executor::{Executor, ProcessRegistry, RunningJobs};
use crate::feed::{ChangeFeed, FeedHealth, FeedName, FeedSink, supervise};
use crate::health::HealthState;
use crate::keys;
use crate::process::ProcessKiller;
use crate::scheduler::TokioCron;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Identity and tuning of one worker, independent of how it connects.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub host_name: String,
    pub node_id: String,
    pub shell: String,
    pub feed_retry: RetryPolicy,
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            host_name: config.host_name.clone(),
            node_id: config.node_id.clone(),
            shell: config.shell.clone(),
            feed_retry: config.feed_retry,
        }
    }
}

pub struct Worker<F, K, P> {
    settings: WorkerSettings,
    feed: F,
    killer: K,
    registry: P,
}

impl<F, K, P> Worker<F, K, P>
where
    F: ChangeFeed,
    K: ProcessKiller,
    P: ProcessRegistry,
{
    pub fn new(settings: WorkerSettings, feed: F, killer: K, registry: P) -> Self {
        Self {
            settings,
            feed,
            killer,
            registry,
        }
    }

    /// Start the scheduler, the reconciliation engine and the three feed
    /// consumers, then return without waiting on any of them.
    pub fn run(self) -> WorkerHandle {
        let Self {
            settings,
            feed,
            killer,
            registry,
        } = self;

        let shutdown = CancellationToken::new();
        let feeds = FeedHealth::new();
        let running = RunningJobs::new();

        let executor = Executor::new(&settings.node_id, &settings.shell, registry, running.clone());

        let scheduler = TokioCron::new();
        scheduler.start();
        let reconciler = Reconciler::new(
            settings.host_name.clone(),
            settings.node_id.clone(),
            scheduler,
            executor.clone(),
        );
        let (engine, engine_task) = spawn_engine(reconciler, shutdown.clone());
        let engine_task = tokio::spawn(async move {
            match engine_task.await {
                Ok(reconciler) => info!(jobs = reconciler.job_count(), "Scheduler stopped"),
                Err(e) => error!(error = %e, "Engine task failed"),
            }
        });

        let controller = ExecutionController::new(
            settings.host_name.clone(),
            settings.node_id.clone(),
            executor,
            killer,
        );

        let supervisors = vec![
            spawn_supervisor(
                &feed,
                FeedName::Jobs,
                keys::JOB_KEY_PREFIX.to_string(),
                &settings,
                &feeds,
                &shutdown,
                JobSink(engine.clone()),
            ),
            spawn_supervisor(
                &feed,
                FeedName::Once,
                keys::once_prefix(&settings.host_name),
                &settings,
                &feeds,
                &shutdown,
                OnceSink(controller.clone()),
            ),
            spawn_supervisor(
                &feed,
                FeedName::Proc,
                keys::PROC_KEY_PREFIX.to_string(),
                &settings,
                &feeds,
                &shutdown,
                ProcSink(controller),
            ),
        ];

        info!(
            host_name = %settings.host_name,
            node_id = %settings.node_id,
            "Worker started"
        );

        WorkerHandle {
            shutdown,
            feeds,
            engine,
            running,
            started: Instant::now(),
            engine_task,
            supervisors,
        }
    }
}

fn spawn_supervisor<F, S>(
    feed: &F,
    name: FeedName,
    prefix: String,
    settings: &WorkerSettings,
    health: &FeedHealth,
    shutdown: &CancellationToken,
    sink: S,
) -> JoinHandle<()>
where
    F: ChangeFeed,
    S: FeedSink,
{
    let task = supervise(
        feed.clone(),
        name,
        prefix,
        settings.feed_retry,
        health.clone(),
        shutdown.clone(),
        sink,
    );
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!(feed = %name, error = %e, "Feed stopped");
        }
    })
}

/// Control surface of a running worker.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    feeds: FeedHealth,
    engine: EngineHandle,
    running: RunningJobs,
    started: Instant,
    engine_task: JoinHandle<()>,
    supervisors: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn feeds(&self) -> &FeedHealth {
        &self.feeds
    }

    pub fn running(&self) -> &RunningJobs {
        &self.running
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); other tasks tied to
    /// the worker's lifetime (e.g. the health server) can wait on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn health_state(&self) -> HealthState {
        HealthState {
            feeds: self.feeds.clone(),
            engine: self.engine.clone(),
            running: self.running.clone(),
            started: self.started,
        }
    }

    /// Stop the feeds and the scheduler, cancel running executions and wait
    /// for them to terminate.
    pub async fn shutdown(self) {
        info!("Shutting down worker");
        self.shutdown.cancel();

        for supervisor in self.supervisors {
            let _ = supervisor.await;
        }
        let _ = self.engine_task.await;

        let cancelled = self.running.cancel_all();
        if cancelled > 0 {
            info!(executions = cancelled, "Cancelling running executions");
        }
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.running.is_empty() {
            if Instant::now() >= deadline {
                warn!(executions = self.running.len(), "Executions still running at shutdown");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("Worker stopped");
    }
}
