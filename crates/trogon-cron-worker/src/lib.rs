//! # trogon-cron-worker
//!
//! Execution node of the distributed CRON scheduler.
//!
//! A worker mirrors the job definitions stored in a NATS KV bucket into a
//! local timer scheduler and runs the commands whose timers target its host
//! name. It also runs one-shot requests addressed to it and force-kills its
//! own processes when an operator flags them.
//!
//! ## Features
//!
//! - Live reconciliation of `job.*` entries: only commands whose schedule
//!   actually changed are re-registered.
//! - One-shot runs from `once.<host>.*` entries.
//! - Kill requests from `proc.<node>.<job>.<pid>` entries.
//! - Feeds re-subscribe with bounded backoff; their state is reported on
//!   `GET /health`.
//!
//! ## Job definition (JSON stored under `job.backup`)
//!
//! ```json
//! {
//!   "id": "backup",
//!   "command": "/usr/local/bin/backup --full",
//!   "timers": [
//!     { "timer_id": "nightly", "cron": "0 3 * * *", "nodes": ["web-1", "web-2"] }
//!   ],
//!   "timeout_sec": 3600,
//!   "retry_count": 2,
//!   "retry_interval_sec": 60
//! }
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use trogon_cron_worker::{NatsKvFeed, NatsProcessRegistry, NixKiller, Worker, WorkerSettings};
//! use trogon_cron_worker::backoff::RetryPolicy;
//!
//! #[tokio::main]
//! async fn main() {
//!     let nats = async_nats::connect("nats://localhost:4222").await.unwrap();
//!     let js = async_nats::jetstream::new(nats);
//!     let store = trogon_cron_worker::kv::get_or_create_bucket(&js, "cron_jobs").await.unwrap();
//!
//!     let settings = WorkerSettings {
//!         host_name: "web-1".to_string(),
//!         node_id: "web-1".to_string(),
//!         shell: "/bin/sh".to_string(),
//!         feed_retry: RetryPolicy::default(),
//!     };
//!     let handle = Worker::new(
//!         settings,
//!         NatsKvFeed::new(store.clone()),
//!         NixKiller,
//!         NatsProcessRegistry::new(store),
//!     )
//!     .run();
//!
//!     tokio::signal::ctrl_c().await.unwrap();
//!     handle.shutdown().await;
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod connect;
pub mod controller;
pub mod decode;
pub mod engine;
pub mod env;
pub mod error;
pub mod executor;
pub mod feed;
pub mod health;
pub mod keys;
pub mod kv;
pub mod model;
pub mod nats_impls;
pub mod process;
pub mod scheduler;
pub mod signal;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use config::WorkerConfig;
pub use controller::{ExecutionController, Outcome};
pub use engine::{EngineHandle, EngineStats, Reconciler, spawn_engine};
pub use error::{ConfigError, DecodeError, FeedError, KillError, ScheduleError, WorkerError};
pub use executor::{Execution, Executor, JobRunner, ProcessRegistry, RunningJobs};
pub use feed::{ChangeFeed, EventKind, FeedEvent, FeedHealth, FeedStatus, KeyValue};
pub use model::{Cmd, CmdId, Job, OnceJob, ProcessKey, ProcessVal, Timer};
pub use nats_impls::{NatsKvFeed, NatsProcessRegistry};
pub use process::{NixKiller, ProcessKiller};
pub use scheduler::{CronScheduler, EntryId, TokioCron};
pub use worker::{Worker, WorkerHandle, WorkerSettings};
