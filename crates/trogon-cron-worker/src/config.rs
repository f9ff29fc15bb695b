use std::str::FromStr;
use std::time::Duration;

use crate::backoff::RetryPolicy;
use crate::connect::NatsConfig;
use crate::env::ReadEnv;
use crate::error::ConfigError;
use crate::keys::{self, DEFAULT_BUCKET};

const DEFAULT_SHELL: &str = "/bin/sh";
const DEFAULT_HEALTH_PORT: u16 = 8080;
const DEFAULT_FEED_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_FEED_BACKOFF_SECS: u64 = 1;
const DEFAULT_FEED_MAX_BACKOFF_SECS: u64 = 30;

/// Configuration of one worker node.
///
/// Resolved from environment variables:
/// - `CRON_WORKER_HOSTNAME`: name matched against timer node lists and
///   `once.<host>` keys (default: system host name)
/// - `CRON_WORKER_NODE_ID`: identity in `proc.<node>` keys (default: host name)
/// - `CRON_WORKER_BUCKET`: KV bucket (default: `cron_jobs`)
/// - `CRON_WORKER_SHELL`: shell used as `<shell> -c <command>` (default: `/bin/sh`)
/// - `CRON_WORKER_FEED_MAX_ATTEMPTS`, `CRON_WORKER_FEED_BACKOFF_SECS`,
///   `CRON_WORKER_FEED_MAX_BACKOFF_SECS`: feed re-subscription policy
/// - `CRON_WORKER_HEALTH_PORT`: health endpoint port (default: 8080)
/// - Standard `NATS_*` variables for the connection
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host_name: String,
    pub node_id: String,
    pub bucket: String,
    pub shell: String,
    pub feed_retry: RetryPolicy,
    pub health_port: u16,
    pub nats: NatsConfig,
}

impl WorkerConfig {
    pub fn from_env<E: ReadEnv>(env: &E) -> Result<Self, ConfigError> {
        let host_name = match env.var("CRON_WORKER_HOSTNAME") {
            Ok(name) => name,
            Err(_) => system_host_name()?,
        };
        validate_dotted("CRON_WORKER_HOSTNAME", &host_name)?;

        let node_id = env
            .var("CRON_WORKER_NODE_ID")
            .unwrap_or_else(|_| host_name.clone());
        validate_dotted("CRON_WORKER_NODE_ID", &node_id)?;

        let bucket = env
            .var("CRON_WORKER_BUCKET")
            .unwrap_or_else(|_| DEFAULT_BUCKET.to_string());
        if bucket.is_empty() {
            return Err(ConfigError::Empty("CRON_WORKER_BUCKET"));
        }
        if let Some(ch) = bucket.chars().find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))) {
            return Err(ConfigError::InvalidCharacter {
                field: "CRON_WORKER_BUCKET",
                ch,
            });
        }

        let shell = env
            .var("CRON_WORKER_SHELL")
            .unwrap_or_else(|_| DEFAULT_SHELL.to_string());
        if shell.trim().is_empty() {
            return Err(ConfigError::Empty("CRON_WORKER_SHELL"));
        }

        let max_attempts = parse_or(env, "CRON_WORKER_FEED_MAX_ATTEMPTS", DEFAULT_FEED_MAX_ATTEMPTS)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "CRON_WORKER_FEED_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }
        let feed_retry = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(parse_or(
                env,
                "CRON_WORKER_FEED_BACKOFF_SECS",
                DEFAULT_FEED_BACKOFF_SECS,
            )?),
            max_delay: Duration::from_secs(parse_or(
                env,
                "CRON_WORKER_FEED_MAX_BACKOFF_SECS",
                DEFAULT_FEED_MAX_BACKOFF_SECS,
            )?),
        };

        Ok(Self {
            host_name,
            node_id,
            bucket,
            shell,
            feed_retry,
            health_port: parse_or(env, "CRON_WORKER_HEALTH_PORT", DEFAULT_HEALTH_PORT)?,
            nats: NatsConfig::from_env(env),
        })
    }
}

fn parse_or<E: ReadEnv, T: FromStr>(env: &E, field: &'static str, default: T) -> Result<T, ConfigError> {
    match env.var(field) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { field, value }),
        Err(_) => Ok(default),
    }
}

fn validate_dotted(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Empty(field));
    }
    match keys::invalid_dotted_char(value) {
        Some(ch) => Err(ConfigError::InvalidCharacter { field, ch }),
        None => Ok(()),
    }
}

fn system_host_name() -> Result<String, ConfigError> {
    let name = nix::unistd::gethostname().map_err(|e| ConfigError::HostName(e.to_string()))?;
    name.into_string()
        .map_err(|raw| ConfigError::HostName(format!("not valid UTF-8: {raw:?}")))
}
