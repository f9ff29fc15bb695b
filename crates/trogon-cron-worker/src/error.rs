use thiserror::Error;

/// A KV entry that cannot be turned into a Job, OnceJob or Process.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("entry '{key}' is not valid JSON: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("entry '{key}' is invalid: {reason}")]
    Invalid { key: String, reason: String },

    #[error("malformed key '{key}': {reason}")]
    Key { key: String, reason: String },
}

impl DecodeError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn key(key: &str, reason: impl Into<String>) -> Self {
        Self::Key {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },
}

/// Failures of a change-feed subscription.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("subscribe to '{prefix}' failed: {reason}")]
    Subscribe { prefix: String, reason: String },

    #[error("feed '{prefix}' stream error: {reason}")]
    Stream { prefix: String, reason: String },

    #[error("feed '{prefix}' gave up after {attempts} failed subscription attempts")]
    Exhausted { prefix: String, attempts: u32 },
}

#[derive(Debug, Error)]
pub enum KillError {
    #[error("pid {pid} is not a valid process id")]
    InvalidPid { pid: i32 },

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::errno::Errno,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{field} contains invalid character {ch:?}")]
    InvalidCharacter { field: &'static str, ch: char },

    #[error("{field} has an invalid value: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("could not determine host name: {0}")]
    HostName(String),
}

/// Errors surfaced by the worker binary during startup.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("NATS connection failed: {0}")]
    Connect(String),

    #[error("KV error: {0}")]
    Kv(String),

    #[error("failed to encode record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
