use std::path::PathBuf;
use std::time::Duration;

use async_nats::{Client, ConnectOptions, Event};
use tracing::{info, warn};

use crate::env::ReadEnv;
use crate::error::WorkerError;

const DEFAULT_NATS_URL: &str = "localhost:4222";
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Resolved in order: `NATS_CREDS`, `NATS_USER`+`NATS_PASSWORD`,
/// `NATS_TOKEN`, none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatsAuth {
    Credentials(PathBuf),
    UserPassword { user: String, password: String },
    Token(String),
    None,
}

impl NatsAuth {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Credentials(_) => "credentials file",
            Self::UserPassword { .. } => "user/password",
            Self::Token(_) => "token",
            Self::None => "none",
        }
    }

    fn from_env<E: ReadEnv>(env: &E) -> Self {
        if let Ok(path) = env.var("NATS_CREDS") {
            return Self::Credentials(PathBuf::from(path));
        }
        if let (Ok(user), Ok(password)) = (env.var("NATS_USER"), env.var("NATS_PASSWORD")) {
            return Self::UserPassword { user, password };
        }
        if let Ok(token) = env.var("NATS_TOKEN") {
            return Self::Token(token);
        }
        Self::None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatsConfig {
    pub servers: Vec<String>,
    pub auth: NatsAuth,
}

impl NatsConfig {
    /// `NATS_URL` is a comma-separated server list (default `localhost:4222`).
    pub fn from_env<E: ReadEnv>(env: &E) -> Self {
        let raw = env
            .var("NATS_URL")
            .unwrap_or_else(|_| DEFAULT_NATS_URL.to_string());
        let mut servers: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if servers.is_empty() {
            servers.push(DEFAULT_NATS_URL.to_string());
        }
        Self {
            servers,
            auth: NatsAuth::from_env(env),
        }
    }
}

fn reconnect_delay(attempts: usize) -> Duration {
    let exponent = attempts.min(5) as u32;
    Duration::from_secs(1u64 << exponent).min(MAX_RECONNECT_DELAY)
}

fn log_event(event: Event) {
    match event {
        Event::Connected => info!("NATS connected"),
        Event::Disconnected => warn!("NATS disconnected, reconnecting"),
        Event::ServerError(err) => warn!(error = %err, "NATS server error"),
        Event::ClientError(err) => warn!(error = %err, "NATS client error"),
        Event::SlowConsumer(sid) => warn!(sid, "NATS slow consumer"),
        Event::LameDuckMode => warn!("NATS server in lame duck mode"),
        Event::Closed => info!("NATS connection closed"),
        Event::Draining => info!("NATS connection draining"),
    }
}

/// Connect with retry on initial connect, capped reconnect backoff and
/// connection events logged.
pub async fn connect(config: &NatsConfig) -> Result<Client, WorkerError> {
    info!(servers = ?config.servers, auth = config.auth.description(), "Connecting to NATS");

    let options = match &config.auth {
        NatsAuth::Credentials(path) => ConnectOptions::with_credentials_file(path.clone())
            .await
            .map_err(|e| WorkerError::Connect(format!("credentials file {}: {e}", path.display())))?,
        NatsAuth::UserPassword { user, password } => {
            ConnectOptions::with_user_and_password(user.clone(), password.clone())
        }
        NatsAuth::Token(token) => ConnectOptions::with_token(token.clone()),
        NatsAuth::None => ConnectOptions::new(),
    };

    options
        .retry_on_initial_connect()
        .connection_timeout(CONNECTION_TIMEOUT)
        .reconnect_delay_callback(reconnect_delay)
        .event_callback(|event| async move { log_event(event) })
        .connect(&config.servers)
        .await
        .map_err(|e| WorkerError::Connect(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::InMemoryEnv;

    #[test]
    fn defaults_to_localhost_without_auth() {
        let config = NatsConfig::from_env(&InMemoryEnv::new());
        assert_eq!(config.servers, vec!["localhost:4222"]);
        assert_eq!(config.auth, NatsAuth::None);
    }

    #[test]
    fn splits_server_list() {
        let env = InMemoryEnv::new();
        env.set("NATS_URL", "a:4222, b:4222,,");
        assert_eq!(NatsConfig::from_env(&env).servers, vec!["a:4222", "b:4222"]);
    }

    #[test]
    fn credentials_take_priority() {
        let env = InMemoryEnv::new();
        env.set("NATS_CREDS", "/etc/nats.creds");
        env.set("NATS_TOKEN", "secret");
        assert_eq!(
            NatsConfig::from_env(&env).auth,
            NatsAuth::Credentials(PathBuf::from("/etc/nats.creds"))
        );
    }

    #[test]
    fn user_needs_password() {
        let env = InMemoryEnv::new();
        env.set("NATS_USER", "worker");
        env.set("NATS_TOKEN", "secret");
        assert_eq!(NatsConfig::from_env(&env).auth, NatsAuth::Token("secret".to_string()));
    }

    #[test]
    fn reconnect_delay_doubles_then_caps() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(3), Duration::from_secs(8));
        assert_eq!(reconnect_delay(5), Duration::from_secs(30));
        assert_eq!(reconnect_delay(usize::MAX), Duration::from_secs(30));
    }
}
