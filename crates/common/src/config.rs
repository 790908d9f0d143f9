//! Application configuration.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Dispatcher configuration.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Base URLs for each queue target, keyed by target name.
    ///
    /// Values may reference `${NAME}` from the process manifest's
    /// `env_variables`. A path prefix in the base URL is kept, so
    /// `https://host/relay` delivers to `https://host/relay/_ah/queue/{queue}`.
    #[serde(default)]
    pub targets: BTreeMap<String, String>,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to when the process manifest does not name one.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Path to the queue manifest (`queue.yaml`).
    #[serde(default = "default_queue_manifest")]
    pub queue_manifest: PathBuf,
    /// Path to the process manifest (`app.yaml`).
    #[serde(default)]
    pub process_manifest: Option<PathBuf>,
    /// Upper bound on a single handler invocation, in seconds.
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    /// Longest a queue loop sleeps between scheduling passes, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long shutdown waits for in-flight tasks, in seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Run handlers inline on submission instead of queueing (local development).
    #[serde(default)]
    pub inline: bool,
    /// Number of dead letters kept in memory for inspection.
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
    /// Runtime worker threads; defaults to the process manifest's `--threads`.
    #[serde(default)]
    pub workers: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_manifest: default_queue_manifest(),
            process_manifest: None,
            handler_timeout_secs: default_handler_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            inline: false,
            dead_letter_capacity: default_dead_letter_capacity(),
            workers: None,
        }
    }
}

impl DispatcherConfig {
    /// Handler timeout as a [`Duration`].
    #[must_use]
    pub const fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Shutdown grace period as a [`Duration`].
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8080
}

fn default_queue_manifest() -> PathBuf {
    PathBuf::from("queue.yaml")
}

// Matches the platform's deadline for HTTP-target tasks.
const fn default_handler_timeout_secs() -> u64 {
    600
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

const fn default_shutdown_grace_secs() -> u64 {
    30
}

const fn default_dead_letter_capacity() -> usize {
    1000
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present, into the process environment)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `RELAY_ENV`)
    /// 4. Environment variables with `RELAY__` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let env = std::env::var("RELAY_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no dispatcher can run with.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.dispatcher.handler_timeout_secs == 0 {
            return Err(config::ConfigError::Message(
                "dispatcher.handler_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
