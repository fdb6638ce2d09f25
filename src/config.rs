//! Orchestrator configuration.
//!
//! Settings are read from an optional TOML file (`config/drydock.toml` unless
//! another path is given) and overridden by `DRYDOCK__*` environment
//! variables, e.g. `DRYDOCK__STATE_DIR=/var/lib/drydock` or
//! `DRYDOCK__BACKENDS__PRISMA=sql`.
//!
//! The loaded [`OrchestratorConfig`] is passed by reference into the
//! orchestrator; nothing here is global.

use crate::migration::{BackendKind, Category, MigrationError};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config/drydock.toml";

/// Where execution records and locks are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// `<state_dir>/history.jsonl` and `<state_dir>/locks/`
    #[default]
    File,
    /// Tables in the target database
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Target database; usually supplied through `DATABASE_URL`
    #[serde(default)]
    pub database_url: Option<String>,

    /// A lock older than this is considered abandoned
    #[serde(default = "default_lock_stale_after_secs")]
    pub lock_stale_after_secs: u64,

    #[serde(default)]
    pub state_backend: StateBackend,

    /// Per-category backend overrides
    #[serde(default)]
    pub backends: HashMap<Category, BackendKind>,
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".drydock")
}

fn default_lock_stale_after_secs() -> u64 {
    3600
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            migrations_dir: default_migrations_dir(),
            state_dir: default_state_dir(),
            database_url: None,
            lock_stale_after_secs: default_lock_stale_after_secs(),
            state_backend: StateBackend::default(),
            backends: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file (optional) and `DRYDOCK__*` env vars
    ///
    /// An explicitly given `path` must exist; the default file is optional.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Config` if a source is unreadable or a value
    /// has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self, MigrationError> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("DRYDOCK")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: OrchestratorConfig = settings.try_deserialize().map_err(|e| {
            ConfigError::Message(format!("Orchestrator configuration is invalid: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), MigrationError> {
        if self.lock_stale_after_secs == 0 {
            return Err(MigrationError::Config(ConfigError::Message(
                "lock_stale_after_secs must be greater than zero".to_string(),
            )));
        }
        Ok(())
    }

    /// JSON Lines file holding execution records
    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.state_dir.join("history.jsonl")
    }

    /// Directory holding lock files
    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    #[must_use]
    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_after_secs)
    }
}
