//! Command-line arguments

use clap::{Parser, Subcommand};
use drydock::config::OrchestratorConfig;
use drydock::migration::{Category, MigrationError};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "migrate")]
#[command(about = "Run, roll back, verify and inspect categorized migrations")]
#[command(version)]
pub struct Cli {
    /// Root directory holding <category>/<name>/ migrations
    #[arg(long, global = true)]
    pub migrations_dir: Option<PathBuf>,

    /// Directory for the execution history and lock files
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Target database URL (defaults to DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Configuration file (defaults to config/drydock.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// List available migrations grouped by category
    List {
        /// Only list this category
        #[arg(long)]
        category: Option<String>,
    },

    /// Apply one migration
    Run { name: String, category: String },

    /// Apply every pending migration, in order, stopping at the first failure
    RunAll {
        /// Only run this category
        category: Option<String>,

        /// Validate each pending migration without applying it
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the state of every migration
    Status,

    /// Roll back one applied migration
    Rollback { name: String, category: String },

    /// Check that an applied migration still holds
    Verify { name: String, category: String },

    /// Validate one migration without applying it
    DryRun { name: String, category: String },

    /// Show recorded attempts, oldest first
    History {
        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        name: Option<String>,

        /// Only the most recent N records
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Database backups (not provided by this tool)
    Backup,
}

impl Cli {
    /// Effective log filter for `env_logger`
    #[must_use]
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Apply command-line overrides on top of file and environment configuration
    ///
    /// The database URL comes from `--database-url`, then `DATABASE_URL`
    /// (passed in as `env_database_url`), then the configuration.
    #[must_use]
    pub fn apply_overrides(
        &self,
        mut config: OrchestratorConfig,
        env_database_url: Option<String>,
    ) -> OrchestratorConfig {
        if let Some(dir) = &self.migrations_dir {
            config.migrations_dir = dir.clone();
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        config.database_url = self
            .database_url
            .clone()
            .or(env_database_url)
            .or(config.database_url)
            .filter(|url| !url.trim().is_empty());
        config
    }
}

/// Parse a category argument
///
/// # Errors
///
/// Returns `MigrationError::NotFound` for an unknown category.
pub fn parse_category(value: &str) -> Result<Category, MigrationError> {
    value.parse()
}

/// Parse an optional category argument
///
/// # Errors
///
/// Returns `MigrationError::NotFound` for an unknown category.
pub fn parse_optional_category(value: Option<&str>) -> Result<Option<Category>, MigrationError> {
    value.map(parse_category).transpose()
}
