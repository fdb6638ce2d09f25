//! # Drydock
//!
//! Orchestrator for named, categorized database and deployment migrations:
//! run, roll back, verify and dry-run single migrations, with an append-only
//! audit trail and a per-migration execution lock.
//!
//! The `migrate` binary in `drydock-migrate` is the command-line front end.

pub mod backend;
pub mod config;
pub mod connection;
pub mod executor;
pub mod migration;

pub use config::OrchestratorConfig;
pub use executor::{ExecError, PostgresExecutor, SqlExecutor};
pub use migration::{Category, MigrationError, Migrator};
