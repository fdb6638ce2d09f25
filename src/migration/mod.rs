//! Migration orchestration
//!
//! This module provides:
//! - Discovery of named migrations grouped by [`Category`] ([`Registry`])
//! - Execution, rollback, dry runs and verification ([`Migrator`])
//! - The append-only audit trail of attempts ([`StatusTracker`])
//! - Per-migration execution locks ([`FileLock`], [`PgLock`])
//!
//! # Example
//!
//! ```rust,no_run
//! use drydock::config::OrchestratorConfig;
//! use drydock::migration::{Category, Migrator};
//!
//! let config = OrchestratorConfig::load(None)?;
//! let migrator = Migrator::from_config(&config)?;
//!
//! migrator.run(Category::Backend, "create_marketplace_unified", false)?;
//! assert!(migrator
//!     .tracker()
//!     .is_applied(Category::Backend, "create_marketplace_unified")?);
//! # Ok::<(), drydock::migration::MigrationError>(())
//! ```

pub mod category;
pub mod checksum;
pub mod error;
pub mod file;
pub mod lock;
#[allow(clippy::module_inception)]
pub mod migration;
pub mod migrator;
pub mod record;
pub mod registry;
pub mod state_table;
pub mod status;
pub mod tracker;
pub mod verify;

pub use category::{BackendKind, Category};
pub use error::{MigrationError, EXIT_VERIFICATION_FAILED};
pub use lock::{ExecutionLock, FileLock, LockGuard, LockInfo};
pub use migration::{Direction, Migration, MigrationId, Step};
pub use migrator::{Migrator, RunAllSummary};
pub use record::{ExecutionRecord, Operation, Outcome};
pub use registry::Registry;
pub use state_table::{PgLock, PgStatusStore};
pub use status::{MigrationState, MigrationStatusEntry, StatusReport};
pub use tracker::{FileStatusStore, StatusStore, StatusTracker};
pub use verify::VerificationResult;
