//! Execution backends
//!
//! A backend knows how to execute the step files of one [`BackendKind`]:
//! [`SqlBackend`] applies `.sql` files to the target database and
//! [`ScriptBackend`] runs scripts with an interpreter chosen by extension.

pub mod script;
pub mod sql;

pub use script::ScriptBackend;
pub use sql::SqlBackend;

use crate::migration::{BackendKind, Direction, Migration, MigrationError, Step};

/// Result of a verify step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed,
    /// The check ran and reported the end-state does not hold
    Failed(String),
    /// The migration has no verify step
    NotDefined,
    /// The check was not run because the migration is not applied
    Skipped,
}

impl CheckOutcome {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, CheckOutcome::Failed(_))
    }
}

/// Executes the step files of a migration
pub trait MigrationBackend {
    fn kind(&self) -> BackendKind;

    /// Validate that the steps for `direction` could run, without running them
    ///
    /// Checks that step files are readable, that tools exist and that the
    /// target is reachable. Returns one note per check performed.
    ///
    /// # Errors
    ///
    /// Returns `DependencyMissing`, `Connection` or `InvalidFormat` for the
    /// first problem found.
    fn preflight(
        &self,
        migration: &Migration,
        direction: Direction,
    ) -> Result<Vec<String>, MigrationError>;

    /// Execute one step and return its captured output
    ///
    /// # Errors
    ///
    /// Returns `ExecutionFailed` when the step itself fails.
    fn apply_step(&self, migration: &Migration, step: &Step) -> Result<String, MigrationError>;

    /// Run a verify step
    ///
    /// # Errors
    ///
    /// Returns an error when the check could not be run at all; a check that
    /// ran and failed is `Ok(CheckOutcome::Failed(_))`.
    fn check(&self, migration: &Migration, step: &Step) -> Result<CheckOutcome, MigrationError>;
}

/// Read a step file as UTF-8 text
pub(crate) fn read_step(migration: &Migration, step: &Step) -> Result<String, MigrationError> {
    std::fs::read_to_string(&step.path).map_err(|e| {
        MigrationError::InvalidFormat(format!(
            "Cannot read step {} of '{}': {}",
            step.file_name(),
            migration.id,
            e
        ))
    })
}
