//! Migration-specific error types

use crate::migration::MigrationId;
use thiserror::Error;

/// Process exit code used when a verification ran but the end-state did not hold.
pub const EXIT_VERIFICATION_FAILED: i32 = 7;

/// Migration-specific errors
///
/// Every variant maps to a process exit code through [`MigrationError::exit_code`],
/// so scripts driving the CLI can tell failure classes apart.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Wrong arity or unknown subcommand; nothing was attempted
    #[error("{0}")]
    Argument(String),

    /// Interpreter or tool required by a migration is not installed
    #[error("required tool '{tool}' was not found on PATH\n{hint}")]
    DependencyMissing { tool: String, hint: String },

    /// Target database could not be reached
    #[error("cannot reach target database: {0}")]
    Connection(String),

    /// Operator asked to run something that is already applied
    #[error(
        "migration '{0}' has already been applied\n\
         Run `migrate rollback {name} {category}` first if you intend to apply it again",
        name = .0.name,
        category = .0.category
    )]
    AlreadyApplied(MigrationId),

    /// Operator asked to roll back something that was never applied
    #[error(
        "migration '{0}' is not applied, nothing to roll back\n\
         Check `migrate status` for its recorded state"
    )]
    NotApplied(MigrationId),

    /// Migration has no `down` steps
    #[error(
        "migration '{0}' defines no rollback procedure\n\
         Add a down.<ext> step next to its up step to make it reversible"
    )]
    NoRollbackDefined(MigrationId),

    /// Unknown category or migration name
    #[error("{0}")]
    NotFound(String),

    /// Another attempt holds the execution lock for this migration
    #[error(
        "migration '{id}' is already being executed ({holder})\n\
         If no other process is running it, the lock expires once it is stale"
    )]
    LockContention { id: MigrationId, holder: String },

    /// A step failed while the migration was being applied or rolled back
    #[error("migration '{id}' failed at step '{step}': {error}")]
    ExecutionFailed {
        id: MigrationId,
        step: String,
        error: String,
    },

    /// A step was killed before it could finish
    #[error("migration '{id}' was interrupted at step '{step}': {reason}")]
    Interrupted {
        id: MigrationId,
        step: String,
        reason: String,
    },

    /// Verification ran and the migration's end-state does not hold
    #[error("verification of '{id}' did not hold: {reason}")]
    VerificationFailed { id: MigrationId, reason: String },

    /// Migration directory or state file is malformed
    #[error("invalid migration format: {0}")]
    InvalidFormat(String),

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Status store read/write failure
    #[error("status store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MigrationError {
    /// Exit code for the CLI.
    ///
    /// | code | meaning |
    /// |------|---------|
    /// | 1 | argument error or missing dependency |
    /// | 2 | connection error |
    /// | 3 | migration execution failed or interrupted |
    /// | 4 | lock contention |
    /// | 5 | operator logic error |
    /// | 6 | configuration or state I/O error |
    /// | 7 | verification did not hold |
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            MigrationError::Argument(_) | MigrationError::DependencyMissing { .. } => 1,
            MigrationError::Connection(_) => 2,
            MigrationError::ExecutionFailed { .. } | MigrationError::Interrupted { .. } => 3,
            MigrationError::LockContention { .. } => 4,
            MigrationError::AlreadyApplied(_)
            | MigrationError::NotApplied(_)
            | MigrationError::NoRollbackDefined(_)
            | MigrationError::NotFound(_) => 5,
            MigrationError::VerificationFailed { .. } => EXIT_VERIFICATION_FAILED,
            MigrationError::InvalidFormat(_)
            | MigrationError::Config(_)
            | MigrationError::Store(_)
            | MigrationError::Io(_) => 6,
        }
    }

    /// Operator logic errors are reported with guidance and are not a fault of the system.
    #[must_use]
    pub fn is_operator_error(&self) -> bool {
        self.exit_code() == 5
    }
}
