//! SQL backend: `.sql` step files applied to the target database

use crate::backend::{read_step, CheckOutcome, MigrationBackend};
use crate::connection::DatabaseHandle;
use crate::migration::{BackendKind, Direction, Migration, MigrationError, Step};
use std::rc::Rc;
use std::time::Instant;

/// Applies each step file as one batch
///
/// A file without its own `BEGIN`/`COMMIT` runs in a single implicit
/// transaction, so a failing step leaves no partial changes behind.
pub struct SqlBackend {
    db: Rc<DatabaseHandle>,
}

impl SqlBackend {
    pub fn new(db: Rc<DatabaseHandle>) -> Self {
        Self { db }
    }
}

impl MigrationBackend for SqlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sql
    }

    fn preflight(
        &self,
        migration: &Migration,
        direction: Direction,
    ) -> Result<Vec<String>, MigrationError> {
        let mut notes = Vec::new();

        for step in migration.steps(direction).iter().chain(migration.verify.iter()) {
            let sql = read_step(migration, step)?;
            if sql.trim().is_empty() {
                return Err(MigrationError::InvalidFormat(format!(
                    "Step {} of '{}' is empty",
                    step.file_name(),
                    migration.id
                )));
            }
            notes.push(format!("{} readable ({} bytes)", step.file_name(), sql.len()));
        }

        let executor = self.db.executor()?;
        executor
            .ping()
            .map_err(|e| MigrationError::Connection(e.to_string()))?;
        notes.push("target database reachable".to_string());

        Ok(notes)
    }

    fn apply_step(&self, migration: &Migration, step: &Step) -> Result<String, MigrationError> {
        let sql = read_step(migration, step)?;
        let executor = self.db.executor()?;

        let start = Instant::now();
        executor
            .batch_execute(&sql)
            .map_err(|e| MigrationError::ExecutionFailed {
                id: migration.id.clone(),
                step: step.file_name(),
                error: e.to_string(),
            })?;

        Ok(format!(
            "{}: applied in {}ms",
            step.file_name(),
            start.elapsed().as_millis()
        ))
    }

    fn check(&self, migration: &Migration, step: &Step) -> Result<CheckOutcome, MigrationError> {
        let sql = read_step(migration, step)?;
        let executor = self.db.executor()?;

        Ok(match executor.query_flag(&sql) {
            Ok(Some(true)) => CheckOutcome::Passed,
            Ok(Some(false)) => CheckOutcome::Failed(format!("{} returned false", step.file_name())),
            Ok(None) => CheckOutcome::Failed(format!("{} returned no rows", step.file_name())),
            Err(e) => CheckOutcome::Failed(format!("{}: {}", step.file_name(), e)),
        })
    }
}
