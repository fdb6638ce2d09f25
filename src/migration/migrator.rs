//! Migrator - core migration execution engine

use crate::backend::{CheckOutcome, MigrationBackend, ScriptBackend, SqlBackend};
use crate::config::{OrchestratorConfig, StateBackend};
use crate::connection::DatabaseHandle;
use crate::migration::lock::{ExecutionLock, FileLock, LockGuard, LockInfo};
use crate::migration::state_table::{PgLock, PgStatusStore};
use crate::migration::status::{derive_state, MigrationStatusEntry, StatusReport};
use crate::migration::tracker::{FileStatusStore, StatusTracker};
use crate::migration::verify::VerificationResult;
use crate::migration::{
    BackendKind, Category, Direction, ExecutionRecord, Migration, MigrationError, MigrationId,
    Operation, Outcome, Registry,
};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

/// Result of `run_all`
#[derive(Debug, Default)]
pub struct RunAllSummary {
    /// Terminal records of the migrations that ran (or were dry-run), in order
    pub applied: Vec<ExecutionRecord>,

    /// Migrations skipped because they were already applied
    pub skipped: Vec<MigrationId>,

    /// First failure; nothing after it was attempted
    pub failure: Option<(MigrationId, MigrationError)>,
}

impl RunAllSummary {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Core migration execution engine
///
/// Applies, rolls back and verifies single migrations, records every attempt
/// through the [`StatusTracker`] and holds the per-migration execution lock
/// for the duration of each mutating attempt.
pub struct Migrator {
    registry: Registry,
    tracker: StatusTracker,
    lock: Box<dyn ExecutionLock>,
    sql: SqlBackend,
    script: ScriptBackend,
}

impl Migrator {
    /// Assemble a migrator from its parts
    pub fn new(
        registry: Registry,
        tracker: StatusTracker,
        lock: Box<dyn ExecutionLock>,
        db: Rc<DatabaseHandle>,
    ) -> Self {
        let script = ScriptBackend::new(db.url().map(str::to_string));
        Self {
            registry,
            tracker,
            lock,
            sql: SqlBackend::new(db),
            script,
        }
    }

    /// Build a migrator from configuration
    ///
    /// With the file state backend nothing connects until a SQL step runs.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Connection` if the Postgres state backend is
    /// selected and the database is unreachable.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, MigrationError> {
        let db = Rc::new(DatabaseHandle::new(config.database_url.clone()));
        let registry = Registry::new(&config.migrations_dir).with_backends(config.backends.clone());

        let tracker;
        let lock: Box<dyn ExecutionLock>;
        match config.state_backend {
            StateBackend::File => {
                tracker = StatusTracker::new(Box::new(FileStatusStore::new(config.history_path())));
                lock = Box::new(FileLock::new(config.locks_dir(), config.lock_stale_after()));
            }
            StateBackend::Postgres => {
                let executor = db.executor()?;
                tracker = StatusTracker::new(Box::new(PgStatusStore::new(Rc::clone(&executor))?));
                lock = Box::new(PgLock::new(executor, config.lock_stale_after())?);
            }
        }

        log::debug!(
            "Migrator over {} with {:?} state in {}",
            config.migrations_dir.display(),
            config.state_backend,
            config.state_dir.display()
        );

        Ok(Self::new(registry, tracker, lock, db))
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    fn backend(&self, kind: BackendKind) -> &dyn MigrationBackend {
        match kind {
            BackendKind::Sql => &self.sql,
            BackendKind::Script => &self.script,
        }
    }

    /// List registered migrations
    ///
    /// # Errors
    ///
    /// Propagates registry errors.
    pub fn list(&self, category: Option<Category>) -> Result<Vec<Migration>, MigrationError> {
        self.registry.list(category)
    }

    /// Apply one migration, or validate it without side effects when `dry_run`
    ///
    /// # Errors
    ///
    /// - `NotFound` if the migration does not exist
    /// - `AlreadyApplied` if a successful run is in effect
    /// - `LockContention` if another attempt is in flight
    /// - `ExecutionFailed` if a step fails (the attempt is recorded as failed)
    pub fn run(
        &self,
        category: Category,
        name: &str,
        dry_run: bool,
    ) -> Result<ExecutionRecord, MigrationError> {
        let migration = self.registry.get(category, name)?;

        if self.tracker.is_applied(category, name)? {
            return Err(MigrationError::AlreadyApplied(migration.id));
        }

        if dry_run {
            self.simulate(&migration)
        } else {
            self.execute(&migration, Direction::Up)
        }
    }

    /// Validate a migration without applying it
    ///
    /// # Errors
    ///
    /// Same as [`Migrator::run`], plus the problem preflight found.
    pub fn dry_run(&self, category: Category, name: &str) -> Result<ExecutionRecord, MigrationError> {
        self.run(category, name, true)
    }

    /// Roll back an applied migration
    ///
    /// # Errors
    ///
    /// - `NotApplied` if no successful run is in effect
    /// - `NoRollbackDefined` if the migration has no down steps
    /// - `LockContention`, `ExecutionFailed` as for [`Migrator::run`]
    pub fn rollback(&self, category: Category, name: &str) -> Result<ExecutionRecord, MigrationError> {
        let migration = self.registry.get(category, name)?;

        if !self.tracker.is_applied(category, name)? {
            return Err(MigrationError::NotApplied(migration.id));
        }
        if !migration.has_rollback() {
            return Err(MigrationError::NoRollbackDefined(migration.id));
        }

        self.execute(&migration, Direction::Down)
    }

    /// Check an applied migration's end-state without changing it
    ///
    /// # Errors
    ///
    /// Returns an error if the verify check cannot be run at all (missing
    /// interpreter, unreachable database). A check that runs and fails is
    /// reported in the result.
    pub fn verify(&self, category: Category, name: &str) -> Result<VerificationResult, MigrationError> {
        let migration = self.registry.get(category, name)?;
        let started = ExecutionRecord::started(&migration, Operation::Verify);
        let derived = self.tracker.state(&migration.id)?;

        let check = match (&derived.applied, &migration.verify) {
            (None, _) => CheckOutcome::Skipped,
            (Some(_), None) => CheckOutcome::NotDefined,
            (Some(_), Some(step)) => self.backend(migration.backend).check(&migration, step)?,
        };

        let result = VerificationResult {
            id: migration.id.clone(),
            applied: derived.is_applied(),
            checksum_matches: derived
                .applied
                .as_ref()
                .map(|record| record.checksum == migration.checksum),
            check,
        };

        let finished = if result.holds() {
            started.finish(Outcome::Success, None, None)
        } else {
            started.finish(Outcome::Failed, None, Some(result.problems().join("; ")))
        };
        self.tracker.record(&finished)?;

        Ok(result)
    }

    /// Run every pending migration in registry order
    ///
    /// Applied migrations are skipped; the first failure stops the sequence.
    ///
    /// # Errors
    ///
    /// Returns an error only if the registry or the status store cannot be
    /// read. Migration failures are reported in the summary.
    pub fn run_all(
        &self,
        category: Option<Category>,
        dry_run: bool,
    ) -> Result<RunAllSummary, MigrationError> {
        let mut summary = RunAllSummary::default();

        for migration in self.registry.list(category)? {
            if self.tracker.is_applied(migration.category(), migration.name())? {
                log::debug!("Skipping {}: already applied", migration.id);
                summary.skipped.push(migration.id);
                continue;
            }

            let result = if dry_run {
                self.simulate(&migration)
            } else {
                self.execute(&migration, Direction::Up)
            };

            match result {
                Ok(record) => summary.applied.push(record),
                Err(e) => {
                    log::error!("{} failed, stopping: {}", migration.id, e);
                    summary.failure = Some((migration.id, e));
                    break;
                }
            }
        }

        Ok(summary)
    }

    /// State of every registered migration, plus history for missing ones
    ///
    /// # Errors
    ///
    /// Propagates registry, store and lock errors.
    pub fn status(&self) -> Result<StatusReport, MigrationError> {
        let migrations = self.registry.list(None)?;
        let records = self.tracker.all()?;

        let mut by_id: BTreeMap<MigrationId, Vec<&ExecutionRecord>> = BTreeMap::new();
        for record in &records {
            by_id.entry(record.id()).or_default().push(record);
        }

        let mut entries = Vec::with_capacity(migrations.len());
        for migration in &migrations {
            let history = by_id.remove(&migration.id).unwrap_or_default();
            let lock_held = self.lock.holder(&migration.id)?.is_some();
            let derived = derive_state(history, lock_held);
            entries.push(MigrationStatusEntry::new(migration, derived));
        }

        let orphaned = by_id.into_keys().collect();
        Ok(StatusReport::new(entries, orphaned))
    }

    /// Most recent records, oldest first
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn history(
        &self,
        category: Option<Category>,
        name: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionRecord>, MigrationError> {
        let mut records = self.tracker.history(category, name)?;
        if let Some(limit) = limit {
            let excess = records.len().saturating_sub(limit);
            records.drain(..excess);
        }
        Ok(records)
    }

    /// Validate without mutating the target, then record a `dry_run` entry
    fn simulate(&self, migration: &Migration) -> Result<ExecutionRecord, MigrationError> {
        if let Some(holder) = self.lock.holder(&migration.id)? {
            return Err(MigrationError::LockContention {
                id: migration.id.clone(),
                holder: holder.describe(),
            });
        }

        let backend = self.backend(migration.backend);
        let mut notes = backend.preflight(migration, Direction::Up)?;
        notes.extend(
            migration
                .up
                .iter()
                .enumerate()
                .map(|(i, step)| format!("would run step {}: {}", i + 1, step.file_name())),
        );

        let record = ExecutionRecord::started(migration, Operation::Run).finish(
            Outcome::DryRun,
            Some(notes.join("\n")),
            None,
        );
        self.tracker.record(&record)?;

        log::info!("Dry run of {} passed ({} checks)", migration.id, notes.len());
        Ok(record)
    }

    /// Run the steps for `direction` under the execution lock
    fn execute(
        &self,
        migration: &Migration,
        direction: Direction,
    ) -> Result<ExecutionRecord, MigrationError> {
        let operation = match direction {
            Direction::Up => Operation::Run,
            Direction::Down => Operation::Rollback,
        };
        let started = ExecutionRecord::started(migration, operation);

        let guard = LockGuard::acquire(self.lock.as_ref(), &migration.id, started.attempt_id)?;
        if let Some(stale) = guard.reclaimed() {
            self.mark_interrupted(&migration.id, stale)?;
        }

        // Another process may have finished while we waited for the lock
        let applied = self.tracker.is_applied(migration.category(), migration.name())?;
        match direction {
            Direction::Up if applied => {
                return Err(MigrationError::AlreadyApplied(migration.id.clone()))
            }
            Direction::Down if !applied => {
                return Err(MigrationError::NotApplied(migration.id.clone()))
            }
            _ => {}
        }

        self.tracker.record(&started)?;

        let start = Instant::now();
        let (output, result) = self.apply_steps(migration, direction);

        let finished = match &result {
            Ok(()) => started.finish(Outcome::Success, Some(output), None),
            Err(e @ MigrationError::Interrupted { .. }) => {
                started.finish(Outcome::Interrupted, Some(output), Some(e.to_string()))
            }
            Err(e) => started.finish(Outcome::Failed, Some(output), Some(e.to_string())),
        };
        self.tracker.record(&finished)?;
        guard.release()?;

        match result {
            Ok(()) => {
                log::info!(
                    "{} {} in {}ms",
                    migration.id,
                    match direction {
                        Direction::Up => "applied",
                        Direction::Down => "rolled back",
                    },
                    start.elapsed().as_millis()
                );
                Ok(finished)
            }
            Err(e) => Err(e),
        }
    }

    /// Preflight, then each step in order; stops at the first failure
    fn apply_steps(
        &self,
        migration: &Migration,
        direction: Direction,
    ) -> (String, Result<(), MigrationError>) {
        let backend = self.backend(migration.backend);
        let mut output = Vec::new();

        if let Err(e) = backend.preflight(migration, direction) {
            return (String::new(), Err(e));
        }

        let steps = migration.steps(direction);
        for (index, step) in steps.iter().enumerate() {
            log::info!(
                "{}: step {}/{} {} ({})",
                migration.id,
                index + 1,
                steps.len(),
                step.file_name(),
                backend.kind()
            );
            match backend.apply_step(migration, step) {
                Ok(text) => {
                    if !text.trim().is_empty() {
                        output.push(text.trim_end().to_string());
                    }
                }
                Err(e) => return (output.join("\n"), Err(e)),
            }
        }

        (output.join("\n"), Ok(()))
    }

    /// Close out the attempt whose stale lock was just reclaimed
    fn mark_interrupted(&self, id: &MigrationId, stale: &LockInfo) -> Result<(), MigrationError> {
        if let Some(dangling) = self.tracker.dangling_attempt(id, stale.attempt_id)? {
            log::warn!(
                "Attempt {} of {} never finished; recording it as interrupted",
                dangling.attempt_id,
                id
            );
            let interrupted = dangling.finish(
                Outcome::Interrupted,
                None,
                Some(format!("lock reclaimed after {}", stale.describe())),
            );
            self.tracker.record(&interrupted)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::status::MigrationState;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_migration(root: &Path, category: &str, name: &str, files: &[(&str, &str)]) {
        let dir = root.join(category).join(name);
        fs::create_dir_all(&dir).unwrap();
        for (file, body) in files {
            fs::write(dir.join(file), body).unwrap();
        }
    }

    fn migrator(root: &TempDir) -> Migrator {
        let config = OrchestratorConfig {
            migrations_dir: root.path().join("migrations"),
            state_dir: root.path().join("state"),
            ..OrchestratorConfig::default()
        };
        Migrator::from_config(&config).unwrap()
    }

    #[test]
    fn test_backend_dispatch_by_kind() {
        let root = TempDir::new().unwrap();
        let migrator = migrator(&root);
        assert_eq!(migrator.backend(BackendKind::Sql).kind(), BackendKind::Sql);
        assert_eq!(migrator.backend(BackendKind::Script).kind(), BackendKind::Script);
    }

    #[test]
    fn test_run_and_rollback_script_migration() {
        let root = TempDir::new().unwrap();
        let marker = root.path().join("marker");
        let up = format!("touch '{}'", marker.display());
        let down = format!("rm '{}'", marker.display());
        write_migration(
            &root.path().join("migrations"),
            "deployment",
            "touch_marker",
            &[("up.sh", up.as_str()), ("down.sh", down.as_str())],
        );
        let migrator = migrator(&root);

        let record = migrator.run(Category::Deployment, "touch_marker", false).unwrap();
        assert_eq!(record.outcome, Outcome::Success);
        assert!(marker.exists());
        assert!(migrator.tracker().is_applied(Category::Deployment, "touch_marker").unwrap());

        assert!(matches!(
            migrator.run(Category::Deployment, "touch_marker", false),
            Err(MigrationError::AlreadyApplied(_))
        ));

        migrator.rollback(Category::Deployment, "touch_marker").unwrap();
        assert!(!marker.exists());
        assert!(!migrator.tracker().is_applied(Category::Deployment, "touch_marker").unwrap());
    }

    #[test]
    fn test_failed_step_stops_and_is_recorded() {
        let root = TempDir::new().unwrap();
        write_migration(
            &root.path().join("migrations"),
            "maintenance",
            "broken",
            &[
                ("up_01.sh", "echo first"),
                ("up_02.sh", "echo nope >&2; exit 4"),
                ("up_03.sh", "echo never"),
            ],
        );
        let migrator = migrator(&root);

        let err = migrator.run(Category::Maintenance, "broken", false).unwrap_err();
        assert_eq!(err.exit_code(), 3);

        let history = migrator.history(None, Some("broken"), None).unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.outcome, Outcome::Failed);
        assert_eq!(last.output.as_deref(), Some("first"));
        assert!(last.error.as_deref().unwrap().contains("up_02.sh"));

        let report = migrator.status().unwrap();
        let entry = report.entries.first().unwrap();
        assert_eq!(entry.state, MigrationState::Failed);
        assert!(!entry.applied);
    }

    #[test]
    fn test_rollback_without_down_steps() {
        let root = TempDir::new().unwrap();
        write_migration(
            &root.path().join("migrations"),
            "prisma",
            "generate",
            &[("up.sh", "true")],
        );
        let migrator = migrator(&root);

        assert!(matches!(
            migrator.rollback(Category::Prisma, "generate"),
            Err(MigrationError::NotApplied(_))
        ));
        migrator.run(Category::Prisma, "generate", false).unwrap();
        assert!(matches!(
            migrator.rollback(Category::Prisma, "generate"),
            Err(MigrationError::NoRollbackDefined(_))
        ));
    }

    #[test]
    fn test_contended_lock_fails_fast() {
        let root = TempDir::new().unwrap();
        write_migration(
            &root.path().join("migrations"),
            "deployment",
            "deploy",
            &[("up.sh", "true")],
        );
        let migrator = migrator(&root);

        let foreign = FileLock::new(root.path().join("state").join("locks"), Duration::from_secs(3600));
        let id = MigrationId::new(Category::Deployment, "deploy");
        let _held = LockGuard::acquire(&foreign, &id, uuid::Uuid::new_v4()).unwrap();

        let err = migrator.run(Category::Deployment, "deploy", false).unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert!(matches!(
            migrator.dry_run(Category::Deployment, "deploy"),
            Err(MigrationError::LockContention { .. })
        ));
        assert_eq!(
            migrator.status().unwrap().entries[0].state,
            MigrationState::InFlight
        );
    }

    #[test]
    fn test_history_limit_keeps_latest() {
        let root = TempDir::new().unwrap();
        write_migration(
            &root.path().join("migrations"),
            "deployment",
            "deploy",
            &[("up.sh", "true"), ("down.sh", "true")],
        );
        let migrator = migrator(&root);
        migrator.run(Category::Deployment, "deploy", false).unwrap();
        migrator.rollback(Category::Deployment, "deploy").unwrap();

        let all = migrator.history(None, None, None).unwrap();
        assert_eq!(all.len(), 4);
        let latest = migrator.history(None, None, Some(1)).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].operation, Operation::Rollback);
        assert_eq!(latest[0].outcome, Outcome::Success);
    }
}
