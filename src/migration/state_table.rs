//! Execution state kept in the target database
//!
//! `drydock_execution_records` holds the same append-only records as the
//! JSON Lines file, and `drydock_locks` holds one row per migration being
//! executed. Used when several hosts share a target database.

use crate::executor::{ExecError, SqlExecutor};
use crate::migration::lock::{ExecutionLock, LockInfo};
use crate::migration::tracker::StatusStore;
use crate::migration::{ExecutionRecord, MigrationError, MigrationId};
use std::rc::Rc;
use std::time::Duration;
use uuid::Uuid;

/// Create the state tables if they don't exist
///
/// # Errors
///
/// Returns `MigrationError::Store` if the DDL fails.
pub fn initialize_state_tables(executor: &dyn SqlExecutor) -> Result<(), MigrationError> {
    let sql = r#"
        CREATE TABLE IF NOT EXISTS drydock_execution_records (
            seq BIGSERIAL PRIMARY KEY,
            attempt_id TEXT NOT NULL,
            category TEXT NOT NULL,
            name TEXT NOT NULL,
            operation TEXT NOT NULL,
            outcome TEXT NOT NULL,
            recorded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            payload TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_drydock_execution_records_migration
            ON drydock_execution_records (category, name);
        CREATE TABLE IF NOT EXISTS drydock_locks (
            category TEXT NOT NULL,
            name TEXT NOT NULL,
            attempt_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            acquired_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (category, name)
        );
    "#;

    executor.batch_execute(sql).map_err(store_error)
}

fn store_error(err: ExecError) -> MigrationError {
    MigrationError::Store(err.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, MigrationError> {
    serde_json::to_string(value).map_err(|e| MigrationError::Store(format!("Failed to encode: {}", e)))
}

fn operation_label(record: &ExecutionRecord) -> Result<String, MigrationError> {
    Ok(encode(&record.operation)?.trim_matches('"').to_string())
}

fn outcome_label(record: &ExecutionRecord) -> Result<String, MigrationError> {
    Ok(encode(&record.outcome)?.trim_matches('"').to_string())
}

/// Status store backed by `drydock_execution_records`
pub struct PgStatusStore {
    executor: Rc<dyn SqlExecutor>,
}

impl PgStatusStore {
    /// Create the store, creating its tables on first use
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the tables cannot be created.
    pub fn new(executor: Rc<dyn SqlExecutor>) -> Result<Self, MigrationError> {
        initialize_state_tables(executor.as_ref())?;
        Ok(Self { executor })
    }
}

impl StatusStore for PgStatusStore {
    fn append(&self, record: &ExecutionRecord) -> Result<(), MigrationError> {
        let attempt_id = record.attempt_id.to_string();
        let category = record.category.as_str();
        let operation = operation_label(record)?;
        let outcome = outcome_label(record)?;
        let payload = encode(record)?;

        self.executor
            .execute(
                "INSERT INTO drydock_execution_records \
                 (attempt_id, category, name, operation, outcome, payload) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &attempt_id,
                    &category,
                    &record.name,
                    &operation,
                    &outcome,
                    &payload,
                ],
            )
            .map_err(store_error)?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<ExecutionRecord>, MigrationError> {
        let rows = self
            .executor
            .query_text(
                "SELECT payload FROM drydock_execution_records ORDER BY seq",
                &[],
            )
            .map_err(store_error)?;

        rows.into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .map(|payload| {
                serde_json::from_str(&payload).map_err(|e| {
                    MigrationError::Store(format!("Corrupt record in drydock_execution_records: {}", e))
                })
            })
            .collect()
    }
}

/// Execution lock backed by `drydock_locks`
///
/// `INSERT .. ON CONFLICT DO NOTHING` is the check-and-set. Rows older than
/// `stale_after` are compared-and-deleted before the insert.
pub struct PgLock {
    executor: Rc<dyn SqlExecutor>,
    stale_after: Duration,
}

impl PgLock {
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the tables cannot be created.
    pub fn new(executor: Rc<dyn SqlExecutor>, stale_after: Duration) -> Result<Self, MigrationError> {
        initialize_state_tables(executor.as_ref())?;
        Ok(Self {
            executor,
            stale_after,
        })
    }

    fn stale_secs(&self) -> f64 {
        self.stale_after.as_secs_f64()
    }

    fn select_payload(
        &self,
        id: &MigrationId,
        stale: bool,
    ) -> Result<Option<LockInfo>, MigrationError> {
        let query = if stale {
            "SELECT payload FROM drydock_locks WHERE category = $1 AND name = $2 \
             AND acquired_at < now() - make_interval(secs => $3)"
        } else {
            "SELECT payload FROM drydock_locks WHERE category = $1 AND name = $2 \
             AND acquired_at >= now() - make_interval(secs => $3)"
        };
        let category = id.category.as_str();
        let secs = self.stale_secs();

        let rows = self
            .executor
            .query_text(query, &[&category, &id.name, &secs])
            .map_err(store_error)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .find_map(|payload| serde_json::from_str(&payload).ok()))
    }
}

impl ExecutionLock for PgLock {
    fn try_acquire(
        &self,
        id: &MigrationId,
        attempt_id: Uuid,
    ) -> Result<Option<LockInfo>, MigrationError> {
        let category = id.category.as_str();
        let mut reclaimed = None;

        if let Some(stale) = self.select_payload(id, true)? {
            let stale_attempt = stale.attempt_id.to_string();
            let deleted = self
                .executor
                .execute(
                    "DELETE FROM drydock_locks WHERE category = $1 AND name = $2 AND attempt_id = $3",
                    &[&category, &id.name, &stale_attempt],
                )
                .map_err(store_error)?;
            if deleted == 1 {
                log::warn!("Reclaiming stale lock for {} ({})", id, stale.describe());
                reclaimed = Some(stale);
            }
        }

        let info = LockInfo::new(attempt_id);
        let attempt = attempt_id.to_string();
        let payload = encode(&info)?;
        let inserted = self
            .executor
            .execute(
                "INSERT INTO drydock_locks (category, name, attempt_id, payload) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (category, name) DO NOTHING",
                &[&category, &id.name, &attempt, &payload],
            )
            .map_err(store_error)?;

        if inserted == 1 {
            return Ok(reclaimed);
        }

        let holder = self
            .select_payload(id, false)?
            .map_or_else(|| "another attempt".to_string(), |h| h.describe());
        Err(MigrationError::LockContention {
            id: id.clone(),
            holder,
        })
    }

    fn release(&self, id: &MigrationId, attempt_id: Uuid) -> Result<(), MigrationError> {
        let category = id.category.as_str();
        let attempt = attempt_id.to_string();
        self.executor
            .execute(
                "DELETE FROM drydock_locks WHERE category = $1 AND name = $2 AND attempt_id = $3",
                &[&category, &id.name, &attempt],
            )
            .map_err(store_error)?;
        Ok(())
    }

    fn holder(&self, id: &MigrationId) -> Result<Option<LockInfo>, MigrationError> {
        self.select_payload(id, false)
    }
}
