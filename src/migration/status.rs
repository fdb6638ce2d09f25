//! Migration status derived from execution history

use crate::migration::{ExecutionRecord, Migration, MigrationId, Operation, Outcome};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;

/// Lifecycle state of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Never attempted (or only dry-run / verified)
    Pending,
    /// An attempt holds the execution lock right now
    InFlight,
    Applied,
    RolledBack,
    /// Last attempt failed part way
    Failed,
    /// Last attempt started and never finished
    Interrupted,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationState::Pending => "pending",
            MigrationState::InFlight => "in_flight",
            MigrationState::Applied => "applied",
            MigrationState::RolledBack => "rolled_back",
            MigrationState::Failed => "failed",
            MigrationState::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// What the history of one migration says about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedState {
    pub state: MigrationState,

    /// The successful `run` currently in effect, if any
    pub applied: Option<ExecutionRecord>,

    /// Last record that affects applied state (terminal or dangling `started`)
    pub last: Option<ExecutionRecord>,
}

impl DerivedState {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.applied.is_some()
    }
}

/// Derive the state of one migration from its records, in append order
///
/// Applied-ness only moves on successful `run`/`rollback` records, so a failed
/// rollback leaves the migration applied while its state reads `failed`.
/// `lock_held` reports a live execution lock and wins over everything else.
#[must_use]
pub fn derive_state<'a>(
    records: impl IntoIterator<Item = &'a ExecutionRecord>,
    lock_held: bool,
) -> DerivedState {
    let relevant: Vec<&ExecutionRecord> = records
        .into_iter()
        .filter(|r| r.affects_applied_state())
        .collect();

    let finished: HashSet<_> = relevant
        .iter()
        .filter(|r| r.outcome.is_terminal())
        .map(|r| r.attempt_id)
        .collect();

    let mut applied = None;
    let mut last: Option<&ExecutionRecord> = None;

    for record in relevant.iter().copied() {
        match (record.operation, record.outcome) {
            (Operation::Run, Outcome::Success) => applied = Some(record.clone()),
            (Operation::Rollback, Outcome::Success) => applied = None,
            _ => {}
        }

        // A started record only counts once nothing superseded it
        if record.outcome == Outcome::Started && finished.contains(&record.attempt_id) {
            continue;
        }
        last = Some(record);
    }

    let state = if lock_held {
        MigrationState::InFlight
    } else {
        match last.map(|r| (r.operation, r.outcome)) {
            None => MigrationState::Pending,
            Some((_, Outcome::Started | Outcome::Interrupted)) => MigrationState::Interrupted,
            Some((_, Outcome::Failed)) => MigrationState::Failed,
            Some((Operation::Rollback, Outcome::Success)) => MigrationState::RolledBack,
            Some((_, Outcome::Success)) => MigrationState::Applied,
            // Dry runs are filtered out above
            Some((_, Outcome::DryRun)) => MigrationState::Pending,
        }
    };

    DerivedState {
        state,
        applied,
        last: last.cloned(),
    }
}

/// Status line for one registered migration
#[derive(Debug, Clone)]
pub struct MigrationStatusEntry {
    pub id: MigrationId,

    pub state: MigrationState,

    /// Whether a successful run is in effect
    pub applied: bool,

    pub applied_at: Option<DateTime<Utc>>,

    /// Checksum recorded when it was applied differs from the files on disk
    pub drifted: bool,

    pub last_record: Option<ExecutionRecord>,
}

impl MigrationStatusEntry {
    #[must_use]
    pub fn new(migration: &Migration, derived: DerivedState) -> Self {
        let drifted = derived
            .applied
            .as_ref()
            .is_some_and(|r| r.checksum != migration.checksum);

        Self {
            id: migration.id.clone(),
            state: derived.state,
            applied: derived.is_applied(),
            applied_at: derived
                .applied
                .as_ref()
                .and_then(|r| r.finished_at),
            drifted,
            last_record: derived.last,
        }
    }
}

/// Status of every registered migration
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub entries: Vec<MigrationStatusEntry>,

    /// Migrations with history that are no longer on disk
    pub orphaned: Vec<MigrationId>,

    pub total: usize,

    pub applied_count: usize,

    pub pending_count: usize,

    /// Failed or interrupted migrations
    pub attention_count: usize,
}

impl StatusReport {
    #[must_use]
    pub fn new(entries: Vec<MigrationStatusEntry>, orphaned: Vec<MigrationId>) -> Self {
        let applied_count = entries.iter().filter(|e| e.applied).count();
        let pending_count = entries.iter().filter(|e| !e.applied).count();
        let attention_count = entries
            .iter()
            .filter(|e| {
                matches!(
                    e.state,
                    MigrationState::Failed | MigrationState::Interrupted
                )
            })
            .count();

        Self {
            total: entries.len(),
            entries,
            orphaned,
            applied_count,
            pending_count,
            attention_count,
        }
    }

    /// Check if all migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0
    }

    #[must_use]
    pub fn entry(&self, id: &MigrationId) -> Option<&MigrationStatusEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }
}
