//! `ExecutionRecord` - append-only audit entries, one per attempted operation

use crate::migration::{Category, Migration, MigrationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Captured step output is truncated to this many bytes per record
pub const MAX_CAPTURED_OUTPUT: usize = 16 * 1024;

/// What an attempt was trying to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Run,
    Rollback,
    Verify,
}

/// How an attempt ended
///
/// `Started` is the only non-terminal outcome; an attempt that never gets a
/// terminal record was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Started,
    Success,
    Failed,
    DryRun,
    Interrupted,
}

impl Outcome {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Started)
    }
}

/// One entry in the status store
///
/// Records are never mutated once written. A `started` record is superseded by
/// a terminal record carrying the same `attempt_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub attempt_id: Uuid,

    pub category: Category,

    pub name: String,

    pub operation: Operation,

    pub outcome: Outcome,

    pub started_at: DateTime<Utc>,

    /// `None` while the attempt is in flight
    pub finished_at: Option<DateTime<Utc>>,

    /// Wall-clock time of the attempt in milliseconds
    pub execution_time_ms: Option<i64>,

    /// Checksum of the migration's step files at execution time
    pub checksum: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// Record for an attempt that is about to begin
    #[must_use]
    pub fn started(migration: &Migration, operation: Operation) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            category: migration.category(),
            name: migration.name().to_string(),
            operation,
            outcome: Outcome::Started,
            started_at: Utc::now(),
            finished_at: None,
            execution_time_ms: None,
            checksum: migration.checksum.clone(),
            output: None,
            error: None,
        }
    }

    /// Terminal record superseding this one
    #[must_use]
    pub fn finish(&self, outcome: Outcome, output: Option<String>, error: Option<String>) -> Self {
        let finished_at = Utc::now();
        let elapsed = (finished_at - self.started_at).num_milliseconds().max(0);

        Self {
            outcome,
            finished_at: Some(finished_at),
            execution_time_ms: Some(elapsed),
            output: output.map(truncate_output),
            error: error.map(truncate_output),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn id(&self) -> MigrationId {
        MigrationId::new(self.category, self.name.clone())
    }

    #[must_use]
    pub fn is_for(&self, id: &MigrationId) -> bool {
        self.category == id.category && self.name == id.name
    }

    /// Whether this record can change the applied state (`run`/`rollback`, not a dry run)
    #[must_use]
    pub fn affects_applied_state(&self) -> bool {
        matches!(self.operation, Operation::Run | Operation::Rollback)
            && self.outcome != Outcome::DryRun
    }
}

/// Keep the tail of long output: the last lines are usually the error.
fn truncate_output(text: String) -> String {
    if text.len() <= MAX_CAPTURED_OUTPUT {
        return text;
    }

    let mut start = text.len() - MAX_CAPTURED_OUTPUT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... {} bytes truncated]\n{}", start, &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{BackendKind, Step};
    use std::path::PathBuf;

    fn migration() -> Migration {
        Migration {
            id: MigrationId::new(Category::Backend, "create_users"),
            backend: BackendKind::Sql,
            dir: PathBuf::from("/tmp/backend/create_users"),
            up: vec![Step::new("/tmp/backend/create_users/up.sql")],
            down: vec![],
            verify: None,
            checksum: "abc".to_string(),
        }
    }

    #[test]
    fn test_finish_supersedes_with_same_attempt() {
        let started = ExecutionRecord::started(&migration(), Operation::Run);
        assert_eq!(started.outcome, Outcome::Started);
        assert!(started.finished_at.is_none());

        let done = started.finish(Outcome::Success, Some("ok".into()), None);
        assert_eq!(done.attempt_id, started.attempt_id);
        assert_eq!(done.outcome, Outcome::Success);
        assert!(done.finished_at.is_some());
        assert!(done.execution_time_ms.unwrap() >= 0);
        assert_eq!(done.started_at, started.started_at);
        // The original is untouched
        assert_eq!(started.outcome, Outcome::Started);
    }

    #[test]
    fn test_json_roundtrip_uses_snake_case() {
        let record = ExecutionRecord::started(&migration(), Operation::Rollback)
            .finish(Outcome::DryRun, None, None);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"operation\":\"rollback\""));
        assert!(json.contains("\"outcome\":\"dry_run\""));
        assert!(json.contains("\"category\":\"backend\""));
        assert!(!json.contains("\"output\""));

        let parsed: ExecutionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_affects_applied_state() {
        let started = ExecutionRecord::started(&migration(), Operation::Run);
        assert!(started.finish(Outcome::Success, None, None).affects_applied_state());
        assert!(!started.finish(Outcome::DryRun, None, None).affects_applied_state());

        let verify = ExecutionRecord::started(&migration(), Operation::Verify);
        assert!(!verify.finish(Outcome::Success, None, None).affects_applied_state());
    }

    #[test]
    fn test_truncate_output_keeps_tail() {
        let long = format!("{}END", "x".repeat(MAX_CAPTURED_OUTPUT + 10));
        let truncated = truncate_output(long);
        assert!(truncated.starts_with("[... 13 bytes truncated]"));
        assert!(truncated.ends_with("END"));
    }
}
