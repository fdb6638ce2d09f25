//! Verification results

use crate::backend::CheckOutcome;
use crate::migration::MigrationId;

/// What `verify` found for one migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub id: MigrationId,

    /// Whether a successful run is in effect
    pub applied: bool,

    /// `None` when the migration is not applied and there is nothing to compare
    pub checksum_matches: Option<bool>,

    pub check: CheckOutcome,
}

impl VerificationResult {
    /// Applied, no drift, and the check (if any) did not fail
    #[must_use]
    pub fn holds(&self) -> bool {
        self.applied && self.checksum_matches != Some(false) && !self.check.is_failed()
    }

    /// Reasons the result does not hold, empty when it does
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.applied {
            problems.push("not applied".to_string());
        }
        if self.checksum_matches == Some(false) {
            problems.push("step files changed since the migration was applied".to_string());
        }
        if let CheckOutcome::Failed(reason) = &self.check {
            problems.push(format!("verify check failed: {reason}"));
        }
        problems
    }
}
