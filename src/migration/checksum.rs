//! Checksum calculation for migration step files

use crate::migration::{MigrationError, Step};
use sha2::{Digest, Sha256};
use std::fs;

/// Calculate the SHA-256 checksum of a migration's step files
///
/// Each file contributes its name and its content, so renaming a step or
/// editing it after it was applied both change the checksum. The caller
/// passes steps in a stable order.
///
/// # Errors
///
/// Returns `MigrationError::InvalidFormat` if a file cannot be read
pub fn calculate_checksum<'a>(
    steps: impl IntoIterator<Item = &'a Step>,
) -> Result<String, MigrationError> {
    let mut hasher = Sha256::new();

    for step in steps {
        let content = fs::read(&step.path).map_err(|e| {
            MigrationError::InvalidFormat(format!(
                "Failed to read migration step {}: {}",
                step.path.display(),
                e
            ))
        })?;

        hasher.update(step.file_name().as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(&content);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
