//! Migration directory discovery and step file parsing

use crate::backend::script::interpreter_for;
use crate::migration::checksum::calculate_checksum;
use crate::migration::{BackendKind, Migration, MigrationError, MigrationId, Step};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::fs;
use std::path::Path;

static NAME_PATTERN: OnceCell<Regex> = OnceCell::new();
static STEP_PATTERN: OnceCell<Regex> = OnceCell::new();

fn compile(cell: &'static OnceCell<Regex>, pattern: &str) -> Result<&'static Regex, MigrationError> {
    cell.get_or_try_init(|| {
        Regex::new(pattern).map_err(|e| MigrationError::InvalidFormat(format!("Invalid regex: {}", e)))
    })
}

/// Role a file plays within a migration directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRole {
    Up,
    Down,
    Verify,
}

/// Check whether a directory name is usable as a migration name
///
/// Accepted: `create_users`, `2024-01-backfill.v2`
///
/// # Errors
///
/// Returns `MigrationError::InvalidFormat` if the name pattern fails to compile.
pub fn is_valid_name(name: &str) -> Result<bool, MigrationError> {
    let re = compile(&NAME_PATTERN, r"^[A-Za-z0-9][A-Za-z0-9_.-]*$")?;
    Ok(re.is_match(name))
}

/// Parse a step file name into its role and extension
///
/// # Example
/// - `up_01_schema.sql` → (`Up`, `"sql"`)
/// - `README.md` → `None`
///
/// # Errors
///
/// Returns `MigrationError::InvalidFormat` if the step pattern fails to compile.
pub fn parse_step_filename(filename: &str) -> Result<Option<(StepRole, String)>, MigrationError> {
    let re = compile(
        &STEP_PATTERN,
        r"^(up|down|verify)(?:_[A-Za-z0-9_.-]+)?\.([A-Za-z0-9]+)$",
    )?;
    let Some(caps) = re.captures(filename) else {
        return Ok(None);
    };
    let (Some(role), Some(ext)) = (caps.get(1), caps.get(2)) else {
        return Ok(None);
    };

    let role = match role.as_str() {
        "up" => StepRole::Up,
        "down" => StepRole::Down,
        _ => StepRole::Verify,
    };
    Ok(Some((role, ext.as_str().to_ascii_lowercase())))
}

fn accepts_extension(backend: BackendKind, ext: &str) -> bool {
    match backend {
        BackendKind::Sql => ext == "sql",
        BackendKind::Script => interpreter_for(ext).is_some(),
    }
}

/// Load one migration from its directory
///
/// Step files the backend cannot execute are ignored, so notes and fixtures
/// can live next to the steps. Returns `Ok(None)` when the directory has no
/// forward step.
///
/// # Errors
///
/// Returns errors if:
/// - The directory can't be read
/// - More than one verify file is present
/// - Checksum calculation fails
pub fn load_migration(
    dir: &Path,
    id: MigrationId,
    backend: BackendKind,
) -> Result<Option<Migration>, MigrationError> {
    let entries = fs::read_dir(dir).map_err(|e| {
        MigrationError::Store(format!(
            "Failed to read migration directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let mut up = Vec::new();
    let mut down = Vec::new();
    let mut verify = Vec::new();

    for entry in entries {
        let entry = entry.map_err(|e| {
            MigrationError::Store(format!("Failed to read directory entry: {}", e))
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let Some((role, ext)) = parse_step_filename(filename)? else {
            continue;
        };

        if !accepts_extension(backend, &ext) {
            log::debug!(
                "Ignoring {} in {}: not executable by the {} backend",
                filename,
                id,
                backend
            );
            continue;
        }

        let step = Step::new(path);
        match role {
            StepRole::Up => up.push(step),
            StepRole::Down => down.push(step),
            StepRole::Verify => verify.push(step),
        }
    }

    if up.is_empty() {
        return Ok(None);
    }

    if verify.len() > 1 {
        let names: Vec<String> = verify.iter().map(Step::file_name).collect();
        return Err(MigrationError::InvalidFormat(format!(
            "Migration '{}' has more than one verify step: {}",
            id,
            names.join(", ")
        )));
    }

    // Lexicographic file-name order is execution order
    up.sort_by_key(Step::file_name);
    down.sort_by_key(Step::file_name);

    let checksum = calculate_checksum(up.iter().chain(down.iter()).chain(verify.iter()))?;

    Ok(Some(Migration {
        id,
        backend,
        dir: dir.to_path_buf(),
        up,
        down,
        verify: verify.pop(),
        checksum,
    }))
}
