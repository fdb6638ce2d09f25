//! Migration descriptor types

use crate::migration::{BackendKind, Category};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of a migration: the `(category, name)` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MigrationId {
    pub category: Category,
    pub name: String,
}

impl MigrationId {
    pub fn new(category: Category, name: impl Into<String>) -> Self {
        Self {
            category,
            name: name.into(),
        }
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.name)
    }
}

/// One executable file of a migration (`up_01_schema.sql`, `down.sh`, ...)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub path: PathBuf,
}

impl Step {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File name used in records and error messages
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Lowercased extension, empty when the file has none
    #[must_use]
    pub fn extension(&self) -> String {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default()
    }
}

/// Direction for migration execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Apply the migration
    Up,
    /// Roll the migration back
    Down,
}

/// A discovered migration
///
/// Forward steps run in order; `down` is the optional reverse procedure and
/// `verify` an optional read-only end-state check.
#[derive(Debug, Clone)]
pub struct Migration {
    pub id: MigrationId,

    /// Backend that executes the steps
    pub backend: BackendKind,

    /// Directory holding the step files
    pub dir: PathBuf,

    /// Forward steps, in execution order
    pub up: Vec<Step>,

    /// Rollback steps, in execution order (empty when irreversible)
    pub down: Vec<Step>,

    pub verify: Option<Step>,

    /// `SHA-256` over every step file (names and contents)
    pub checksum: String,
}

impl Migration {
    #[must_use]
    pub fn category(&self) -> Category {
        self.id.category
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.id.name
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn has_rollback(&self) -> bool {
        !self.down.is_empty()
    }

    /// Steps for the given direction
    #[must_use]
    pub fn steps(&self, direction: Direction) -> &[Step] {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }
}
