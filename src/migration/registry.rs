//! Migration registry: enumerates migrations on disk, grouped by category

use crate::migration::file::{is_valid_name, load_migration};
use crate::migration::{BackendKind, Category, Migration, MigrationError, MigrationId};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Enumerates migrations under `<root>/<category>/<name>/`
///
/// Listing is deterministic: categories in [`Category::ALL`] order and names
/// sorted lexicographically within a category, so `run-all` is reproducible.
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
    backends: HashMap<Category, BackendKind>,
}

impl Registry {
    /// Create a registry over `root` with the default backend per category
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            backends: HashMap::new(),
        }
    }

    /// Override the backend used for some categories
    #[must_use]
    pub fn with_backends(mut self, backends: HashMap<Category, BackendKind>) -> Self {
        self.backends = backends;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn backend_for(&self, category: Category) -> BackendKind {
        self.backends
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_backend())
    }

    /// List migrations, optionally restricted to one category
    ///
    /// A category whose directory does not exist has no migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory can't be read or a migration is malformed.
    pub fn list(&self, category: Option<Category>) -> Result<Vec<Migration>, MigrationError> {
        let categories: Vec<Category> = match category {
            Some(c) => vec![c],
            None => Category::ALL.to_vec(),
        };

        let mut migrations = Vec::new();
        for category in categories {
            migrations.extend(self.list_category(category)?);
        }
        Ok(migrations)
    }

    /// Look up a migration by category name and migration name
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::NotFound` for an unknown category.
    pub fn list_named(&self, category: Option<&str>) -> Result<Vec<Migration>, MigrationError> {
        let category = category.map(str::parse::<Category>).transpose()?;
        self.list(category)
    }

    /// Get one migration
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::NotFound` if no such migration exists.
    pub fn get(&self, category: Category, name: &str) -> Result<Migration, MigrationError> {
        let id = MigrationId::new(category, name);
        let not_found = || {
            MigrationError::NotFound(format!(
                "migration '{}' not found under {}",
                id,
                self.root.join(category.as_str()).display()
            ))
        };

        if !is_valid_name(name)? {
            return Err(not_found());
        }

        let dir = self.root.join(category.as_str()).join(name);
        if !dir.is_dir() {
            return Err(not_found());
        }

        load_migration(&dir, id.clone(), self.backend_for(category))?.ok_or_else(|| {
            MigrationError::NotFound(format!(
                "migration '{}' has no up step in {}",
                id,
                dir.display()
            ))
        })
    }

    fn list_category(&self, category: Category) -> Result<Vec<Migration>, MigrationError> {
        let category_dir = self.root.join(category.as_str());
        if !category_dir.is_dir() {
            log::debug!("No {} directory at {}", category, category_dir.display());
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&category_dir).map_err(|e| {
            MigrationError::Store(format!(
                "Failed to read migrations directory {}: {}",
                category_dir.display(),
                e
            ))
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                MigrationError::Store(format!("Failed to read directory entry: {}", e))
            })?;
            if !entry.path().is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if !is_valid_name(&name)? {
                log::warn!("Skipping {}/{}: not a valid migration name", category, name);
                continue;
            }
            names.push(name);
        }
        names.sort();

        let backend = self.backend_for(category);
        let mut migrations = Vec::with_capacity(names.len());
        for name in names {
            let dir = category_dir.join(&name);
            match load_migration(&dir, MigrationId::new(category, name.clone()), backend) {
                Ok(Some(migration)) => migrations.push(migration),
                Ok(None) => log::warn!(
                    "Skipping {}/{}: no up step executable by the {} backend",
                    category,
                    name,
                    backend
                ),
                // Reported in full by `get` for this name
                Err(e) => log::warn!("Skipping {}/{}: {}", category, name, e),
            }
        }

        Ok(migrations)
    }
}
