//! Shared fixtures: a temporary migrations tree and an in-memory database

#![allow(dead_code)]

use drydock::connection::DatabaseHandle;
use drydock::executor::{ExecError, SqlExecutor};
use drydock::migration::{FileLock, FileStatusStore, Migrator, Registry, StatusTracker};
use may_postgres::types::ToSql;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;

/// Tracks `CREATE TABLE` / `DROP TABLE` statements and answers
/// `SELECT to_regclass('<table>') IS NOT NULL` style checks.
#[derive(Default)]
pub struct FakeDatabase {
    pub tables: RefCell<BTreeSet<String>>,
    pub batches: RefCell<Vec<String>>,
}

impl FakeDatabase {
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.borrow().contains(name)
    }
}

impl SqlExecutor for FakeDatabase {
    fn execute(&self, _query: &str, _params: &[&dyn ToSql]) -> Result<u64, ExecError> {
        Ok(1)
    }

    fn batch_execute(&self, script: &str) -> Result<(), ExecError> {
        // Statements are applied all-or-nothing, like one implicit transaction
        let mut tables = self.tables.borrow().clone();
        for statement in script.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let words: Vec<&str> = statement.split_whitespace().collect();
            match words.as_slice() {
                ["CREATE", "TABLE", name, ..] => {
                    if !tables.insert(name.to_string()) {
                        return Err(ExecError::QueryError(format!(
                            "relation \"{name}\" already exists"
                        )));
                    }
                }
                ["DROP", "TABLE", name, ..] => {
                    tables.remove(*name);
                }
                ["RAISE", ..] => {
                    return Err(ExecError::QueryError(statement.to_string()));
                }
                _ => {}
            }
        }
        *self.tables.borrow_mut() = tables;
        self.batches.borrow_mut().push(script.to_string());
        Ok(())
    }

    fn query_text(
        &self,
        _query: &str,
        _params: &[&dyn ToSql],
    ) -> Result<Vec<Vec<Option<String>>>, ExecError> {
        Ok(Vec::new())
    }

    fn query_flag(&self, query: &str) -> Result<Option<bool>, ExecError> {
        let table = query
            .split('\'')
            .nth(1)
            .ok_or_else(|| ExecError::QueryError(format!("unsupported check: {query}")))?;
        Ok(Some(self.has_table(table)))
    }
}

pub struct Workspace {
    pub root: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
        }
    }

    pub fn migrations_dir(&self) -> PathBuf {
        self.root.path().join("migrations")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.path().join("state")
    }

    /// Write `<migrations>/<category>/<name>/<file>` for each file
    pub fn add(&self, category: &str, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = self.migrations_dir().join(category).join(name);
        fs::create_dir_all(&dir).unwrap();
        for (file, body) in files {
            fs::write(dir.join(file), body).unwrap();
        }
        dir
    }

    pub fn lock(&self, stale_after: Duration) -> FileLock {
        FileLock::new(self.state_dir().join("locks"), stale_after)
    }

    pub fn store(&self) -> FileStatusStore {
        FileStatusStore::new(self.state_dir().join("history.jsonl"))
    }

    /// Migrator over this workspace with `db` as the target database
    pub fn migrator(&self, db: Rc<FakeDatabase>) -> Migrator {
        self.migrator_with(DatabaseHandle::with_executor(db), Duration::from_secs(3600))
    }

    pub fn migrator_with(&self, db: DatabaseHandle, stale_after: Duration) -> Migrator {
        Migrator::new(
            Registry::new(self.migrations_dir()),
            StatusTracker::new(Box::new(self.store())),
            Box::new(self.lock(stale_after)),
            Rc::new(db),
        )
    }
}
