//! Status tracker: persists execution records and answers "is it applied?"

use crate::migration::status::{derive_state, DerivedState};
use crate::migration::{Category, ExecutionRecord, MigrationError, MigrationId};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Persistence for execution records
///
/// Implementations are append-only: `load` returns records in the order they
/// were appended.
pub trait StatusStore {
    /// Persist one record
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the record cannot be written.
    fn append(&self, record: &ExecutionRecord) -> Result<(), MigrationError>;

    /// Load every record, oldest first
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the store cannot be read.
    fn load(&self) -> Result<Vec<ExecutionRecord>, MigrationError>;
}

/// JSON Lines file store: one record per line
///
/// Each record is written with a single `write_all` on a file opened in
/// append mode and synced before returning. A line torn by a crash is
/// terminated before the next record goes in, and skipped on load.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    path: PathBuf,
}

impl FileStatusStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatusStore for FileStatusStore {
    fn append(&self, record: &ExecutionRecord) -> Result<(), MigrationError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                MigrationError::Store(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut line = serde_json::to_string(record)
            .map_err(|e| MigrationError::Store(format!("Failed to encode record: {}", e)))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                MigrationError::Store(format!(
                    "Failed to open status file {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        let terminated = ends_with_newline(&mut file).map_err(|e| {
            MigrationError::Store(format!(
                "Failed to read status file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        if !terminated {
            log::warn!(
                "{} ends in a torn record; starting a new line",
                self.path.display()
            );
            line.insert(0, '\n');
        }

        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_data())
            .map_err(|e| {
                MigrationError::Store(format!(
                    "Failed to append to status file {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        Ok(())
    }

    fn load(&self) -> Result<Vec<ExecutionRecord>, MigrationError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(MigrationError::Store(format!(
                    "Failed to read status file {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let lines: Vec<(usize, &str)> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .collect();
        let last_index = lines.last().map(|(i, _)| *i);

        let mut records = Vec::with_capacity(lines.len());
        for (index, line) in lines {
            match serde_json::from_str::<ExecutionRecord>(line) {
                Ok(record) => records.push(record),
                // Truncated by a crash mid-append
                Err(e) if e.is_eof() || (Some(index) == last_index && !content.ends_with('\n')) => {
                    log::warn!(
                        "Ignoring torn line {} of {}: {}",
                        index + 1,
                        self.path.display(),
                        e
                    );
                }
                Err(e) => {
                    return Err(MigrationError::Store(format!(
                        "Corrupt record at {}:{}: {}",
                        self.path.display(),
                        index + 1,
                        e
                    )))
                }
            }
        }

        Ok(records)
    }
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Tracks which migrations have been applied, when, and with what outcome
pub struct StatusTracker {
    store: Box<dyn StatusStore>,
}

impl StatusTracker {
    pub fn new(store: Box<dyn StatusStore>) -> Self {
        Self { store }
    }

    /// Append a record
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn record(&self, record: &ExecutionRecord) -> Result<(), MigrationError> {
        log::debug!(
            "Recording {:?}/{:?} for {}/{} (attempt {})",
            record.operation,
            record.outcome,
            record.category,
            record.name,
            record.attempt_id
        );
        self.store.append(record)
    }

    /// Records filtered by category and/or name, oldest first
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn history(
        &self,
        category: Option<Category>,
        name: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>, MigrationError> {
        Ok(self
            .store
            .load()?
            .into_iter()
            .filter(|r| category.map_or(true, |c| r.category == c))
            .filter(|r| name.map_or(true, |n| r.name == n))
            .collect())
    }

    /// All records, oldest first
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn all(&self) -> Result<Vec<ExecutionRecord>, MigrationError> {
        self.store.load()
    }

    /// Derived state of one migration, ignoring locks
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn state(&self, id: &MigrationId) -> Result<DerivedState, MigrationError> {
        let records = self.store.load()?;
        Ok(derive_state(records.iter().filter(|r| r.is_for(id)), false))
    }

    /// Whether a successful run of the migration is currently in effect
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn is_applied(&self, category: Category, name: &str) -> Result<bool, MigrationError> {
        Ok(self.state(&MigrationId::new(category, name))?.is_applied())
    }

    /// The `started` record of an attempt that never received a terminal record
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn dangling_attempt(
        &self,
        id: &MigrationId,
        attempt_id: uuid::Uuid,
    ) -> Result<Option<ExecutionRecord>, MigrationError> {
        let records = self.history(Some(id.category), Some(&id.name))?;
        let finished = records
            .iter()
            .any(|r| r.attempt_id == attempt_id && r.outcome.is_terminal());
        if finished {
            return Ok(None);
        }
        Ok(records.into_iter().find(|r| r.attempt_id == attempt_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{BackendKind, Migration, Operation, Outcome, Step};
    use tempfile::TempDir;

    fn migration(name: &str) -> Migration {
        Migration {
            id: MigrationId::new(Category::Backend, name),
            backend: BackendKind::Sql,
            dir: PathBuf::from("/m"),
            up: vec![Step::new("/m/up.sql")],
            down: vec![],
            verify: None,
            checksum: "c".to_string(),
        }
    }

    #[test]
    fn test_file_store_roundtrip_and_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("history.jsonl");

        let started = ExecutionRecord::started(&migration("a"), Operation::Run);
        let done = started.finish(Outcome::Success, Some("ok".into()), None);

        {
            let store = FileStatusStore::new(&path);
            store.append(&started).unwrap();
            store.append(&done).unwrap();
        }

        // A fresh store over the same file sees the same history
        let reopened = FileStatusStore::new(&path);
        let records = reopened.load().unwrap();
        assert_eq!(records, vec![started, done]);
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStatusStore::new(dir.path().join("nope.jsonl"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_ignores_torn_last_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = FileStatusStore::new(&path);
        let record = ExecutionRecord::started(&migration("a"), Operation::Run);
        store.append(&record).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"attempt_id\":\"trunc").unwrap();

        assert_eq!(store.load().unwrap(), vec![record]);
    }

    #[test]
    fn test_file_store_appends_after_torn_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = FileStatusStore::new(&path);
        let first = ExecutionRecord::started(&migration("a"), Operation::Run);
        store.append(&first).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"attempt_id\":\"tru").unwrap();

        let second = ExecutionRecord::started(&migration("b"), Operation::Run);
        store.append(&second).unwrap();
        let third = second.finish(Outcome::Success, None, None);
        store.append(&third).unwrap();

        assert_eq!(store.load().unwrap(), vec![first, second, third]);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 4);
    }

    #[test]
    fn test_file_store_rejects_corrupt_middle_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = FileStatusStore::new(&path);
        fs::write(&path, "garbage\n").unwrap();
        store
            .append(&ExecutionRecord::started(&migration("a"), Operation::Run))
            .unwrap();

        assert!(matches!(store.load(), Err(MigrationError::Store(_))));
    }

    #[test]
    fn test_tracker_history_filters() {
        let dir = TempDir::new().unwrap();
        let tracker = StatusTracker::new(Box::new(FileStatusStore::new(
            dir.path().join("history.jsonl"),
        )));

        let a = ExecutionRecord::started(&migration("a"), Operation::Run);
        let b = ExecutionRecord::started(&migration("b"), Operation::Run);
        tracker.record(&a).unwrap();
        tracker.record(&b).unwrap();
        tracker
            .record(&a.finish(Outcome::Success, None, None))
            .unwrap();

        assert_eq!(tracker.history(None, None).unwrap().len(), 3);
        assert_eq!(tracker.history(None, Some("a")).unwrap().len(), 2);
        assert_eq!(
            tracker.history(Some(Category::Prisma), None).unwrap().len(),
            0
        );

        assert!(tracker.is_applied(Category::Backend, "a").unwrap());
        assert!(!tracker.is_applied(Category::Backend, "b").unwrap());

        let b_id = MigrationId::new(Category::Backend, "b");
        assert_eq!(
            tracker.dangling_attempt(&b_id, b.attempt_id).unwrap(),
            Some(b.clone())
        );
        let a_id = MigrationId::new(Category::Backend, "a");
        assert_eq!(tracker.dangling_attempt(&a_id, a.attempt_id).unwrap(), None);
    }
}
