//! Per-migration execution locks
//!
//! A lock keyed by `(category, name)` guarantees that at most one attempt of a
//! migration is in flight. Contention fails fast; nothing is queued. Locks
//! left behind by a crashed process are reclaimed once stale.

use crate::migration::{MigrationError, MigrationId};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

static LOCAL_HOST: Lazy<String> = Lazy::new(|| {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
});

/// Host name recorded in locks taken by this process
#[must_use]
pub fn local_host() -> &'static str {
    &LOCAL_HOST
}

/// Who holds a lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub attempt_id: Uuid,

    /// Host the holder runs on; its pid is only meaningful there
    #[serde(default)]
    pub host: String,

    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    #[must_use]
    pub fn new(attempt_id: Uuid) -> Self {
        Self {
            attempt_id,
            host: local_host().to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    /// Whether the holder runs on this host
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.host == local_host()
    }

    /// Age of the lock, zero if the clock went backwards
    #[must_use]
    pub fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or_default()
    }

    /// Human-readable holder description for contention errors
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "attempt {} by pid {} on {} since {}",
            self.attempt_id,
            self.pid,
            if self.host.is_empty() { "unknown host" } else { self.host.as_str() },
            self.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Check-and-set lock keyed by migration identity
pub trait ExecutionLock {
    /// Atomically take the lock for `id`
    ///
    /// Returns the holder that was evicted if a stale lock had to be reclaimed.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockContention` if a live attempt holds the lock.
    fn try_acquire(&self, id: &MigrationId, attempt_id: Uuid)
        -> Result<Option<LockInfo>, MigrationError>;

    /// Release the lock held by `attempt_id`
    ///
    /// # Errors
    ///
    /// Returns an error if the lock could not be removed.
    fn release(&self, id: &MigrationId, attempt_id: Uuid) -> Result<(), MigrationError>;

    /// Current live holder, ignoring stale locks
    ///
    /// # Errors
    ///
    /// Returns an error if the lock state cannot be read.
    fn holder(&self, id: &MigrationId) -> Result<Option<LockInfo>, MigrationError>;
}

/// Lock guard that releases the lock when dropped
///
/// This keeps release on every exit path, errors and panics included.
pub struct LockGuard<'a> {
    lock: &'a dyn ExecutionLock,
    id: MigrationId,
    attempt_id: Uuid,
    reclaimed: Option<LockInfo>,
    released: bool,
}

impl<'a> LockGuard<'a> {
    /// Acquire the lock for `id` on behalf of `attempt_id`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockContention` if the lock is held.
    pub fn acquire(
        lock: &'a dyn ExecutionLock,
        id: &MigrationId,
        attempt_id: Uuid,
    ) -> Result<Self, MigrationError> {
        let reclaimed = lock.try_acquire(id, attempt_id)?;
        log::debug!("Acquired execution lock for {} (attempt {})", id, attempt_id);

        Ok(Self {
            lock,
            id: id.clone(),
            attempt_id,
            reclaimed,
            released: false,
        })
    }

    /// Stale holder evicted while acquiring, if any
    #[must_use]
    pub fn reclaimed(&self) -> Option<&LockInfo> {
        self.reclaimed.as_ref()
    }

    /// Release explicitly, surfacing errors the drop path has to ignore
    ///
    /// # Errors
    ///
    /// Returns an error if the lock could not be removed.
    pub fn release(mut self) -> Result<(), MigrationError> {
        self.released = true;
        self.lock.release(&self.id, self.attempt_id)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock.release(&self.id, self.attempt_id) {
                log::warn!("Failed to release execution lock for {}: {}", self.id, e);
            }
        }
    }
}

/// Liveness of a local process, `None` where it cannot be determined
#[must_use]
pub fn process_alive(pid: u32) -> Option<bool> {
    if cfg!(target_os = "linux") {
        Some(Path::new("/proc").join(pid.to_string()).exists())
    } else {
        None
    }
}

/// Lock files under `<state_dir>/locks/<category>__<name>.lock`
///
/// Creation with `create_new` is the atomic check-and-set. A lock is stale
/// once older than `stale_after`, or when it was taken on this host and its
/// process is dead. Removing a stale lock happens under a `<lock>.reclaim`
/// sentinel so that only one attempt can replace it.
#[derive(Debug, Clone)]
pub struct FileLock {
    dir: PathBuf,
    stale_after: Duration,
}

impl FileLock {
    pub fn new(dir: impl AsRef<Path>, stale_after: Duration) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            stale_after,
        }
    }

    #[must_use]
    pub fn lock_path(&self, id: &MigrationId) -> PathBuf {
        self.dir.join(format!("{}__{}.lock", id.category, id.name))
    }

    fn is_stale(&self, info: &LockInfo) -> bool {
        info.age() >= self.stale_after
            || (info.is_local() && process_alive(info.pid) == Some(false))
    }

    fn read_info(path: &Path) -> Result<Option<LockInfo>, MigrationError> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MigrationError::Store(format!(
                "Failed to read lock file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Age of an unreadable lock file, from its modification time
    fn file_age(path: &Path) -> Option<Duration> {
        fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
    }
}

impl ExecutionLock for FileLock {
    fn try_acquire(
        &self,
        id: &MigrationId,
        attempt_id: Uuid,
    ) -> Result<Option<LockInfo>, MigrationError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            MigrationError::Store(format!(
                "Failed to create lock directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let path = self.lock_path(id);
        let mut reclaimed = None;

        // Later passes only happen after a stale lock was removed or vanished
        for _ in 0..3 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let info = LockInfo::new(attempt_id);
                    let body = serde_json::to_vec(&info).map_err(|e| {
                        MigrationError::Store(format!("Failed to encode lock: {}", e))
                    })?;
                    if let Err(e) = file.write_all(&body).and_then(|()| file.sync_data()) {
                        let _ = fs::remove_file(&path);
                        return Err(MigrationError::Store(format!(
                            "Failed to write lock file {}: {}",
                            path.display(),
                            e
                        )));
                    }
                    return Ok(reclaimed);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let current = Self::read_info(&path)?;
                    match &current {
                        Some(info) if !self.is_stale(info) => {
                            return Err(MigrationError::LockContention {
                                id: id.clone(),
                                holder: info.describe(),
                            })
                        }
                        // Vanished between create_new and read: just retry
                        None if !path.exists() => continue,
                        None if !Self::file_age(&path).is_some_and(|age| age >= self.stale_after) => {
                            return Err(MigrationError::LockContention {
                                id: id.clone(),
                                holder: format!("lock file {}", path.display()),
                            })
                        }
                        _ => {}
                    }

                    let Some(_reclaim) = ReclaimGuard::acquire(&path, self.stale_after)? else {
                        return Err(MigrationError::LockContention {
                            id: id.clone(),
                            holder: "another attempt reclaiming a stale lock".to_string(),
                        });
                    };

                    // Someone reclaimed it before we got the sentinel
                    if Self::read_info(&path)? != current || !path.exists() {
                        continue;
                    }

                    match &current {
                        Some(info) => log::warn!("Reclaiming stale lock for {} ({})", id, info.describe()),
                        None => log::warn!("Reclaiming unreadable stale lock for {}", id),
                    }
                    remove_if_present(&path)?;
                    reclaimed = current;
                }
                Err(e) => {
                    return Err(MigrationError::Store(format!(
                        "Failed to create lock file {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }

        Err(MigrationError::LockContention {
            id: id.clone(),
            holder: format!("lock file {}", path.display()),
        })
    }

    fn release(&self, id: &MigrationId, attempt_id: Uuid) -> Result<(), MigrationError> {
        let path = self.lock_path(id);
        match Self::read_info(&path)? {
            Some(info) if info.attempt_id != attempt_id => {
                // Our lock was reclaimed as stale and someone else holds it now
                log::warn!(
                    "Not releasing lock for {}: now held by {}",
                    id,
                    info.describe()
                );
                Ok(())
            }
            _ => remove_if_present(&path),
        }
    }

    fn holder(&self, id: &MigrationId) -> Result<Option<LockInfo>, MigrationError> {
        let path = self.lock_path(id);
        match Self::read_info(&path)? {
            Some(info) if !self.is_stale(&info) => Ok(Some(info)),
            Some(_) => Ok(None),
            None if path.exists() => {
                let stale = Self::file_age(&path).is_some_and(|age| age >= self.stale_after);
                Ok((!stale).then(|| LockInfo {
                    attempt_id: Uuid::nil(),
                    host: String::new(),
                    pid: 0,
                    acquired_at: Utc::now(),
                }))
            }
            None => Ok(None),
        }
    }
}

/// Exclusive right to remove a stale lock file
///
/// Held as a `create_new` sentinel next to the lock and removed on drop.
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    /// `None` when another attempt is already reclaiming
    fn acquire(lock_path: &Path, stale_after: Duration) -> Result<Option<Self>, MigrationError> {
        let mut name = lock_path.as_os_str().to_owned();
        name.push(".reclaim");
        let path = PathBuf::from(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Some(Self { path })),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Left behind by a reclaimer that died mid-way
                if FileLock::file_age(&path).is_some_and(|age| age >= stale_after) {
                    log::warn!("Removing abandoned reclaim sentinel {}", path.display());
                    remove_if_present(&path)?;
                }
                Ok(None)
            }
            Err(e) => Err(MigrationError::Store(format!(
                "Failed to create reclaim sentinel {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to remove reclaim sentinel {}: {}", self.path.display(), e);
        }
    }
}

fn remove_if_present(path: &Path) -> Result<(), MigrationError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MigrationError::Store(format!(
            "Failed to remove lock file {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Category;
    use tempfile::TempDir;

    fn id() -> MigrationId {
        MigrationId::new(Category::Backend, "create_users")
    }

    #[test]
    fn test_second_acquire_fails_fast() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path(), Duration::from_secs(3600));

        let first = LockGuard::acquire(&lock, &id(), Uuid::new_v4()).unwrap();
        assert!(first.reclaimed().is_none());

        let second = LockGuard::acquire(&lock, &id(), Uuid::new_v4());
        assert!(matches!(
            second,
            Err(MigrationError::LockContention { .. })
        ));

        // Different migration is independent
        let other = MigrationId::new(Category::Backend, "other");
        assert!(LockGuard::acquire(&lock, &other, Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_guard_drop_releases() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path(), Duration::from_secs(3600));

        {
            let _guard = LockGuard::acquire(&lock, &id(), Uuid::new_v4()).unwrap();
            assert!(lock.holder(&id()).unwrap().is_some());
            assert!(lock.lock_path(&id()).exists());
        }

        assert!(lock.holder(&id()).unwrap().is_none());
        assert!(!lock.lock_path(&id()).exists());
        assert!(LockGuard::acquire(&lock, &id(), Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_explicit_release() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path(), Duration::from_secs(3600));

        let guard = LockGuard::acquire(&lock, &id(), Uuid::new_v4()).unwrap();
        guard.release().unwrap();
        assert!(!lock.lock_path(&id()).exists());
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path(), Duration::from_secs(60));

        let stale = LockInfo {
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            ..LockInfo::new(Uuid::new_v4())
        };
        fs::write(lock.lock_path(&id()), serde_json::to_vec(&stale).unwrap()).unwrap();
        assert!(lock.holder(&id()).unwrap().is_none());

        let guard = LockGuard::acquire(&lock, &id(), Uuid::new_v4()).unwrap();
        assert_eq!(guard.reclaimed(), Some(&stale));
        assert!(lock.holder(&id()).unwrap().is_some());
    }

    #[test]
    fn test_release_does_not_remove_foreign_lock() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path(), Duration::from_secs(3600));

        let _guard = LockGuard::acquire(&lock, &id(), Uuid::new_v4()).unwrap();
        lock.release(&id(), Uuid::new_v4()).unwrap();
        assert!(lock.lock_path(&id()).exists());
    }

    #[test]
    fn test_concurrent_acquire_exactly_one_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().to_path_buf();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let lock = FileLock::new(&path, Duration::from_secs(3600));
                    // No guard: the winner keeps the lock until the test ends
                    lock.try_acquire(&id(), Uuid::new_v4()).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_concurrent_reclaim_of_stale_lock_exactly_one_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        let seed = FileLock::new(&path, Duration::from_secs(60));
        let stale = LockInfo {
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            ..LockInfo::new(Uuid::new_v4())
        };
        fs::write(seed.lock_path(&id()), serde_json::to_vec(&stale).unwrap()).unwrap();

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let barrier = std::sync::Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let lock = FileLock::new(&path, Duration::from_secs(60));
                    barrier.wait();
                    lock.try_acquire(&id(), Uuid::new_v4()).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);

        let holder = seed.holder(&id()).unwrap().unwrap();
        assert_ne!(holder.attempt_id, stale.attempt_id);
        let sentinel = dir.path().join("backend__create_users.lock.reclaim");
        assert!(!sentinel.exists());
    }

    #[test]
    fn test_foreign_host_lock_is_not_reclaimed_by_pid() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path(), Duration::from_secs(3600));

        // No such pid here, but it belongs to another host
        let foreign = LockInfo {
            host: format!("{}-elsewhere", local_host()),
            pid: u32::MAX,
            ..LockInfo::new(Uuid::new_v4())
        };
        fs::write(lock.lock_path(&id()), serde_json::to_vec(&foreign).unwrap()).unwrap();

        assert_eq!(lock.holder(&id()).unwrap(), Some(foreign.clone()));
        assert!(matches!(
            lock.try_acquire(&id(), Uuid::new_v4()),
            Err(MigrationError::LockContention { .. })
        ));
    }

    #[test]
    fn test_local_dead_pid_is_reclaimed() {
        if !cfg!(target_os = "linux") {
            return;
        }
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path(), Duration::from_secs(3600));

        let dead = LockInfo {
            pid: u32::MAX,
            ..LockInfo::new(Uuid::new_v4())
        };
        fs::write(lock.lock_path(&id()), serde_json::to_vec(&dead).unwrap()).unwrap();

        assert!(lock.holder(&id()).unwrap().is_none());
        let reclaimed = lock.try_acquire(&id(), Uuid::new_v4()).unwrap();
        assert_eq!(reclaimed, Some(dead));
    }

    #[test]
    fn test_lock_without_host_falls_back_to_age() {
        let raw = r#"{"attempt_id":"00000000-0000-0000-0000-000000000001","pid":4294967295,"acquired_at":"2099-01-01T00:00:00Z"}"#;
        let info: LockInfo = serde_json::from_str(raw).unwrap();
        assert!(info.host.is_empty());
        assert!(!info.is_local());

        let lock = FileLock::new("/unused", Duration::from_secs(3600));
        assert!(!lock.is_stale(&info));
    }
}
