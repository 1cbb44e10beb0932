/// Exclusive advisory lock on a single file path.
///
/// A `LockGuard` owns an open handle to the lock file. Acquisition is a
/// non-blocking try-lock: a second holder fails immediately instead of
/// queueing. A held lock is released when the guard is dropped.
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Errors produced while opening, locking or releasing a lock file.
#[derive(Debug)]
pub enum LockError {
    /// The lock file (or one of its parent directories) could not be created or opened.
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another holder owns the exclusive lock.
    AlreadyLocked { path: PathBuf },
    /// The OS locking primitive failed for a reason other than contention.
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Releasing a held lock failed.
    Unlock {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Open { path, source } => {
                write!(f, "failed to open lock file {}: {}", path.display(), source)
            }
            LockError::AlreadyLocked { path } => {
                write!(
                    f,
                    "lock file {} is already locked (another instance is running)",
                    path.display()
                )
            }
            LockError::Lock { path, source } => {
                write!(f, "failed to lock {}: {}", path.display(), source)
            }
            LockError::Unlock { path, source } => {
                write!(f, "failed to unlock {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Open { source, .. } => Some(source),
            LockError::AlreadyLocked { .. } => None,
            LockError::Lock { source, .. } => Some(source),
            LockError::Unlock { source, .. } => Some(source),
        }
    }
}

/// Result of probing a lock path without keeping the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held,
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockState::Free => write!(f, "free"),
            LockState::Held => write!(f, "held"),
        }
    }
}

#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    file: File,
    held: bool,
}

impl LockGuard {
    /// Open (creating if absent) the lock file at `path`.
    ///
    /// Missing parent directories are created. The returned guard is unlocked.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let open_err = |source| LockError::Open {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(open_err)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(open_err)?;

        tracing::debug!(path = %path.display(), "opened lock file");
        Ok(Self {
            path,
            file,
            held: false,
        })
    }

    /// Open `path` and take the exclusive lock in one step.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let mut guard = Self::open(path)?;
        guard.lock()?;
        Ok(guard)
    }

    /// Check whether some other holder currently owns the lock at `path`.
    ///
    /// If the lock is free it is taken and released again immediately.
    pub fn probe(path: impl Into<PathBuf>) -> Result<LockState, LockError> {
        let mut guard = Self::open(path)?;
        match guard.lock() {
            Ok(()) => {
                guard.unlock()?;
                Ok(LockState::Free)
            }
            Err(LockError::AlreadyLocked { .. }) => Ok(LockState::Held),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(&self) -> bool {
        self.held
    }

    /// Try to take the exclusive lock without blocking.
    ///
    /// Returns `LockError::AlreadyLocked` if another handle holds it.
    /// Locking a guard that already holds the lock is a no-op.
    pub fn lock(&mut self) -> Result<(), LockError> {
        if self.held {
            return Ok(());
        }

        match self.file.try_lock_exclusive() {
            Ok(()) => {
                self.held = true;
                tracing::debug!(path = %self.path.display(), "acquired exclusive lock");
                Ok(())
            }
            Err(e) if is_contended(&e) => Err(LockError::AlreadyLocked {
                path: self.path.clone(),
            }),
            Err(source) => Err(LockError::Lock {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Release the lock if held. Safe to call on an unlocked guard.
    pub fn unlock(&mut self) -> Result<(), LockError> {
        if !self.held {
            return Ok(());
        }

        // Not retried on failure; closing the handle drops the lock.
        self.held = false;
        FileExt::unlock(&self.file).map_err(|source| LockError::Unlock {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), "released lock");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("watcher.lock")
    }

    #[test]
    fn test_open_creates_file_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        let guard = LockGuard::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(guard.path(), path.as_path());
        assert!(!guard.is_locked());
    }

    #[test]
    fn test_open_creates_missing_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("nested").join("watcher.lock");
        LockGuard::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_open_fails_when_parent_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let err = LockGuard::open(blocker.join("sub").join("watcher.lock")).unwrap_err();
        assert!(matches!(err, LockError::Open { .. }), "got {err:?}");
        assert!(err.to_string().contains("failed to open lock file"));
    }

    #[test]
    fn test_open_leaves_existing_contents_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        std::fs::write(&path, "leftover").unwrap();
        LockGuard::acquire(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "leftover");
    }

    #[test]
    fn test_lock_free_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = LockGuard::open(lock_path(&dir)).unwrap();
        guard.lock().unwrap();
        assert!(guard.is_locked());
    }

    #[test]
    fn test_lock_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = LockGuard::acquire(lock_path(&dir)).unwrap();
        guard.lock().unwrap();
        assert!(guard.is_locked());
    }

    #[test]
    fn test_second_holder_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        let first = LockGuard::acquire(&path).unwrap();

        let mut second = LockGuard::open(&path).unwrap();
        let err = second.lock().unwrap_err();
        assert!(matches!(err, LockError::AlreadyLocked { .. }), "got {err:?}");
        assert!(!second.is_locked());
        assert!(first.is_locked());
    }

    #[test]
    fn test_unlock_never_locked() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = LockGuard::open(lock_path(&dir)).unwrap();
        guard.unlock().unwrap();
        assert!(!guard.is_locked());
    }

    #[test]
    fn test_unlock_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = LockGuard::acquire(lock_path(&dir)).unwrap();
        guard.unlock().unwrap();
        guard.unlock().unwrap();
        assert!(!guard.is_locked());
    }

    #[test]
    fn test_relock_same_guard() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = LockGuard::acquire(lock_path(&dir)).unwrap();
        guard.unlock().unwrap();
        guard.lock().unwrap();
        assert!(guard.is_locked());
    }

    #[test]
    fn test_other_holder_locks_after_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        let mut first = LockGuard::acquire(&path).unwrap();
        let mut second = LockGuard::open(&path).unwrap();
        assert!(second.lock().is_err());

        first.unlock().unwrap();
        second.lock().unwrap();
        assert!(second.is_locked());
    }

    #[test]
    fn test_drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        {
            let _held = LockGuard::acquire(&path).unwrap();
            assert_eq!(LockGuard::probe(&path).unwrap(), LockState::Held);
        }
        LockGuard::acquire(&path).unwrap();
    }

    #[test]
    fn test_probe_free_does_not_keep_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        assert_eq!(LockGuard::probe(&path).unwrap(), LockState::Free);
        let guard = LockGuard::acquire(&path).unwrap();
        assert!(guard.is_locked());
    }

    #[test]
    fn test_lock_state_display() {
        assert_eq!(LockState::Free.to_string(), "free");
        assert_eq!(LockState::Held.to_string(), "held");
    }
}
