//! Advisory file locks for readers, writers and checkers.
//!
//! Every lock scope (the dataset, or one segment) owns three lock files:
//!
//! ```text
//! <scope>          # main: shared by readers, appenders and checkers; exclusive for writes
//! <scope>.append   # exclusive: one appender at a time
//! <scope>.check    # exclusive: one checker at a time
//! ```
//!
//! | held \ wanted | read | append | write | check |
//! |---------------|------|--------|-------|-------|
//! | read          | yes  | yes    | no    | yes   |
//! | append        | yes  | no     | no    | yes   |
//! | write         | no   | no     | no    | no    |
//! | check         | yes  | yes    | no    | no    |
//!
//! A [`CheckLock`] can be temporarily upgraded to a write lock for repairs.
//! Updates of the dataset-wide index are serialized by a separate, always
//! blocking [`IndexLock`] on `<root>/lock.index`.
//! Locks are `flock`-style: two handles in the same process conflict just
//! like two processes do. Acquire the dataset scope before any segment scope.

use crate::config::LockMode;
use crate::dir::with_suffix;
use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

const DATASET_LOCK: &str = "lock";

/// The set of files a lock is taken on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockScope {
    main: PathBuf,
}

impl LockScope {
    /// The dataset-wide scope.
    #[must_use]
    pub fn dataset(root: &Path) -> Self {
        Self {
            main: root.join(DATASET_LOCK),
        }
    }

    /// The scope of one segment.
    #[must_use]
    pub fn segment(root: &Path, relpath: &str) -> Self {
        Self {
            main: root.join(format!("{relpath}.lock")),
        }
    }

    fn append_path(&self) -> PathBuf {
        with_suffix(&self.main, ".append")
    }

    fn check_path(&self) -> PathBuf {
        with_suffix(&self.main, ".check")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Shared,
    Exclusive,
}

/// An open lock file and the lock held on it.
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    fn acquire(path: PathBuf, kind: Kind, mode: LockMode) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let lock = Self { path, file };
        lock.set(kind, mode)?;
        Ok(lock)
    }

    fn set(&self, kind: Kind, mode: LockMode) -> CoreResult<()> {
        let result = match (kind, mode) {
            (Kind::Shared, LockMode::Blocking) => FileExt::lock_shared(&self.file),
            (Kind::Exclusive, LockMode::Blocking) => FileExt::lock_exclusive(&self.file),
            (Kind::Shared, LockMode::NonBlocking) => FileExt::try_lock_shared(&self.file),
            (Kind::Exclusive, LockMode::NonBlocking) => FileExt::try_lock_exclusive(&self.file),
        };
        result.map_err(|e| {
            if is_contended(&e) {
                CoreError::LockConflict {
                    path: self.path.clone(),
                }
            } else {
                CoreError::Io(e)
            }
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "cannot release lock");
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Issues lock handles in the configured blocking mode.
#[derive(Debug, Clone, Copy)]
pub struct LockCoordinator {
    mode: LockMode,
}

impl LockCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub const fn new(mode: LockMode) -> Self {
        Self { mode }
    }

    /// Returns the acquisition mode.
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    /// Takes a shared read lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockConflict`] in non-blocking mode if a write
    /// lock is held, or an I/O error.
    pub fn read(&self, scope: &LockScope) -> CoreResult<ReadLock> {
        Ok(ReadLock {
            _main: LockFile::acquire(scope.main.clone(), Kind::Shared, self.mode)?,
        })
    }

    /// Takes an append lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockConflict`] in non-blocking mode if another
    /// appender or a writer holds the scope, or an I/O error.
    pub fn append(&self, scope: &LockScope) -> CoreResult<AppendLock> {
        let main = LockFile::acquire(scope.main.clone(), Kind::Shared, self.mode)?;
        let append = LockFile::acquire(scope.append_path(), Kind::Exclusive, self.mode)?;
        Ok(AppendLock {
            _append: append,
            _main: main,
        })
    }

    /// Takes an exclusive write lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockConflict`] in non-blocking mode if any other
    /// lock is held on the scope, or an I/O error.
    pub fn write(&self, scope: &LockScope) -> CoreResult<WriteLock> {
        Ok(WriteLock {
            _main: LockFile::acquire(scope.main.clone(), Kind::Exclusive, self.mode)?,
        })
    }

    /// Takes a check lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockConflict`] in non-blocking mode if another
    /// checker or a writer holds the scope, or an I/O error.
    pub fn check(&self, scope: &LockScope) -> CoreResult<CheckLock> {
        let main = LockFile::acquire(scope.main.clone(), Kind::Shared, self.mode)?;
        let check = LockFile::acquire(scope.check_path(), Kind::Exclusive, self.mode)?;
        Ok(CheckLock {
            main,
            _check: check,
            mode: self.mode,
        })
    }
}

/// Serializes read-modify-write cycles on the dataset-wide index.
#[derive(Debug)]
pub struct IndexLock {
    _file: LockFile,
}

impl IndexLock {
    /// Takes the index lock of the dataset at `root`, waiting for it.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the lock file cannot be opened or locked.
    pub fn acquire(root: &Path) -> CoreResult<Self> {
        Ok(Self {
            _file: LockFile::acquire(
                root.join(format!("{DATASET_LOCK}.index")),
                Kind::Exclusive,
                LockMode::Blocking,
            )?,
        })
    }
}

/// Shared access for queries.
#[derive(Debug)]
pub struct ReadLock {
    _main: LockFile,
}

/// Serialized append access.
#[derive(Debug)]
pub struct AppendLock {
    _append: LockFile,
    _main: LockFile,
}

/// Exclusive access for structural changes.
#[derive(Debug)]
pub struct WriteLock {
    _main: LockFile,
}

/// Maintenance access, upgradable to a write lock.
#[derive(Debug)]
pub struct CheckLock {
    main: LockFile,
    _check: LockFile,
    mode: LockMode,
}

impl CheckLock {
    /// Upgrades to exclusive access until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockConflict`] in non-blocking mode if readers or
    /// appenders are active, or an I/O error.
    pub fn write_lock(&mut self) -> CoreResult<CheckWriteLock<'_>> {
        if let Err(e) = self.main.set(Kind::Exclusive, self.mode) {
            // A failed flock conversion may have dropped the shared lock.
            self.main.set(Kind::Shared, LockMode::Blocking)?;
            return Err(e);
        }
        Ok(CheckWriteLock { lock: self })
    }
}

/// A [`CheckLock`] temporarily upgraded to exclusive access.
#[derive(Debug)]
pub struct CheckWriteLock<'a> {
    lock: &'a mut CheckLock,
}

impl Drop for CheckWriteLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.main.set(Kind::Shared, LockMode::Blocking) {
            warn!(path = %self.lock.main.path.display(), error = %e, "cannot downgrade write lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn coordinator() -> LockCoordinator {
        LockCoordinator::new(LockMode::NonBlocking)
    }

    #[test]
    fn readers_and_one_appender_coexist() {
        let dir = tempdir().unwrap();
        let scope = LockScope::segment(dir.path(), "2007/07-08.vm2");
        let locks = coordinator();

        let _r1 = locks.read(&scope).unwrap();
        let _r2 = locks.read(&scope).unwrap();
        let _a = locks.append(&scope).unwrap();
        assert!(locks.append(&scope).unwrap_err().is_lock_conflict());
        assert!(dir.path().join("2007/07-08.vm2.lock").exists());
    }

    #[test]
    fn write_excludes_everything() {
        let dir = tempdir().unwrap();
        let scope = LockScope::dataset(dir.path());
        let locks = coordinator();

        let write = locks.write(&scope).unwrap();
        assert!(locks.read(&scope).unwrap_err().is_lock_conflict());
        assert!(locks.append(&scope).unwrap_err().is_lock_conflict());
        assert!(locks.check(&scope).unwrap_err().is_lock_conflict());
        drop(write);
        let _r = locks.read(&scope).unwrap();
    }

    #[test]
    fn check_excludes_write_but_not_read() {
        let dir = tempdir().unwrap();
        let scope = LockScope::dataset(dir.path());
        let locks = coordinator();

        let _check = locks.check(&scope).unwrap();
        let _read = locks.read(&scope).unwrap();
        let _append = locks.append(&scope).unwrap();
        assert!(locks.write(&scope).unwrap_err().is_lock_conflict());
        assert!(locks.check(&scope).unwrap_err().is_lock_conflict());
    }

    #[test]
    fn check_upgrade_waits_for_readers() {
        let dir = tempdir().unwrap();
        let scope = LockScope::segment(dir.path(), "2007/07.vm2");
        let locks = coordinator();

        let mut check = locks.check(&scope).unwrap();
        let read = locks.read(&scope).unwrap();
        assert!(check.write_lock().unwrap_err().is_lock_conflict());
        drop(read);

        {
            let _upgraded = check.write_lock().unwrap();
            assert!(locks.read(&scope).unwrap_err().is_lock_conflict());
        }
        let _read = locks.read(&scope).unwrap();
    }

    #[test]
    fn index_lock_is_independent_of_write_lock() {
        let dir = tempdir().unwrap();
        let scope = LockScope::dataset(dir.path());
        let mut check = coordinator().check(&scope).unwrap();
        let _upgraded = check.write_lock().unwrap();
        let _index = IndexLock::acquire(dir.path()).unwrap();
        assert!(dir.path().join("lock.index").exists());
    }

    #[test]
    fn locks_are_released_on_drop() {
        let dir = tempdir().unwrap();
        let scope = LockScope::dataset(dir.path());
        let locks = coordinator();

        drop(locks.append(&scope).unwrap());
        let _again = locks.append(&scope).unwrap();
    }
}
