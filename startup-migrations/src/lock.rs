//! Host-local exclusive lock used to elect the single migration runner.
//!
//! The lock is an advisory `flock` on a file in the temp directory. `flock` locks
//! belong to the open file description, so two independent opens of the same path
//! contend with each other even inside one process.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::{debug, warn};

use crate::errors::{MigrateError, MigrateResult};

/// File name prefix of the lock; the parent process id is appended.
pub const LOCK_FILE_PREFIX: &str = "migrations.lock";

/// Strategy that decides which lock file a `migrate` call contends on.
pub trait LockNaming {
    fn lock_path(&self) -> PathBuf;
}

/// `<dir>/migrations.lock.<parent pid>`: processes forked from the same parent
/// (a worker pool) share one lock, unrelated invocations do not.
#[derive(Debug, Clone)]
pub struct ParentProcessLockName {
    dir: PathBuf,
}

impl ParentProcessLockName {
    pub fn new() -> Self {
        Self {
            dir: std::env::temp_dir(),
        }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path used for a given parent process id.
    pub fn path_for(&self, parent_pid: u32) -> PathBuf {
        self.dir.join(format!("{LOCK_FILE_PREFIX}.{parent_pid}"))
    }
}

impl Default for ParentProcessLockName {
    fn default() -> Self {
        Self::new()
    }
}

impl LockNaming for ParentProcessLockName {
    fn lock_path(&self) -> PathBuf {
        self.path_for(std::os::unix::process::parent_id())
    }
}

/// Always the same path. Used by tests and by operators who pin the lock explicitly.
#[derive(Debug, Clone)]
pub struct FixedLockName(pub PathBuf);

impl LockNaming for FixedLockName {
    fn lock_path(&self) -> PathBuf {
        self.0.clone()
    }
}

/// An opened (possibly newly created) lock file that is not necessarily held.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    /// Open the lock file, creating it if needed.
    pub fn open(path: impl Into<PathBuf>) -> MigrateResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| MigrateError::LockUnavailable {
                path: path.clone(),
                source,
            })?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Non-blocking exclusive acquisition.
    ///
    /// Returns `Ok(None)` when another holder has the lock. Any other I/O failure
    /// is a `LockUnavailable` error.
    pub fn try_acquire(&self) -> MigrateResult<Option<LockGuard<'_>>> {
        self.guard_for(self.file.try_lock_exclusive())
    }

    /// Map the result of a lock attempt on `self.file` to a guard.
    fn guard_for(&self, attempt: io::Result<()>) -> MigrateResult<Option<LockGuard<'_>>> {
        match attempt {
            Ok(()) => {
                debug!("acquired {}", self.path.display());
                Ok(Some(LockGuard {
                    lock: self,
                    released: false,
                }))
            }
            Err(err) if is_contended(&err) => Ok(None),
            Err(source) => Err(MigrateError::LockUnavailable {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Proof that the lock is held. Releases on `release()` or on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a LockFile,
    released: bool,
}

impl LockGuard<'_> {
    pub fn path(&self) -> &Path {
        &self.lock.path
    }

    /// Release the lock, reporting unlock failures to the caller.
    pub fn release(mut self) -> MigrateResult<()> {
        self.released = true;
        FileExt::unlock(&self.lock.file).map_err(|source| MigrateError::LockUnavailable {
            path: self.lock.path.clone(),
            source,
        })?;
        debug!("released {}", self.lock.path.display());
        Ok(())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = FileExt::unlock(&self.lock.file) {
            warn!("failed to release {}: {err}", self.lock.path.display());
        }
    }
}
