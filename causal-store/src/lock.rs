//! The store lock.
//!
//! An advisory file lock held for as long as a process uses a
//! cluster-state directory. Administrative commands (unbind) verify the
//! lock is free before touching anything.

use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;

use crate::StoreError;

/// A held store lock; released on drop.
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
}

impl StoreLock {
    /// Take the lock, failing fast when another process holds it.
    pub fn acquire(path: &Path) -> Result<StoreLock, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        match file.try_lock() {
            Ok(()) => Ok(StoreLock { _file: file }),
            Err(std::fs::TryLockError::WouldBlock) => Err(StoreError::LockContended),
            Err(std::fs::TryLockError::Error(err)) => Err(StoreError::Io(err)),
        }
    }

    /// Check whether the lock is currently free, without keeping it.
    pub fn is_free(path: &Path) -> Result<bool, StoreError> {
        if !path.exists() {
            return Ok(true);
        }
        let file = OpenOptions::new().write(true).open(path)?;
        match file.try_lock() {
            Ok(()) => {
                let _ = file.unlock();
                Ok(true)
            }
            Err(std::fs::TryLockError::WouldBlock) => Ok(false),
            Err(std::fs::TryLockError::Error(err)) => Err(StoreError::Io(err)),
        }
    }
}
