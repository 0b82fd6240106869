use std::fs::{self, File, TryLockError};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::HostWatchError;

/// Exclusive per-pipeline run lock.
///
/// The advisory lock is held for as long as the value is alive and is
/// released by the OS when the file handle is dropped, on every exit path.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    _file: File,
}

impl RunLock {
    pub fn acquire(lock_dir: &Path, pipeline: &str) -> Result<Self, HostWatchError> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{}.lock", pipeline));

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock() {
            Ok(()) => {
                debug!("Acquired run lock {}", path.display());
                Ok(RunLock { path, _file: file })
            }
            Err(TryLockError::WouldBlock) => Err(HostWatchError::AlreadyRunning(pipeline.to_owned())),
            Err(TryLockError::Error(e)) => Err(e.into()),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        debug!("Releasing run lock {}", self.path.display());
    }
}
