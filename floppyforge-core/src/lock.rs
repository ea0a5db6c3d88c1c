//! Exclusive per-device leases.
//!
//! At most one job may hold a given device. [`DeviceLocks::try_acquire`]
//! never waits: a device that is already leased is refused immediately with
//! [`TransferError::DeviceBusy`]. The lease is released when the returned
//! [`DeviceLease`] is dropped, however the job ended.
//!
//! Jobs lease from [`DeviceLocks::global`], which is shared by every
//! [`Session`](crate::Session) and [`TransferEngine`](crate::TransferEngine)
//! in the process.
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use tracing::debug;

use crate::error::TransferError;

static GLOBAL: LazyLock<DeviceLocks> = LazyLock::new(DeviceLocks::new);

#[derive(Clone, Default)]
pub struct DeviceLocks {
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl DeviceLocks {
    /// A private registry, independent of the process-wide one.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static DeviceLocks {
        &GLOBAL
    }

    pub fn try_acquire(&self, path: &Path) -> Result<DeviceLease, TransferError> {
        let key = lock_key(path);
        if !self.held().insert(key.clone()) {
            return Err(TransferError::DeviceBusy {
                path: path.to_path_buf(),
            });
        }
        debug!(device = %key.display(), "device lease acquired");
        Ok(DeviceLease {
            key,
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, path: &Path) -> bool {
        self.held().contains(&lock_key(path))
    }

    fn held(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Symlinks such as `/dev/floppy/0` resolve to the same key as `/dev/fd0`.
fn lock_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[must_use = "the device is released as soon as the lease is dropped"]
#[derive(Debug)]
pub struct DeviceLease {
    key: PathBuf,
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl DeviceLease {
    pub fn device(&self) -> &Path {
        &self.key
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.key);
        debug!(device = %self.key.display(), "device lease released");
    }
}
