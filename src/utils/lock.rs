//! Cross-process advisory lock held for the full `init`/`fini` window
//! (spec §4.2/§5). One well-known path per OS; on Linux this lives under
//! `/var/run` (root) or `/tmp` (the PQoS front-ends default to the latter
//! under test, so callers may override it via `RdtLock::at`).

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use crate::error::{RdtError, Result};
use crate::ffi::syscall::{flock_try_exclusive, flock_unlock};

#[cfg(target_os = "linux")]
pub fn default_lock_path() -> PathBuf {
    PathBuf::from("/var/lock/rdtctl.lock")
}

#[cfg(not(target_os = "linux"))]
pub fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join("rdtctl.lock")
}

pub struct RdtLock {
    file: std::fs::File,
}

impl RdtLock {
    /// Acquires the lock at `path`, retrying up to `retries` times with a
    /// `retry_interval` sleep in between. Returns `RdtError::Busy` once the
    /// retry budget is exhausted.
    pub fn acquire(path: &Path, retries: u32, retry_interval: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(RdtError::Internal)?;

        let mut attempt = 0;
        loop {
            match flock_try_exclusive(&file) {
                Ok(()) => return Ok(RdtLock { file }),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if attempt >= retries {
                        return Err(RdtError::Busy);
                    }
                    attempt += 1;
                    sleep(retry_interval);
                }
                Err(e) => return Err(RdtError::Internal(e)),
            }
        }
    }
}

impl Drop for RdtLock {
    fn drop(&mut self) {
        let _ = flock_unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let _first = RdtLock::acquire(&path, 0, Duration::from_millis(1)).unwrap();
        let second = RdtLock::acquire(&path, 2, Duration::from_millis(1));
        assert!(matches!(second, Err(RdtError::Busy)));
    }

    #[test]
    fn released_on_drop_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        {
            let _first = RdtLock::acquire(&path, 0, Duration::from_millis(1)).unwrap();
        }
        let second = RdtLock::acquire(&path, 0, Duration::from_millis(1));
        assert!(second.is_ok());
    }
}
