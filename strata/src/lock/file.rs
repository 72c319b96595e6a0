//! flock(2)-based implementation of [`Locksmith`], suitable for multiprocess
//! coordination across every invocation sharing a store directory.

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use strata_shared::{StrataError, StrataResult};

use super::Locksmith;

/// Lock files live under `<store>/locks/<key>.lock`. The directory is
/// created lazily the first time a key is locked.
pub struct FileLocksmith {
    lock_dir: PathBuf,
}

impl FileLocksmith {
    pub fn new<P: AsRef<Path>>(lock_dir: P) -> StrataResult<Self> {
        let lock_dir = lock_dir.as_ref().to_path_buf();
        fs::create_dir_all(&lock_dir).map_err(|e| {
            StrataError::DriverFailure(format!(
                "failed to create lock directory {}: {}",
                lock_dir.display(),
                e
            ))
        })?;
        Ok(Self { lock_dir })
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", key))
    }
}

impl Locksmith for FileLocksmith {
    fn lock(&self, key: &str) -> StrataResult<LockHandle> {
        let path = self.lock_path(key);

        // O_CREAT is idempotent: an existing lock file is reused, never
        // truncated, so a concurrent holder's fd stays valid.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| {
                StrataError::DriverFailure(format!(
                    "failed to open lock file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let fd = file.as_raw_fd();
        // Blocks until exclusive acquisition is possible across all
        // processes sharing the store, per the Locksmith contract.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if result != 0 {
            return Err(StrataError::DriverFailure(format!(
                "flock(LOCK_EX) on {} failed: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }

        Ok(LockHandle {
            key: key.to_string(),
            file,
        })
    }

    fn unlock(&self, handle: LockHandle) -> StrataResult<()> {
        let fd = handle.file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_UN) };
        if result != 0 {
            return Err(StrataError::DriverFailure(format!(
                "flock(LOCK_UN) on key `{}` failed: {}",
                handle.key,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

/// An acquired named lock. Held for the duration of the critical section;
/// dropping it without calling [`Locksmith::unlock`] releases the
/// underlying flock anyway when the file descriptor closes, but callers
/// should route every handle through `unlock` so failures are observable.
pub struct LockHandle {
    key: String,
    file: File,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_blocks_second_acquisition_until_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let locksmith = FileLocksmith::new(dir.path()).unwrap();

        let handle = locksmith.lock("global").unwrap();
        locksmith.unlock(handle).unwrap();

        // Reacquiring after unlock must succeed without blocking.
        let handle2 = locksmith.lock("global").unwrap();
        locksmith.unlock(handle2).unwrap();
    }

    #[test]
    fn distinct_keys_do_not_interfere() {
        let dir = tempfile::tempdir().unwrap();
        let locksmith = FileLocksmith::new(dir.path()).unwrap();

        let a = locksmith.lock("a").unwrap();
        let b = locksmith.lock("b").unwrap();
        locksmith.unlock(a).unwrap();
        locksmith.unlock(b).unwrap();
    }
}
