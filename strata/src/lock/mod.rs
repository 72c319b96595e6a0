//! Named exclusive locks across processes sharing a store directory.
//!
//! The core only ever locks one well-known key (`GLOBAL_LOCK_KEY`), but the
//! trait is keyed by name so a store could grow per-volume locks later
//! without a new abstraction.

mod file;

pub use file::{FileLocksmith, LockHandle};

use strata_shared::StrataResult;

/// The single well-known lock key used by the core: store init, garbage
/// collection marking, and (by default) every image pull serialize on it.
pub const GLOBAL_LOCK_KEY: &str = "global";

/// Named, cross-process exclusive file locks.
pub trait Locksmith: Send + Sync {
    /// Block until the named lock is exclusively held by this handle.
    fn lock(&self, key: &str) -> StrataResult<LockHandle>;

    /// Release a previously acquired handle. Releasing a handle for a key
    /// that was never locked by this locksmith is an error; otherwise
    /// idempotent with respect to the underlying file.
    fn unlock(&self, handle: LockHandle) -> StrataResult<()>;
}

/// RAII guard around a lock handle, released on drop.
pub struct LockGuard<'a> {
    locksmith: &'a dyn Locksmith,
    handle: Option<LockHandle>,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(locksmith: &'a dyn Locksmith, key: &str) -> StrataResult<Self> {
        let handle = locksmith.lock(key)?;
        Ok(Self {
            locksmith,
            handle: Some(handle),
        })
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.locksmith.unlock(handle) {
                tracing::error!(error = %err, "failed to release lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn exercise(locksmith: Arc<dyn Locksmith>) {
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut handles = vec![];

        for _ in 0..4 {
            let ls = locksmith.clone();
            let ctr = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let _guard = LockGuard::acquire(ls.as_ref(), GLOBAL_LOCK_KEY).unwrap();
                    let val = ctr.load(std::sync::atomic::Ordering::SeqCst);
                    thread::yield_now();
                    ctr.store(val + 1, std::sync::atomic::Ordering::SeqCst);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 200);
    }

    #[test]
    fn file_locksmith_serializes_threads() {
        let dir = tempfile::tempdir().unwrap();
        let locksmith: Arc<dyn Locksmith> = Arc::new(FileLocksmith::new(dir.path()).unwrap());
        exercise(locksmith);
    }
}
