//! Store lifecycle: init, (re-)configure, and tear down the store directory
//! itself, as opposed to the images and volumes living inside it (§4.10).

use std::fs;
use std::path::Path;

use strata_shared::{StrataError, StrataResult};

use crate::driver::FilesystemDriver;
use crate::lock::{LockGuard, Locksmith, GLOBAL_LOCK_KEY};
use crate::store::StoreLayout;

pub struct Manager<'a> {
    layout: StoreLayout,
    driver: &'a dyn FilesystemDriver,
    locksmith: &'a dyn Locksmith,
}

impl<'a> Manager<'a> {
    pub fn new(layout: StoreLayout, driver: &'a dyn FilesystemDriver, locksmith: &'a dyn Locksmith) -> Self {
        Self {
            layout,
            driver,
            locksmith,
        }
    }

    /// Requires euid==0; validates the hosting filesystem, then creates the
    /// §3 skeleton. Idempotent when the skeleton already exists.
    pub fn init_store(&self, owner_uid: u32, owner_gid: u32) -> StrataResult<()> {
        if !nix::unistd::getuid().is_root() {
            return Err(StrataError::Permission(
                "init-store requires root privileges".to_string(),
            ));
        }

        let parent = self.layout.root().parent().unwrap_or_else(|| Path::new("/"));
        self.driver.validate_filesystem(parent)?;

        self.layout.create(owner_uid, owner_gid)
    }

    /// Sets `$TMPDIR`, creates any missing skeleton directories, and runs
    /// the driver's own store configuration and filesystem validation.
    pub fn configure_store(&self, owner_uid: u32, owner_gid: u32) -> StrataResult<()> {
        std::env::set_var("TMPDIR", self.layout.temp_dir());

        self.layout.create(owner_uid, owner_gid)?;

        self.driver.validate_filesystem(self.layout.root())?;
        self.driver.configure_store(self.layout.root(), owner_uid, owner_gid)
    }

    /// Acquires the global lock, destroys every image then every volume via
    /// the driver, and removes the store path.
    pub fn delete_store(&self) -> StrataResult<()> {
        let _guard = LockGuard::acquire(self.locksmith, GLOBAL_LOCK_KEY)?;

        for image_id in self.list_dir(&self.layout.images_dir())? {
            let image_path = self.layout.image_path(&image_id);
            self.driver.destroy_image(&image_path).map_err(|e| {
                StrataError::DriverFailure(format!("destroying image {}: {}", image_id, e))
            })?;
        }

        for chain_id in self.driver.volumes()? {
            self.driver.destroy_volume(&chain_id).map_err(|e| {
                StrataError::DriverFailure(format!("destroying volume {}: {}", chain_id, e))
            })?;
        }

        fs::remove_dir_all(self.layout.root()).map_err(|e| {
            StrataError::DriverFailure(format!(
                "deleting store path {}: {}",
                self.layout.root().display(),
                e
            ))
        })
    }

    fn list_dir(&self, dir: &Path) -> StrataResult<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| StrataError::DriverFailure(format!("listing {}: {}", dir.display(), e)))? {
            let entry = entry.map_err(|e| StrataError::DriverFailure(format!("listing {}: {}", dir.display(), e)))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::OverlayXfsDriver;
    use crate::lock::FileLocksmith;

    #[test]
    fn configure_store_creates_the_skeleton_and_sets_tmpdir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let driver = OverlayXfsDriver::new(layout.clone());
        let locksmith = FileLocksmith::new(layout.locks_dir()).unwrap();
        let manager = Manager::new(layout.clone(), &driver, &locksmith);

        manager.configure_store(0, 0).unwrap();

        assert!(layout.volumes_dir().is_dir());
        assert!(layout.images_dir().is_dir());
        assert_eq!(std::env::var("TMPDIR").unwrap(), layout.temp_dir().to_string_lossy());
    }

    #[test]
    fn delete_store_removes_the_store_path() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let driver = OverlayXfsDriver::new(layout.clone());
        let locksmith = FileLocksmith::new(layout.locks_dir()).unwrap();
        let manager = Manager::new(layout.clone(), &driver, &locksmith);

        manager.configure_store(0, 0).unwrap();
        manager.delete_store().unwrap();

        assert!(!layout.root().exists());
    }
}
