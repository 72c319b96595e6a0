//! Fixed on-disk directory skeleton for a store (§3).

use std::fs;
use std::os::unix::fs::{chown, PermissionsExt};
use std::path::{Path, PathBuf};

use strata_shared::{StrataError, StrataResult};

pub const VOLUMES_DIR: &str = "volumes";
pub const IMAGES_DIR: &str = "images";
pub const META_DIR: &str = "meta";
pub const LOCKS_DIR: &str = "locks";
pub const TEMP_DIR: &str = "tmp";
pub const CACHE_DIR: &str = "cache";
pub const DEPENDENCIES_DIR: &str = "meta/dependencies";
pub const WHITEOUT_DEV_NAME: &str = "whiteout_dev";

/// Resolves the fixed subdirectories of a store rooted at `root`.
///
/// Construction does not touch the filesystem; call [`StoreLayout::create`]
/// to materialize the skeleton.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join(VOLUMES_DIR)
    }

    pub fn volume_path(&self, chain_id: &str) -> PathBuf {
        self.volumes_dir().join(chain_id)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    pub fn image_path(&self, image_id: &str) -> PathBuf {
        self.images_dir().join(image_id)
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    pub fn ref_counter_path(&self, chain_id: &str) -> PathBuf {
        self.meta_dir().join(format!("{}-ref-counter", chain_id))
    }

    pub fn dependencies_dir(&self) -> PathBuf {
        self.root.join(DEPENDENCIES_DIR)
    }

    pub fn dependencies_file(&self, image_id: &str) -> PathBuf {
        self.dependencies_dir().join(image_id)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    pub fn whiteout_dev_path(&self) -> PathBuf {
        self.root.join(WHITEOUT_DEV_NAME)
    }

    /// The subdirectories an `init-store` run must create, relative to the
    /// store root, in creation order.
    fn required_folders() -> [&'static str; 7] {
        [
            IMAGES_DIR,
            VOLUMES_DIR,
            CACHE_DIR,
            LOCKS_DIR,
            META_DIR,
            TEMP_DIR,
            DEPENDENCIES_DIR,
        ]
    }

    /// Creates the store root (mode 0700, owned by `owner_uid:owner_gid`)
    /// and every required subdirectory (mode 0755, same owner). Idempotent:
    /// an existing directory is accepted as long as it is in fact a
    /// directory.
    pub fn create(&self, owner_uid: u32, owner_gid: u32) -> StrataResult<()> {
        ensure_is_directory(&self.root)?;

        if !self.root.exists() {
            fs::create_dir(&self.root).map_err(|e| {
                StrataError::DriverFailure(format!(
                    "making directory `{}`: {}",
                    self.root.display(),
                    e
                ))
            })?;
            chown(&self.root, Some(owner_uid), Some(owner_gid)).map_err(|e| {
                StrataError::DriverFailure(format!(
                    "changing owner of `{}` to {}:{}: {}",
                    self.root.display(),
                    owner_uid,
                    owner_gid,
                    e
                ))
            })?;
            fs::set_permissions(&self.root, fs::Permissions::from_mode(0o700)).map_err(|e| {
                StrataError::DriverFailure(format!(
                    "changing permissions of `{}`: {}",
                    self.root.display(),
                    e
                ))
            })?;
        }

        for folder in Self::required_folders() {
            self.create_internal_directory(folder, owner_uid, owner_gid)?;
        }

        Ok(())
    }

    fn create_internal_directory(
        &self,
        relative: &str,
        owner_uid: u32,
        owner_gid: u32,
    ) -> StrataResult<()> {
        let path = self.root.join(relative);
        ensure_is_directory(&path)?;

        if !path.exists() {
            fs::create_dir_all(&path).map_err(|e| {
                StrataError::DriverFailure(format!("making directory `{}`: {}", path.display(), e))
            })?;
        }

        chown(&path, Some(owner_uid), Some(owner_gid)).map_err(|e| {
            StrataError::DriverFailure(format!(
                "changing owner of `{}` to {}:{}: {}",
                path.display(),
                owner_uid,
                owner_gid,
                e
            ))
        })?;

        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).map_err(|e| {
            StrataError::DriverFailure(format!("changing permissions of `{}`: {}", path.display(), e))
        })?;

        Ok(())
    }
}

fn ensure_is_directory(path: &Path) -> StrataResult<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => Err(StrataError::InvalidState(format!(
            "path `{}` is not a directory",
            path.display()
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_builds_the_full_skeleton() {
        let dir = tempfile::tempdir().unwrap();
        let store_root = dir.path().join("store");
        let layout = StoreLayout::new(&store_root);

        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        layout.create(uid, gid).unwrap();

        assert!(layout.volumes_dir().is_dir());
        assert!(layout.images_dir().is_dir());
        assert!(layout.meta_dir().is_dir());
        assert!(layout.dependencies_dir().is_dir());
        assert!(layout.locks_dir().is_dir());
        assert!(layout.temp_dir().is_dir());
        assert!(layout.cache_dir().is_dir());
    }

    #[test]
    fn create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store_root = dir.path().join("store");
        let layout = StoreLayout::new(&store_root);

        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        layout.create(uid, gid).unwrap();
        layout.create(uid, gid).unwrap();
    }

    #[test]
    fn create_rejects_a_file_at_the_store_root() {
        let dir = tempfile::tempdir().unwrap();
        let store_root = dir.path().join("not-a-dir");
        fs::write(&store_root, b"oops").unwrap();

        let layout = StoreLayout::new(&store_root);
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        assert!(layout.create(uid, gid).is_err());
    }

    #[test]
    fn volume_and_image_paths_are_rooted_under_the_store() {
        let layout = StoreLayout::new("/var/lib/strata");
        assert_eq!(
            layout.volume_path("abc123"),
            PathBuf::from("/var/lib/strata/volumes/abc123")
        );
        assert_eq!(
            layout.image_path("my-image"),
            PathBuf::from("/var/lib/strata/images/my-image")
        );
        assert_eq!(
            layout.ref_counter_path("abc123"),
            PathBuf::from("/var/lib/strata/meta/abc123-ref-counter")
        );
    }
}
