//! btrfs backend: each volume is a subvolume, writable images are a
//! snapshot of their top volume, and quota usage is tracked via qgroups.
//!
//! Shells out to the `btrfs` CLI rather than binding libbtrfsutil, matching
//! how the rest of the core defers to external tools it doesn't want to
//! reimplement.

use std::fs;
use std::os::unix::fs::chown;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use strata_shared::{StrataError, StrataResult};

use crate::store::StoreLayout;

use super::{FilesystemDriver, ImageDriverSpec, MountInfo, VolumeStats};

pub struct BtrfsDriver {
    layout: StoreLayout,
}

impl BtrfsDriver {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn run(&self, args: &[&str]) -> StrataResult<Output> {
        let output = Command::new("btrfs").args(args).output().map_err(|e| {
            StrataError::DriverFailure(format!("running `btrfs {}`: {}", args.join(" "), e))
        })?;

        if !output.status.success() {
            return Err(StrataError::DriverFailure(format!(
                "btrfs {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output)
    }
}

impl FilesystemDriver for BtrfsDriver {
    fn volume_path(&self, chain_id: &str) -> StrataResult<PathBuf> {
        let path = self.layout.volume_path(chain_id);
        if !path.exists() {
            return Err(StrataError::NotFound(format!("volume not found: {}", chain_id)));
        }
        Ok(path)
    }

    fn final_volume_path(&self, chain_id: &str) -> PathBuf {
        self.layout.volume_path(chain_id)
    }

    fn create_volume(&self, parent_id: &str, temp_id: &str) -> StrataResult<PathBuf> {
        let path = self.layout.volumes_dir().join(temp_id);

        if parent_id.is_empty() {
            self.run(&["subvolume", "create", &path.to_string_lossy()])?;
        } else {
            let parent_path = self.volume_path(parent_id)?;
            self.run(&[
                "subvolume",
                "snapshot",
                &parent_path.to_string_lossy(),
                &path.to_string_lossy(),
            ])?;
        }

        if let Err(e) = self.run(&["qgroup", "create", &format!("1/{}", temp_id), &path.to_string_lossy()]) {
            tracing::debug!(error = %e, volume = %temp_id, "qgroup create failed, continuing without quota tracking");
        }

        Ok(path)
    }

    fn destroy_volume(&self, chain_id: &str) -> StrataResult<()> {
        let path = self.layout.volume_path(chain_id);
        if !path.exists() {
            return Ok(());
        }

        let _ = self.run(&["qgroup", "destroy", &format!("1/{}", chain_id), &self.layout.volumes_dir().to_string_lossy()]);
        self.run(&["subvolume", "delete", &path.to_string_lossy()])?;
        Ok(())
    }

    fn destroy_volume_at(&self, path: &Path) -> StrataResult<()> {
        if !path.exists() {
            return Ok(());
        }
        self.run(&["subvolume", "delete", &path.to_string_lossy()])?;
        Ok(())
    }

    fn move_volume(&self, from_path: &Path, to_path: &Path) -> StrataResult<()> {
        match fs::rename(from_path, to_path) {
            Ok(()) => Ok(()),
            Err(e) if to_path.exists() => {
                self.run(&["subvolume", "delete", &from_path.to_string_lossy()]).ok();
                tracing::debug!(
                    from = %from_path.display(),
                    to = %to_path.display(),
                    error = %e,
                    "discarding temp subvolume, a concurrent build already finalized this ChainId"
                );
                Ok(())
            }
            Err(e) => Err(StrataError::DriverFailure(format!(
                "moving volume {} -> {}: {}",
                from_path.display(),
                to_path.display(),
                e
            ))),
        }
    }

    fn apply_opaque_whiteout(&self, _dir: &Path) -> StrataResult<()> {
        Ok(())
    }

    fn volumes(&self) -> StrataResult<Vec<String>> {
        let dir = self.layout.volumes_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)
            .map_err(|e| StrataError::DriverFailure(format!("listing volumes: {}", e)))?
        {
            let entry = entry.map_err(|e| StrataError::DriverFailure(format!("listing volumes: {}", e)))?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(ids)
    }

    fn create_image(&self, spec: &ImageDriverSpec) -> StrataResult<Option<MountInfo>> {
        let rootfs_dir = spec.image_path.join("rootfs");

        let top_id = spec
            .base_volume_ids
            .last()
            .ok_or_else(|| StrataError::InvalidArgument("image spec has no base volumes".to_string()))?;
        let top_path = self.volume_path(top_id)?;

        self.run(&[
            "subvolume",
            "snapshot",
            &top_path.to_string_lossy(),
            &rootfs_dir.to_string_lossy(),
        ])?;

        if spec.owner_uid != 0 || spec.owner_gid != 0 {
            chown(&rootfs_dir, Some(spec.owner_uid), Some(spec.owner_gid)).map_err(|e| {
                StrataError::DriverFailure(format!("chown rootfs {}: {}", rootfs_dir.display(), e))
            })?;
        }

        // Already a live, mountable subvolume; nothing deferred to the caller.
        let _ = spec.mount;
        Ok(None)
    }

    fn destroy_image(&self, image_path: &Path) -> StrataResult<()> {
        let rootfs_dir = image_path.join("rootfs");
        if rootfs_dir.exists() {
            self.run(&["subvolume", "delete", &rootfs_dir.to_string_lossy()])?;
        }
        Ok(())
    }

    fn fetch_stats(&self, path: &Path) -> StrataResult<VolumeStats> {
        let total = crate::store::measurer::directory_usage(path)?;
        Ok(VolumeStats {
            total_bytes: total,
            exclusive_bytes: total,
        })
    }

    fn configure_store(&self, _store_path: &Path, _owner_uid: u32, _owner_gid: u32) -> StrataResult<()> {
        Ok(())
    }

    fn validate_filesystem(&self, path: &Path) -> StrataResult<()> {
        let stat = nix::sys::statfs::statfs(path).map_err(|e| {
            StrataError::DriverFailure(format!("statfs on {}: {}", path.display(), e))
        })?;

        const BTRFS_SUPER_MAGIC: i64 = 0x9123683e;
        if i64::from(stat.filesystem_type().0) != BTRFS_SUPER_MAGIC {
            return Err(StrataError::Config(format!(
                "{} is not a btrfs filesystem",
                path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volumes_lists_only_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        fs::create_dir_all(layout.volumes_dir()).unwrap();
        let driver = BtrfsDriver::new(layout.clone());

        fs::create_dir_all(layout.volume_path("x")).unwrap();
        assert_eq!(driver.volumes().unwrap(), vec!["x".to_string()]);
    }

    #[test]
    fn destroy_volume_on_missing_path_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        fs::create_dir_all(layout.volumes_dir()).unwrap();
        let driver = BtrfsDriver::new(layout);
        driver.destroy_volume("never-existed").unwrap();
    }
}
