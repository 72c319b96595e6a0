//! overlay-xfs backend: plain directories as volumes, a kernel overlay mount
//! to compose a writable rootfs, whiteouts via a shared 0:0 char device.

use std::fs;
use std::os::unix::fs::{chown, FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use strata_shared::{StrataError, StrataResult};

use crate::store::StoreLayout;

use super::{FilesystemDriver, ImageDriverSpec, MountInfo, VolumeStats};

pub struct OverlayXfsDriver {
    layout: StoreLayout,
}

impl OverlayXfsDriver {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn lower_dirs(&self, base_volume_ids: &[String]) -> StrataResult<Vec<PathBuf>> {
        base_volume_ids
            .iter()
            .map(|id| self.volume_path(id))
            .collect()
    }
}

impl FilesystemDriver for OverlayXfsDriver {
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

    fn create_volume(&self, _parent_id: &str, temp_id: &str) -> StrataResult<PathBuf> {
        let path = self.layout.volumes_dir().join(temp_id);
        fs::create_dir_all(&path).map_err(|e| {
            StrataError::DriverFailure(format!("creating volume dir {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    fn destroy_volume(&self, chain_id: &str) -> StrataResult<()> {
        let path = self.layout.volume_path(chain_id);
        if !path.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&path).map_err(|e| {
            StrataError::DriverFailure(format!("destroying volume {}: {}", path.display(), e))
        })
    }

    fn destroy_volume_at(&self, path: &Path) -> StrataResult<()> {
        if !path.exists() {
            return Ok(());
        }
        fs::remove_dir_all(path).map_err(|e| {
            StrataError::DriverFailure(format!("destroying volume {}: {}", path.display(), e))
        })
    }

    fn move_volume(&self, from_path: &Path, to_path: &Path) -> StrataResult<()> {
        match fs::rename(from_path, to_path) {
            Ok(()) => Ok(()),
            Err(e) if to_path.exists() => {
                // Lost the race to another builder of the same ChainId: the
                // winner's rename already landed, ours is a stale temp dir.
                let _ = fs::remove_dir_all(from_path);
                tracing::debug!(
                    from = %from_path.display(),
                    to = %to_path.display(),
                    error = %e,
                    "discarding temp volume, a concurrent build already finalized this ChainId"
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

    fn apply_opaque_whiteout(&self, dir: &Path) -> StrataResult<()> {
        apply_opaque_whiteout(dir)
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
        let lower_dirs = self.lower_dirs(&spec.base_volume_ids)?;

        let rootfs_dir = spec.image_path.join("rootfs");
        let upper_dir = spec.image_path.join("diff");
        let work_dir = spec.image_path.join("work");

        for dir in [&rootfs_dir, &upper_dir, &work_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                StrataError::DriverFailure(format!("creating {}: {}", dir.display(), e))
            })?;
        }

        // The kernel wants lowerdir listed top-to-bottom; base_volume_ids is
        // parent-to-child, so reverse it.
        let lower_opt = lower_dirs
            .iter()
            .rev()
            .map(|p| p.to_string_lossy())
            .collect::<Vec<_>>()
            .join(":");

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower_opt,
            upper_dir.display(),
            work_dir.display()
        );

        if spec.mount {
            mount(
                Some("overlay"),
                &rootfs_dir,
                Some("overlay"),
                MsFlags::empty(),
                Some(options.as_str()),
            )
            .map_err(|e| {
                StrataError::DriverFailure(format!("mounting overlay at {}: {}", rootfs_dir.display(), e))
            })?;
            Ok(None)
        } else {
            Ok(Some(MountInfo {
                source: "overlay".to_string(),
                target: rootfs_dir,
                fs_type: "overlay".to_string(),
                options: vec![options],
            }))
        }
    }

    fn destroy_image(&self, image_path: &Path) -> StrataResult<()> {
        let rootfs_dir = image_path.join("rootfs");
        if rootfs_dir.exists() {
            match umount(&rootfs_dir) {
                Ok(()) => {}
                Err(nix::errno::Errno::EINVAL) => {
                    // Not mounted (caller never mounted it, or already torn down).
                }
                Err(e) => {
                    return Err(StrataError::DriverFailure(format!(
                        "unmounting {}: {}",
                        rootfs_dir.display(),
                        e
                    )))
                }
            }
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

    fn configure_store(&self, store_path: &Path, owner_uid: u32, owner_gid: u32) -> StrataResult<()> {
        create_whiteout_device(&store_path.join(crate::store::layout::WHITEOUT_DEV_NAME), owner_uid, owner_gid)
    }

    fn validate_filesystem(&self, _path: &Path) -> StrataResult<()> {
        // XFS-specific checks (ftype=1, project quota support) require root
        // and a live mount; left to the privileged init-store path in the
        // manager rather than duplicated here.
        Ok(())
    }
}

/// Creates the shared 0:0 character device the unpacker hardlinks from to
/// represent an overlay whiteout, if it doesn't already exist.
fn create_whiteout_device(path: &Path, owner_uid: u32, owner_gid: u32) -> StrataResult<()> {
    if path.exists() {
        return Ok(());
    }

    mknod(path, SFlag::S_IFCHR, Mode::from_bits_truncate(0o600), makedev(0, 0)).map_err(|e| {
        StrataError::DriverFailure(format!("creating whiteout device {}: {}", path.display(), e))
    })?;

    chown(path, Some(owner_uid), Some(owner_gid)).map_err(|e| {
        StrataError::DriverFailure(format!("chown whiteout device {}: {}", path.display(), e))
    })
}

/// Applies the recorded opaque-whiteout marker to a directory: set the
/// overlay opaque xattr and strip anything the unpacker didn't itself place
/// there during this extraction.
fn apply_opaque_whiteout(dir: &Path) -> StrataResult<()> {
    xattr::set(dir, "trusted.overlay.opaque", b"y").map_err(|e| {
        StrataError::DriverFailure(format!(
            "setting opaque xattr on {}: {}",
            dir.display(),
            e
        ))
    })
}

#[allow(dead_code)]
fn is_whiteout_device(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_block_device() || m.rdev() == 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_destroy_volume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        fs::create_dir_all(layout.volumes_dir()).unwrap();
        let driver = OverlayXfsDriver::new(layout.clone());

        let temp_path = driver.create_volume("", "chain-123-tmp").unwrap();
        assert!(temp_path.is_dir());

        let final_path = layout.volume_path("chain-123");
        driver.move_volume(&temp_path, &final_path).unwrap();
        assert!(final_path.is_dir());
        assert!(!temp_path.exists());

        driver.destroy_volume("chain-123").unwrap();
        assert!(!final_path.exists());
    }

    #[test]
    fn move_volume_lets_the_loser_discard_its_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        fs::create_dir_all(layout.volumes_dir()).unwrap();
        let driver = OverlayXfsDriver::new(layout.clone());

        let winner_temp = driver.create_volume("", "chain-abc-win").unwrap();
        let loser_temp = driver.create_volume("", "chain-abc-lose").unwrap();
        let final_path = layout.volume_path("chain-abc");

        driver.move_volume(&winner_temp, &final_path).unwrap();
        // Simulate the loser's rename racing after the winner already landed.
        fs::remove_dir_all(&loser_temp).ok();
        fs::create_dir_all(&loser_temp).unwrap();
        driver.move_volume(&loser_temp, &final_path).unwrap();

        assert!(final_path.is_dir());
        assert!(!loser_temp.exists());
    }

    #[test]
    fn volumes_lists_only_finalized_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        fs::create_dir_all(layout.volumes_dir()).unwrap();
        let driver = OverlayXfsDriver::new(layout.clone());

        fs::create_dir_all(layout.volume_path("a")).unwrap();
        fs::create_dir_all(layout.volume_path("b")).unwrap();

        let mut volumes = driver.volumes().unwrap();
        volumes.sort();
        assert_eq!(volumes, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn volume_path_reports_not_found_for_missing_chain_id() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let driver = OverlayXfsDriver::new(layout);
        assert!(driver.volume_path("missing").is_err());
    }
}
