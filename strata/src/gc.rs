//! Finds volumes no image depends on, marks them so new pulls skip them,
//! and collects the marks under the global lock (§4.9).

use std::fs;
use std::path::PathBuf;

use strata_shared::{StrataError, StrataResult};

use crate::dependency_manager::DependencyManager;
use crate::driver::FilesystemDriver;
use crate::store::{ChainId, StoreLayout};

const MARK_SUFFIX: &str = "-unused";

/// Unused volumes, split by how cheaply they can be rebuilt: a local-tar
/// volume is keyed off a tarball's path and mtime, so losing it costs only
/// a re-unpack of something already on disk.
pub struct UnusedVolumes {
    pub layer_volume_ids: Vec<String>,
    pub local_tar_volume_ids: Vec<String>,
}

pub struct GarbageCollector<'a> {
    driver: &'a dyn FilesystemDriver,
    dependency_manager: &'a DependencyManager,
    layout: StoreLayout,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(driver: &'a dyn FilesystemDriver, dependency_manager: &'a DependencyManager, layout: StoreLayout) -> Self {
        Self {
            driver,
            dependency_manager,
            layout,
        }
    }

    pub fn unused_volumes(&self) -> StrataResult<UnusedVolumes> {
        let mut layer_volume_ids = Vec::new();
        let mut local_tar_volume_ids = Vec::new();

        for chain_id in self.driver.volumes()? {
            if self.is_marked(&chain_id) {
                continue;
            }
            if self.dependency_manager.referenced(&chain_id)? {
                continue;
            }

            if ChainId::from(chain_id.as_str()).is_local_tar() {
                local_tar_volume_ids.push(chain_id);
            } else {
                layer_volume_ids.push(chain_id);
            }
        }

        Ok(UnusedVolumes {
            layer_volume_ids,
            local_tar_volume_ids,
        })
    }

    /// Renames each volume with a suffix new pulls and `volumes()` listings
    /// won't be fooled by; reversible only by [`GarbageCollector::collect`]
    /// destroying it outright, never by un-marking.
    pub fn mark_unused(&self, chain_ids: &[String]) -> StrataResult<()> {
        for chain_id in chain_ids {
            let from = self.layout.volume_path(chain_id);
            if !from.exists() {
                continue;
            }
            let to = self.mark_path(chain_id);
            fs::rename(&from, &to).map_err(|e| {
                StrataError::DriverFailure(format!(
                    "marking volume {} unused: {}",
                    chain_id, e
                ))
            })?;
        }
        Ok(())
    }

    /// Destroys every marked volume. Must be called with the global lock
    /// held by the caller (§5).
    pub fn collect(&self) -> StrataResult<()> {
        for path in self.marked_volume_paths()? {
            self.driver.destroy_volume_at(&path)?;
        }
        Ok(())
    }

    fn is_marked(&self, chain_id: &str) -> bool {
        self.mark_path(chain_id).exists()
    }

    fn mark_path(&self, chain_id: &str) -> PathBuf {
        self.layout.volumes_dir().join(format!("{}{}", chain_id, MARK_SUFFIX))
    }

    fn marked_volume_paths(&self) -> StrataResult<Vec<PathBuf>> {
        let dir = self.layout.volumes_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut marked = Vec::new();
        for entry in fs::read_dir(&dir)
            .map_err(|e| StrataError::DriverFailure(format!("listing volumes: {}", e)))?
        {
            let entry = entry.map_err(|e| StrataError::DriverFailure(format!("listing volumes: {}", e)))?;
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(MARK_SUFFIX) {
                marked.push(entry.path());
            }
        }
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::OverlayXfsDriver;

    fn layout_with_skeleton() -> (tempfile::TempDir, StoreLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        fs::create_dir_all(layout.volumes_dir()).unwrap();
        fs::create_dir_all(layout.meta_dir()).unwrap();
        fs::create_dir_all(layout.images_dir()).unwrap();
        (dir, layout)
    }

    #[test]
    fn unused_volumes_splits_layer_and_local_tar_ids() {
        let (_dir, layout) = layout_with_skeleton();
        let driver = OverlayXfsDriver::new(layout.clone());
        let dm = DependencyManager::new(layout.clone());
        let gc = GarbageCollector::new(&driver, &dm, layout.clone());

        let local_tar_id = ChainId::local_tar(
            std::path::Path::new("/tmp/image.tar"),
            std::time::SystemTime::UNIX_EPOCH,
        );
        fs::create_dir_all(layout.volume_path(local_tar_id.as_str())).unwrap();
        fs::create_dir_all(layout.volume_path("layer-a")).unwrap();
        dm.register("image-a", &["layer-a".to_string()]).unwrap();

        let unused = gc.unused_volumes().unwrap();
        assert_eq!(unused.local_tar_volume_ids, vec![local_tar_id.as_str().to_string()]);
        assert!(unused.layer_volume_ids.is_empty());
    }

    #[test]
    fn mark_then_collect_destroys_only_marked_volumes() {
        let (_dir, layout) = layout_with_skeleton();
        let driver = OverlayXfsDriver::new(layout.clone());
        let dm = DependencyManager::new(layout.clone());
        let gc = GarbageCollector::new(&driver, &dm, layout.clone());

        fs::create_dir_all(layout.volume_path("stale")).unwrap();
        fs::create_dir_all(layout.volume_path("keep")).unwrap();

        gc.mark_unused(&["stale".to_string()]).unwrap();
        assert!(!layout.volume_path("stale").exists());

        gc.collect().unwrap();
        assert!(layout.volume_path("keep").exists());

        let remaining = driver.volumes().unwrap();
        assert_eq!(remaining, vec!["keep".to_string()]);
    }
}
