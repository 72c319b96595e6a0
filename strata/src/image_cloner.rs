//! Composes an image's rootfs out of already-pulled volumes and owns its
//! on-disk `images/<ID>/` directory (§4.6).

use std::fs;
use std::os::unix::fs::chown;
use std::path::PathBuf;

use oci_spec::image::ImageConfiguration;
use strata_shared::{StrataError, StrataResult};

use crate::driver::{FilesystemDriver, ImageDriverSpec, MountInfo, VolumeStats};
use crate::store::StoreLayout;

/// Parameters for composing one image from its base volumes.
pub struct ImageSpec {
    pub id: String,
    pub base_volume_ids: Vec<String>,
    pub mount: bool,
    pub disk_limit: u64,
    pub exclude_base_image_from_quota: bool,
    pub base_image_config: ImageConfiguration,
    pub owner_uid: u32,
    pub owner_gid: u32,
}

/// What `create` hands back: where the image lives, and (if the caller must
/// perform the mount itself) the mount it still owes.
pub struct ImageInfo {
    pub path: PathBuf,
    pub rootfs: PathBuf,
    pub image_config: ImageConfiguration,
    pub mount: Option<MountInfo>,
}

pub struct ImageCloner<'a> {
    driver: &'a dyn FilesystemDriver,
    layout: StoreLayout,
}

impl<'a> ImageCloner<'a> {
    pub fn new(driver: &'a dyn FilesystemDriver, layout: StoreLayout) -> Self {
        Self { driver, layout }
    }

    pub fn image_ids(&self) -> StrataResult<Vec<String>> {
        let dir = self.layout.images_dir();
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)
            .map_err(|e| StrataError::DriverFailure(format!("reading images dir: {}", e)))?
        {
            let entry = entry.map_err(|e| StrataError::DriverFailure(format!("reading images dir: {}", e)))?;
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(ids)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.layout.image_path(id).exists()
    }

    pub fn create(&self, spec: ImageSpec) -> StrataResult<ImageInfo> {
        let image_path = self.layout.image_path(&spec.id);
        let rootfs_path = image_path.join("rootfs");

        let result = self.try_create(&spec, &image_path, &rootfs_path);
        if result.is_err() {
            if let Err(e) = self.driver.destroy_image(&image_path) {
                tracing::error!(image = %spec.id, error = %e, "destroying rootfs image during create rollback");
            }
            if let Err(e) = fs::remove_dir_all(&image_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(image = %spec.id, error = %e, "deleting image path during create rollback");
                }
            }
        }
        result
    }

    fn try_create(&self, spec: &ImageSpec, image_path: &PathBuf, rootfs_path: &PathBuf) -> StrataResult<ImageInfo> {
        fs::create_dir(image_path).map_err(|e| {
            StrataError::DriverFailure(format!("making image path {}: {}", image_path.display(), e))
        })?;
        #[cfg(unix)]
        fs::set_permissions(image_path, std::os::unix::fs::PermissionsExt::from_mode(0o700))
            .map_err(|e| StrataError::DriverFailure(format!("setting image path permissions: {}", e)))?;

        let image_json_path = image_path.join("image.json");
        self.write_image_json(&image_json_path, &spec.base_image_config)?;

        let driver_spec = ImageDriverSpec {
            image_id: spec.id.clone(),
            image_path: image_path.clone(),
            base_volume_ids: spec.base_volume_ids.clone(),
            mount: spec.mount,
            owner_uid: spec.owner_uid,
            owner_gid: spec.owner_gid,
        };

        let mount_info = self.driver.create_image(&driver_spec)?;

        if spec.owner_uid != 0 || spec.owner_gid != 0 {
            for path in [image_path.as_path(), image_json_path.as_path(), rootfs_path.as_path()] {
                chown(path, Some(spec.owner_uid), Some(spec.owner_gid)).map_err(|e| {
                    StrataError::DriverFailure(format!(
                        "changing {} ownership to {}:{}: {}",
                        path.display(),
                        spec.owner_uid,
                        spec.owner_gid,
                        e
                    ))
                })?;
            }
        }

        Ok(ImageInfo {
            path: image_path.clone(),
            rootfs: rootfs_path.clone(),
            image_config: spec.base_image_config.clone(),
            mount: if spec.mount { None } else { mount_info },
        })
    }

    fn write_image_json(&self, path: &PathBuf, config: &ImageConfiguration) -> StrataResult<()> {
        let file = fs::File::create(path).map_err(|e| {
            StrataError::DriverFailure(format!("creating {}: {}", path.display(), e))
        })?;
        serde_json::to_writer(file, config).map_err(|e| {
            StrataError::DriverFailure(format!("writing {}: {}", path.display(), e))
        })
    }

    pub fn destroy(&self, id: &str) -> StrataResult<()> {
        if !self.exists(id) {
            return Err(StrataError::NotFound(format!("image not found: {}", id)));
        }

        let image_path = self.layout.image_path(id);
        if let Err(e) = self.driver.destroy_image(&image_path) {
            tracing::error!(image = %id, error = %e, "destroying image failed");
        }

        fs::remove_dir_all(&image_path).map_err(|e| {
            StrataError::DriverFailure(format!("deleting image path {}: {}", image_path.display(), e))
        })
    }

    pub fn stats(&self, id: &str) -> StrataResult<VolumeStats> {
        if !self.exists(id) {
            return Err(StrataError::NotFound(format!("image not found: {}", id)));
        }
        self.driver.fetch_stats(&self.layout.image_path(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::OverlayXfsDriver;

    fn layout_with_skeleton() -> (tempfile::TempDir, StoreLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        fs::create_dir_all(layout.images_dir()).unwrap();
        fs::create_dir_all(layout.volumes_dir()).unwrap();
        (dir, layout)
    }

    fn base_spec(id: &str, base_volume_ids: Vec<String>) -> ImageSpec {
        ImageSpec {
            id: id.to_string(),
            base_volume_ids,
            mount: true,
            disk_limit: 0,
            exclude_base_image_from_quota: false,
            base_image_config: ImageConfiguration::default(),
            owner_uid: 0,
            owner_gid: 0,
        }
    }

    #[test]
    fn create_writes_image_json_and_delegates_rootfs_composition() {
        let (_dir, layout) = layout_with_skeleton();
        fs::create_dir_all(layout.volume_path("base")).unwrap();
        let driver = OverlayXfsDriver::new(layout.clone());
        let cloner = ImageCloner::new(&driver, layout.clone());

        let spec = base_spec("img-1", vec!["base".to_string()]);
        let info = cloner.create(spec).unwrap();

        assert!(info.path.join("image.json").is_file());
        assert!(cloner.exists("img-1"));
    }

    #[test]
    fn create_rolls_back_on_driver_failure() {
        let (_dir, layout) = layout_with_skeleton();
        let driver = OverlayXfsDriver::new(layout.clone());
        let cloner = ImageCloner::new(&driver, layout.clone());

        // No such base volume; driver.create_image fails resolving lower dirs.
        let spec = base_spec("img-missing-base", vec!["nonexistent".to_string()]);
        assert!(cloner.create(spec).is_err());
        assert!(!cloner.exists("img-missing-base"));
    }

    #[test]
    fn destroy_reports_not_found_for_missing_image() {
        let (_dir, layout) = layout_with_skeleton();
        let driver = OverlayXfsDriver::new(layout.clone());
        let cloner = ImageCloner::new(&driver, layout);
        let err = cloner.destroy("never-existed").unwrap_err();
        assert!(err.to_string().contains("image not found"));
    }
}
