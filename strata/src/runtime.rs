//! Top-level facade binding every component into the `create` / `destroy` /
//! `clean` operations a caller actually performs, mirroring `groot.Creator`
//! and `groot.cleaner` wired together by a single `Manager`-configured store.

use strata_shared::{IdMappingSpec, StrataError, StrataResult};

use crate::dependency_manager::DependencyManager;
use crate::driver::FilesystemDriver;
use crate::fetcher::RemoteFetcher;
use crate::gc::GarbageCollector;
use crate::image_cloner::{ImageCloner, ImageInfo, ImageSpec};
use crate::lock::{LockGuard, Locksmith, GLOBAL_LOCK_KEY};
use crate::manager::Manager;
use crate::puller::{BaseImageSpec, Puller};
use crate::store::{StoreLayout, StoreMeasurer, VolumeSizer};
use crate::unpacker::Unpacker;

/// Everything `create` needs, mirroring `groot.CreateSpec`.
pub struct CreateSpec {
    pub id: String,
    pub base_image_src: String,
    pub disk_limit: u64,
    pub mount: bool,
    pub exclude_base_image_from_quota: bool,
    pub clean_on_create: bool,
    pub clean_on_create_threshold_bytes: u64,
    pub uid_mappings: Vec<IdMappingSpec>,
    pub gid_mappings: Vec<IdMappingSpec>,
}

/// Owns no state itself: every call borrows the driver/unpacker/locksmith
/// the caller constructed for the configured store.
pub struct StrataStore<'a> {
    layout: StoreLayout,
    driver: &'a dyn FilesystemDriver,
    unpacker: &'a dyn Unpacker,
    remote_fetcher: Option<&'a RemoteFetcher>,
    locksmith: &'a dyn Locksmith,
    dependency_manager: DependencyManager,
}

impl<'a> StrataStore<'a> {
    pub fn new(
        layout: StoreLayout,
        driver: &'a dyn FilesystemDriver,
        unpacker: &'a dyn Unpacker,
        remote_fetcher: Option<&'a RemoteFetcher>,
        locksmith: &'a dyn Locksmith,
    ) -> Self {
        let dependency_manager = DependencyManager::new(layout.clone());
        Self {
            layout,
            driver,
            unpacker,
            remote_fetcher,
            locksmith,
            dependency_manager,
        }
    }

    pub fn manager(&self) -> Manager<'a> {
        Manager::new(self.layout.clone(), self.driver, self.locksmith)
    }

    /// Pulls the base image layer-by-layer, composes the image's rootfs,
    /// and registers its ChainId dependencies, rolling the image back if
    /// registration fails.
    pub fn create(&self, spec: CreateSpec) -> StrataResult<ImageInfo> {
        if spec.id.contains('/') {
            return Err(StrataError::InvalidArgument(format!(
                "id `{}` contains invalid characters: `/`",
                spec.id
            )));
        }

        let image_cloner = ImageCloner::new(self.driver, self.layout.clone());
        if image_cloner.exists(&spec.id) {
            return Err(StrataError::AlreadyExists(format!(
                "image for id `{}` already exists",
                spec.id
            )));
        }

        let (owner_uid, owner_gid) = parse_owner(&spec.uid_mappings, &spec.gid_mappings);

        if spec.clean_on_create {
            self.clean(spec.clean_on_create_threshold_bytes)?;
        }

        let _guard = LockGuard::acquire(self.locksmith, GLOBAL_LOCK_KEY)?;

        let puller = Puller::new(self.driver, self.unpacker, self.remote_fetcher);
        let base_image_spec = BaseImageSpec {
            base_image_src: spec.base_image_src.clone(),
            disk_limit: spec.disk_limit,
            exclude_base_image_from_quota: spec.exclude_base_image_from_quota,
            owner_uid,
            owner_gid,
            uid_mappings: spec.uid_mappings.clone(),
            gid_mappings: spec.gid_mappings.clone(),
        };
        let pulled = puller.pull(&base_image_spec)?;

        let chain_id_strings: Vec<String> = pulled
            .chain_ids
            .iter()
            .map(|c| c.as_str().to_string())
            .collect();

        let image_spec = ImageSpec {
            id: spec.id.clone(),
            base_volume_ids: chain_id_strings.clone(),
            mount: spec.mount,
            disk_limit: spec.disk_limit,
            exclude_base_image_from_quota: spec.exclude_base_image_from_quota,
            base_image_config: pulled.image_config,
            owner_uid,
            owner_gid,
        };

        let image_info = image_cloner.create(image_spec)?;

        if let Err(e) = self.dependency_manager.register(&spec.id, &chain_id_strings) {
            if let Err(destroy_err) = image_cloner.destroy(&spec.id) {
                tracing::error!(image = %spec.id, error = %destroy_err, "failed to destroy image after registration failure");
            }
            return Err(e);
        }

        Ok(image_info)
    }

    /// Destroys an image's rootfs and drops its ChainId references.
    pub fn destroy(&self, id: &str) -> StrataResult<()> {
        let image_cloner = ImageCloner::new(self.driver, self.layout.clone());
        image_cloner.destroy(id)?;
        self.dependency_manager.deregister(id)
    }

    pub fn image_ids(&self) -> StrataResult<Vec<String>> {
        ImageCloner::new(self.driver, self.layout.clone()).image_ids()
    }

    pub fn stats(&self, id: &str) -> StrataResult<crate::driver::VolumeStats> {
        ImageCloner::new(self.driver, self.layout.clone()).stats(id)
    }

    /// Finds unused volumes, marks the cheap-to-rebuild local-tar ones
    /// unconditionally, then, unless the cache is already under
    /// `cache_bytes`, takes the global lock to mark the rest and collects
    /// everything marked. Returns `true` if collection was skipped as a
    /// no-op because the store was already under the threshold.
    pub fn clean(&self, cache_bytes: u64) -> StrataResult<bool> {
        let gc = GarbageCollector::new(self.driver, &self.dependency_manager, self.layout.clone());

        let unused = gc.unused_volumes()?;
        gc.mark_unused(&unused.local_tar_volume_ids)?;

        if cache_bytes > 0 {
            let measurer = StoreMeasurer::new(&self.layout);
            let sizer = DriverVolumeSizer { driver: self.driver };
            if cache_bytes >= measurer.measure_cache(&sizer)? {
                gc.collect()?;
                return Ok(true);
            }
        }

        {
            let _guard = LockGuard::acquire(self.locksmith, GLOBAL_LOCK_KEY)?;
            gc.mark_unused(&unused.layer_volume_ids)?;
        }

        gc.collect()?;
        Ok(false)
    }
}

/// Bridges the driver's volume listing and stats into the measurer's
/// filesystem-agnostic sizing contract.
struct DriverVolumeSizer<'a> {
    driver: &'a dyn FilesystemDriver,
}

impl VolumeSizer for DriverVolumeSizer<'_> {
    fn volume_ids(&self) -> StrataResult<Vec<String>> {
        self.driver.volumes()
    }

    fn volume_size(&self, chain_id: &str) -> StrataResult<u64> {
        let path = self.driver.volume_path(chain_id)?;
        Ok(self.driver.fetch_stats(&path)?.exclusive_bytes)
    }
}

/// The owner a newly created image's files should be chowned to: the
/// host id a size==1 root mapping designates, or the calling process's
/// own uid/gid if no such mapping is present.
fn parse_owner(uid_mappings: &[IdMappingSpec], gid_mappings: &[IdMappingSpec]) -> (u32, u32) {
    let uid = uid_mappings
        .iter()
        .find(|m| m.size == 1 && m.namespace_id == 0)
        .map(|m| m.host_id)
        .unwrap_or_else(|| nix::unistd::getuid().as_raw());

    let gid = gid_mappings
        .iter()
        .find(|m| m.size == 1 && m.namespace_id == 0)
        .map(|m| m.host_id)
        .unwrap_or_else(|| nix::unistd::getgid().as_raw());

    (uid, gid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_owner_falls_back_to_the_calling_process_identity_when_unmapped() {
        let (uid, gid) = parse_owner(&[], &[]);
        assert_eq!(uid, nix::unistd::getuid().as_raw());
        assert_eq!(gid, nix::unistd::getgid().as_raw());
    }

    #[test]
    fn parse_owner_prefers_a_size_one_root_mapping() {
        let uid_mappings = vec![IdMappingSpec::new(0, 4000, 1)];
        let gid_mappings = vec![IdMappingSpec::new(0, 4001, 1)];
        assert_eq!(parse_owner(&uid_mappings, &gid_mappings), (4000, 4001));
    }
}
