//! Orchestrates the recursive, parent-before-child build of every layer
//! volume needed to produce an image's top-of-stack volume (§4.5).

use std::path::PathBuf;

use rand::Rng;
use strata_shared::{IdMappingSpec, StrataError, StrataResult};

use crate::dependency_manager::DependencyManager;
use crate::driver::FilesystemDriver;
use crate::fetcher::{is_local_source, Fetcher, LayerInfo, LocalFetcher, RemoteFetcher};
use crate::store::{temp_volume_name, ChainId};
use crate::unpacker::{UnpackSpec, Unpacker};

/// A container image reference for the duration of one `create`.
pub struct BaseImageSpec {
    pub base_image_src: String,
    pub disk_limit: u64,
    pub exclude_base_image_from_quota: bool,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub uid_mappings: Vec<IdMappingSpec>,
    pub gid_mappings: Vec<IdMappingSpec>,
}

/// Result of a successful base-image pull: the ordered chain IDs (for
/// dependency registration) and the path of the top volume.
pub struct PulledBaseImage {
    pub chain_ids: Vec<ChainId>,
    pub top_volume_path: PathBuf,
    pub image_config: oci_spec::image::ImageConfiguration,
}

pub struct Puller<'a> {
    driver: &'a dyn FilesystemDriver,
    unpacker: &'a dyn Unpacker,
    local_fetcher: LocalFetcher,
    remote_fetcher: Option<&'a RemoteFetcher>,
}

impl<'a> Puller<'a> {
    pub fn new(
        driver: &'a dyn FilesystemDriver,
        unpacker: &'a dyn Unpacker,
        remote_fetcher: Option<&'a RemoteFetcher>,
    ) -> Self {
        Self {
            driver,
            unpacker,
            local_fetcher: LocalFetcher::new(),
            remote_fetcher,
        }
    }

    fn fetcher_for(&self, source: &str) -> StrataResult<&dyn Fetcher> {
        if is_local_source(source) {
            Ok(&self.local_fetcher)
        } else {
            self.remote_fetcher
                .map(|f| f as &dyn Fetcher)
                .ok_or_else(|| StrataError::Config("no remote fetcher configured".to_string()))
        }
    }

    pub fn pull(&self, spec: &BaseImageSpec) -> StrataResult<PulledBaseImage> {
        let fetcher = self.fetcher_for(&spec.base_image_src)?;
        let info = fetcher.base_image_info(&spec.base_image_src)?;

        self.check_quota(&info.layers, spec)?;

        let top_path = self.build_layer(fetcher, info.layers.len() as isize - 1, &info.layers, spec)?;

        let chain_ids = info.layers.iter().map(|l| l.chain_id.clone()).collect();

        Ok(PulledBaseImage {
            chain_ids,
            top_volume_path: top_path,
            image_config: info.image_config,
        })
    }

    fn check_quota(&self, layers: &[LayerInfo], spec: &BaseImageSpec) -> StrataResult<()> {
        if spec.exclude_base_image_from_quota || spec.disk_limit == 0 {
            return Ok(());
        }

        let total: u64 = layers.iter().map(|l| l.size).sum();
        if total > spec.disk_limit {
            return Err(StrataError::QuotaExceeded(format!(
                "layers exceed disk quota {}/{} bytes",
                total, spec.disk_limit
            )));
        }
        Ok(())
    }

    fn build_layer(
        &self,
        fetcher: &dyn Fetcher,
        index: isize,
        layers: &[LayerInfo],
        spec: &BaseImageSpec,
    ) -> StrataResult<PathBuf> {
        if index < 0 {
            return Ok(PathBuf::new());
        }

        let layer = &layers[index as usize];

        if let Ok(path) = self.driver.volume_path(layer.chain_id.as_str()) {
            return Ok(path);
        }

        self.build_layer(fetcher, index - 1, layers, spec)?;

        let blob = fetcher.stream_blob(&spec.base_image_src, &layer.blob_id).map_err(|e| {
            StrataError::DriverFailure(format!("streaming blob `{}`: {}", layer.blob_id, e))
        })?;

        let unix_seconds = unix_seconds_now();
        let random: u64 = rand::rng().random();
        let temp_id = temp_volume_name(&layer.chain_id, unix_seconds, random);

        let parent_id = layer
            .parent_chain_id
            .as_ref()
            .map(ChainId::as_str)
            .unwrap_or("");

        let temp_path = self.driver.create_volume(parent_id, &temp_id)?;

        if spec.owner_uid != 0 || spec.owner_gid != 0 {
            std::os::unix::fs::chown(&temp_path, Some(spec.owner_uid), Some(spec.owner_gid)).map_err(|e| {
                StrataError::DriverFailure(format!(
                    "changing volume ownership to {}:{}: {}",
                    spec.owner_uid, spec.owner_gid, e
                ))
            })?;
        }

        let unpack_spec = UnpackSpec {
            stream: blob.reader,
            target_path: temp_path.clone(),
            uid_mappings: spec.uid_mappings.clone(),
            gid_mappings: spec.gid_mappings.clone(),
        };

        let output = match self.unpacker.unpack(unpack_spec) {
            Ok(output) => output,
            Err(e) => {
                let _ = self.driver.destroy_volume_at(&temp_path);
                return Err(StrataError::DriverFailure(format!(
                    "unpacking layer `{}`: {}",
                    layer.blob_id, e
                )));
            }
        };

        let final_path = self.driver.final_volume_path(layer.chain_id.as_str());

        self.driver.move_volume(&temp_path, &final_path)?;

        for dir in &output.opaque_whiteouts {
            let absolute = final_path.join(dir);
            self.driver.apply_opaque_whiteout(&absolute)?;
        }

        Ok(final_path)
    }
}

fn unix_seconds_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
