//! Registry-backed image source: pulls the manifest and config to build the
//! ordered `LayerInfo` chain, then streams layer blobs on demand.

use std::io::Cursor;

use oci_client::client::ClientConfig;
use oci_client::manifest::OciManifest;
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference};
use oci_spec::image::ImageConfiguration;
use strata_shared::{StrataError, StrataResult};

use crate::store::ChainId;

use super::{BaseImageInfo, BlobStream, Fetcher, LayerInfo};

pub struct RemoteFetcher {
    client: Client,
    auth: RegistryAuth,
    runtime: tokio::runtime::Runtime,
}

impl RemoteFetcher {
    pub fn new() -> StrataResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| StrataError::Internal(format!("building async runtime: {}", e)))?;

        Ok(Self {
            client: Client::new(ClientConfig::default()),
            auth: RegistryAuth::Anonymous,
            runtime,
        })
    }

    fn reference(source: &str) -> StrataResult<Reference> {
        source
            .parse()
            .map_err(|e| StrataError::InvalidArgument(format!("invalid image reference `{}`: {}", source, e)))
    }
}

impl Fetcher for RemoteFetcher {
    fn base_image_info(&self, source: &str) -> StrataResult<BaseImageInfo> {
        let reference = Self::reference(source)?;

        self.runtime.block_on(async {
            let (manifest, _digest) = self
                .client
                .pull_image_manifest(&reference, &self.auth)
                .await
                .map_err(|e| StrataError::DriverFailure(format!("pulling manifest for `{}`: {}", source, e)))?;

            let OciManifest::Image(manifest) = manifest else {
                return Err(StrataError::InvalidArgument(format!(
                    "`{}` is a manifest list, not a single image",
                    source
                )));
            };

            let mut config_bytes = Vec::new();
            self.client
                .pull_blob(&reference, &manifest.config, &mut config_bytes)
                .await
                .map_err(|e| StrataError::DriverFailure(format!("pulling image config for `{}`: {}", source, e)))?;

            let image_config = ImageConfiguration::from_reader(Cursor::new(&config_bytes))
                .map_err(|e| StrataError::IntegrityFailure(format!("parsing image config for `{}`: {}", source, e)))?;

            let diff_ids = image_config.rootfs().diff_ids();
            if diff_ids.len() != manifest.layers.len() {
                return Err(StrataError::IntegrityFailure(format!(
                    "`{}` has {} layers but {} diff ids",
                    source,
                    manifest.layers.len(),
                    diff_ids.len()
                )));
            }

            let chain = ChainId::chain_for(diff_ids);

            let mut layers = Vec::with_capacity(manifest.layers.len());
            for (i, descriptor) in manifest.layers.iter().enumerate() {
                layers.push(LayerInfo {
                    blob_id: descriptor.digest.clone(),
                    diff_id: diff_ids[i].clone(),
                    size: descriptor.size,
                    chain_id: chain[i].clone(),
                    parent_chain_id: if i == 0 { None } else { Some(chain[i - 1].clone()) },
                });
            }

            Ok(BaseImageInfo { layers, image_config })
        })
    }

    fn stream_blob(&self, source: &str, blob_id: &str) -> StrataResult<BlobStream> {
        let reference = Self::reference(source)?;

        self.runtime.block_on(async {
            let mut buf = Vec::new();
            self.client
                .pull_blob(&reference, &oci_client::manifest::OciDescriptor {
                    digest: blob_id.to_string(),
                    ..Default::default()
                }, &mut buf)
                .await
                .map_err(|e| StrataError::DriverFailure(format!("streaming blob `{}`: {}", blob_id, e)))?;

            let size = buf.len() as u64;
            Ok(BlobStream {
                reader: Box::new(Cursor::new(buf)),
                size,
            })
        })
    }
}
