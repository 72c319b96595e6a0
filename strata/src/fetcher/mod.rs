//! Base-image source abstraction (§4.4): ordered layer metadata plus a blob
//! stream, with a local-tarball and a remote-registry implementation.

mod local;
mod remote;

pub use local::LocalFetcher;
pub use remote::RemoteFetcher;

use std::io::Read;

use oci_spec::image::ImageConfiguration;
use strata_shared::StrataResult;

use crate::store::ChainId;

/// One layer of a base image, in parent-to-child order.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    pub blob_id: String,
    pub diff_id: String,
    pub size: u64,
    pub chain_id: ChainId,
    pub parent_chain_id: Option<ChainId>,
}

/// The ordered layer list plus the image config of a base image source.
#[derive(Debug, Clone)]
pub struct BaseImageInfo {
    pub layers: Vec<LayerInfo>,
    pub image_config: ImageConfiguration,
}

/// An owned, closable byte stream of a layer tar, plus its size if known.
pub struct BlobStream {
    pub reader: Box<dyn Read + Send>,
    pub size: u64,
}

/// Source-agnostic collaborator interface the puller depends on (§4.4).
pub trait Fetcher: Send + Sync {
    fn base_image_info(&self, source: &str) -> StrataResult<BaseImageInfo>;
    fn stream_blob(&self, source: &str, blob_id: &str) -> StrataResult<BlobStream>;
}

/// Picks the local or remote fetcher by URL scheme: empty scheme (a bare
/// filesystem path) selects local, anything else selects remote.
pub fn is_local_source(source: &str) -> bool {
    !source.contains("://")
}
