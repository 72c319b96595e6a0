//! Tar-stream unpacking into a target directory, with overlay-aware
//! whiteout handling and id-remapping (§4.3).

mod namespaced;
mod privileged;
pub(crate) mod tar_entry;

pub use namespaced::{IdMapper, NamespacedUnpacker};
pub use privileged::PrivilegedUnpacker;

use std::io::Read;
use std::path::PathBuf;

use strata_shared::{IdMappingSpec, StrataResult};

/// Parameters for unpacking one layer's tar stream into a target directory.
pub struct UnpackSpec<R: Read> {
    pub stream: R,
    pub target_path: PathBuf,
    pub uid_mappings: Vec<IdMappingSpec>,
    pub gid_mappings: Vec<IdMappingSpec>,
}

/// Result of unpacking one layer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnpackOutput {
    pub bytes_written: u64,
    /// Parent directories of `.wh..wh..opq` entries, to be opaqued by the
    /// filesystem driver once the whole tree is in place.
    pub opaque_whiteouts: Vec<PathBuf>,
}

/// Consumes a tar stream and materializes it under `spec.target_path`.
pub trait Unpacker: Send + Sync {
    fn unpack(&self, spec: UnpackSpec<Box<dyn Read + Send>>) -> StrataResult<UnpackOutput>;
}

/// Translates a tar header uid/gid into a host id, applying the off-by-one
/// convention from the external id-mapping contract (§4.3): for a non-root
/// id matched to a mapping of size > 1, the host id is `HostID + id - 1`,
/// not `HostID + (id - NamespaceID)`. This quirk is preserved bit-exactly
/// because other tooling sharing this store depends on it.
pub fn translate_id(id: u32, mappings: &[IdMappingSpec]) -> u32 {
    IdMappingSpec::translate(mappings, id)
}
