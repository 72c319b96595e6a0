//! Filesystem-driver contract (§4.2): volume lifecycle, image composition,
//! and driver-specific store setup, behind one trait with two concrete
//! backends.

mod btrfs;
mod overlay;

pub use btrfs::BtrfsDriver;
pub use overlay::OverlayXfsDriver;

use std::path::{Path, PathBuf};

use strata_shared::StrataResult;

/// A mount the caller must perform, returned instead of an already-mounted
/// rootfs when the caller lacks the privilege to mount directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub source: String,
    pub target: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// Parameters for composing a writable rootfs out of finalized volumes.
#[derive(Debug, Clone)]
pub struct ImageDriverSpec {
    pub image_id: String,
    pub image_path: PathBuf,
    /// Ordered parent -> child; the last entry is the image's top layer.
    pub base_volume_ids: Vec<String>,
    pub mount: bool,
    pub owner_uid: u32,
    pub owner_gid: u32,
}

/// Disk usage of a single volume or image rootfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    pub total_bytes: u64,
    pub exclusive_bytes: u64,
}

/// Polymorphic filesystem-driver capability set (§4.2). A store is
/// configured with exactly one implementation for its lifetime.
pub trait FilesystemDriver: Send + Sync {
    fn volume_path(&self, chain_id: &str) -> StrataResult<PathBuf>;

    /// Computes the final on-disk path a ChainId will occupy once
    /// finalized, without checking whether it exists yet. Used by the
    /// puller to name `move_volume`'s destination.
    fn final_volume_path(&self, chain_id: &str) -> PathBuf;

    /// Creates a directory usable as a child layer of `parent_id` (empty
    /// string for a base layer), returning its path. The returned path is
    /// a scratch location; callers finalize it via [`FilesystemDriver::move_volume`].
    fn create_volume(&self, parent_id: &str, temp_id: &str) -> StrataResult<PathBuf>;

    fn destroy_volume(&self, chain_id: &str) -> StrataResult<()>;

    /// Destroys a volume that has been renamed out of its ChainId-keyed
    /// path (e.g. by garbage-collection marking), addressed by its current
    /// location rather than its ChainId.
    fn destroy_volume_at(&self, path: &Path) -> StrataResult<()>;

    /// Atomically renames `from_path` to `to_path` within the store.
    fn move_volume(&self, from_path: &Path, to_path: &Path) -> StrataResult<()>;

    /// Marks a directory opaque, hiding whatever its parent volume's lower
    /// layers contributed to it. Overlay unions need this explicitly;
    /// drivers that materialize each layer as a real copy (btrfs snapshots)
    /// already got this for free when the unpacker deleted the directory's
    /// prior contents, so it's a no-op there.
    fn apply_opaque_whiteout(&self, dir: &Path) -> StrataResult<()>;

    fn volumes(&self) -> StrataResult<Vec<String>>;

    fn create_image(&self, spec: &ImageDriverSpec) -> StrataResult<Option<MountInfo>>;

    fn destroy_image(&self, image_path: &Path) -> StrataResult<()>;

    fn fetch_stats(&self, path: &Path) -> StrataResult<VolumeStats>;

    fn configure_store(&self, store_path: &Path, owner_uid: u32, owner_gid: u32) -> StrataResult<()>;

    fn validate_filesystem(&self, path: &Path) -> StrataResult<()>;
}
