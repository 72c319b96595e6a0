//! Single-tarball local image source: `base_image_info` returns one
//! synthetic layer whose ChainId encodes the tarball's path and mtime.

use std::fs::File;
use std::path::Path;

use oci_spec::image::ImageConfiguration;
use strata_shared::{StrataError, StrataResult};

use crate::store::ChainId;

use super::{BaseImageInfo, BlobStream, Fetcher, LayerInfo};

pub struct LocalFetcher;

impl LocalFetcher {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for LocalFetcher {
    fn base_image_info(&self, source: &str) -> StrataResult<BaseImageInfo> {
        let path = Path::new(source);
        let metadata = std::fs::metadata(path).map_err(|e| {
            StrataError::NotFound(format!("local image not found at `{}`: {}", source, e))
        })?;

        if metadata.is_dir() {
            return Err(StrataError::InvalidArgument(format!(
                "directory provided instead of a tar file: `{}`",
                source
            )));
        }

        let mtime = metadata.modified().map_err(|e| {
            StrataError::DriverFailure(format!("reading mtime of `{}`: {}", source, e))
        })?;

        let chain_id = ChainId::local_tar(path, mtime);

        let layer = LayerInfo {
            blob_id: source.to_string(),
            diff_id: chain_id.as_str().to_string(),
            size: metadata.len(),
            chain_id,
            parent_chain_id: None,
        };

        Ok(BaseImageInfo {
            layers: vec![layer],
            image_config: ImageConfiguration::default(),
        })
    }

    fn stream_blob(&self, source: &str, _blob_id: &str) -> StrataResult<BlobStream> {
        let file = File::open(source).map_err(|e| {
            StrataError::NotFound(format!("reading local image `{}`: {}", source, e))
        })?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(BlobStream {
            reader: Box::new(file),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn base_image_info_synthesizes_a_single_local_tar_layer() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("image.tar");
        std::fs::write(&tar_path, b"not a real tar, just bytes").unwrap();

        let fetcher = LocalFetcher::new();
        let source = tar_path.to_string_lossy().into_owned();
        let info = fetcher.base_image_info(&source).unwrap();

        assert_eq!(info.layers.len(), 1);
        assert!(info.layers[0].chain_id.is_local_tar());
        assert!(info.layers[0].parent_chain_id.is_none());
    }

    #[test]
    fn base_image_info_rejects_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = LocalFetcher::new();
        let source = dir.path().to_string_lossy().into_owned();
        assert!(fetcher.base_image_info(&source).is_err());
    }

    #[test]
    fn stream_blob_reads_the_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("image.tar");
        let mut f = File::create(&tar_path).unwrap();
        f.write_all(b"hello world").unwrap();

        let fetcher = LocalFetcher::new();
        let source = tar_path.to_string_lossy().into_owned();
        let mut blob = fetcher.stream_blob(&source, &source).unwrap();

        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut blob.reader, &mut buf).unwrap();
        assert_eq!(buf, b"hello world");
    }
}
