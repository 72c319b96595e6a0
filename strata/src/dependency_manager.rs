//! Per-image -> chain-ID hardlink refcounting (§4.7).
//!
//! Crash-safe and lock-free: `link`/`unlink` are atomic, and a counter
//! file's `nlink` is always a conservative upper bound on how many images
//! still depend on it.

use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use strata_shared::{StrataError, StrataResult};

use crate::store::StoreLayout;

pub struct DependencyManager {
    layout: StoreLayout,
}

impl DependencyManager {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn refs_dir(&self, image_id: &str) -> PathBuf {
        self.layout.image_path(image_id).join("refs")
    }

    /// Ensures `images/<id>/refs/` exists, then hardlinks a ref-counter file
    /// per ChainId into it, creating the counter file if this is the first
    /// reference to that ChainId anywhere in the store.
    pub fn register(&self, image_id: &str, chain_ids: &[String]) -> StrataResult<()> {
        let refs_dir = self.refs_dir(image_id);
        fs::create_dir_all(&refs_dir).map_err(|e| {
            StrataError::DriverFailure(format!("creating refs dir for `{}`: {}", image_id, e))
        })?;

        for chain_id in chain_ids {
            let counter_path = self.layout.ref_counter_path(chain_id);

            // O_CREAT without truncation: a pre-existing counter (another
            // image already depends on this ChainId) is left untouched.
            if !counter_path.exists() {
                File::create(&counter_path).map_err(|e| {
                    StrataError::DriverFailure(format!(
                        "creating ref counter `{}`: {}",
                        counter_path.display(),
                        e
                    ))
                })?;
            }

            let ref_path = refs_dir.join(chain_id);
            fs::hard_link(&counter_path, &ref_path).or_else(|e| {
                if ref_path.exists() {
                    Ok(())
                } else {
                    Err(StrataError::DriverFailure(format!(
                        "linking ref counter for `{}` into image `{}`: {}",
                        chain_id, image_id, e
                    )))
                }
            })?;
        }

        Ok(())
    }

    /// Drops every reference an image holds in one step by removing its
    /// `refs/` directory; each counter's `nlink` decrements accordingly.
    pub fn deregister(&self, image_id: &str) -> StrataResult<()> {
        let refs_dir = self.refs_dir(image_id);
        if !refs_dir.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&refs_dir).map_err(|e| {
            StrataError::DriverFailure(format!("deregistering image `{}`: {}", image_id, e))
        })
    }

    pub fn dependencies(&self, image_id: &str) -> StrataResult<Vec<String>> {
        let refs_dir = self.refs_dir(image_id);
        let mut deps = Vec::new();
        for entry in fs::read_dir(&refs_dir).map_err(|e| {
            StrataError::DriverFailure(format!("reading refs dir for `{}`: {}", image_id, e))
        })? {
            let entry = entry.map_err(|e| {
                StrataError::DriverFailure(format!("reading refs dir for `{}`: {}", image_id, e))
            })?;
            deps.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(deps)
    }

    /// True if at least one image still depends on `chain_id`: its counter
    /// file has more than one hardlink (the counter file itself is one).
    pub fn referenced(&self, chain_id: &str) -> StrataResult<bool> {
        let counter_path = self.layout.ref_counter_path(chain_id);
        match fs::metadata(&counter_path) {
            Ok(meta) => Ok(meta.nlink() > 1),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StrataError::DriverFailure(format!(
                "statting ref counter `{}`: {}",
                counter_path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_with_skeleton() -> (tempfile::TempDir, StoreLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        fs::create_dir_all(layout.meta_dir()).unwrap();
        fs::create_dir_all(layout.images_dir()).unwrap();
        (dir, layout)
    }

    #[test]
    fn register_then_referenced_and_dependencies() {
        let (_dir, layout) = layout_with_skeleton();
        let dm = DependencyManager::new(layout);

        dm.register("image-a", &["chain-1".to_string(), "chain-2".to_string()])
            .unwrap();

        assert!(dm.referenced("chain-1").unwrap());
        assert!(dm.referenced("chain-2").unwrap());
        assert!(!dm.referenced("chain-3").unwrap());

        let mut deps = dm.dependencies("image-a").unwrap();
        deps.sort();
        assert_eq!(deps, vec!["chain-1".to_string(), "chain-2".to_string()]);
    }

    #[test]
    fn deregister_drops_references() {
        let (_dir, layout) = layout_with_skeleton();
        let dm = DependencyManager::new(layout);

        dm.register("image-a", &["chain-1".to_string()]).unwrap();
        assert!(dm.referenced("chain-1").unwrap());

        dm.deregister("image-a").unwrap();
        assert!(!dm.referenced("chain-1").unwrap());
    }

    #[test]
    fn shared_chain_id_stays_referenced_until_last_image_deregisters() {
        let (_dir, layout) = layout_with_skeleton();
        let dm = DependencyManager::new(layout);

        dm.register("image-a", &["chain-shared".to_string()]).unwrap();
        dm.register("image-b", &["chain-shared".to_string()]).unwrap();

        dm.deregister("image-a").unwrap();
        assert!(dm.referenced("chain-shared").unwrap());

        dm.deregister("image-b").unwrap();
        assert!(!dm.referenced("chain-shared").unwrap());
    }
}
