//! Unprivileged unpacker: a child process forks into its own user
//! namespace, waits on a control pipe until the parent has written its
//! uid/gid maps, then extracts using the same entry engine as the
//! privileged path.

use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use nix::sched::{unshare, CloneFlags};
use nix::unistd::{fork, pipe, ForkResult};
use strata_shared::{IdMappingSpec, StrataError, StrataResult};
use tar::Archive;

use super::tar_entry::{open_target_dir, unpack_entries, EntryContext, WhiteoutStrategy};
use super::{UnpackOutput, UnpackSpec, Unpacker};

/// Writes `/proc/<pid>/{uid,gid}_map` for a child already waiting in its
/// own user namespace. Left abstract because the mapping step (and whether
/// it additionally needs `setgroups=deny` written first) is owned by the
/// id-map helper the core is given, not by this crate (§1 Out of scope).
pub trait IdMapper: Send + Sync {
    fn map_uids(&self, pid: i32, mappings: &[IdMappingSpec]) -> StrataResult<()>;
    fn map_gids(&self, pid: i32, mappings: &[IdMappingSpec]) -> StrataResult<()>;
}

pub struct NamespacedUnpacker {
    id_mapper: Box<dyn IdMapper>,
    whiteout_dev_path: Option<PathBuf>,
}

impl NamespacedUnpacker {
    pub fn new(id_mapper: Box<dyn IdMapper>, whiteout_dev_path: Option<PathBuf>) -> Self {
        Self {
            id_mapper,
            whiteout_dev_path,
        }
    }
}

impl Unpacker for NamespacedUnpacker {
    fn unpack(&self, mut spec: UnpackSpec<Box<dyn Read + Send>>) -> StrataResult<UnpackOutput> {
        std::fs::create_dir_all(&spec.target_path).map_err(|e| {
            StrataError::DriverFailure(format!(
                "making destination directory `{}`: {}",
                spec.target_path.display(),
                e
            ))
        })?;

        let (ctrl_read, ctrl_write) = pipe()
            .map_err(|e| StrataError::DriverFailure(format!("creating control pipe: {}", e)))?;

        let mut input = Vec::new();
        spec.stream
            .read_to_end(&mut input)
            .map_err(|e| StrataError::DriverFailure(format!("buffering layer stream: {}", e)))?;

        // SAFETY: the child immediately execs-equivalent logic (we stay in
        // Rust rather than re-exec'ing a helper binary, but perform no
        // allocation-unsafe work before unsharing and blocking on the pipe).
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(ctrl_read);

                if !spec.uid_mappings.is_empty() {
                    self.id_mapper.map_uids(child.as_raw(), &spec.uid_mappings)?;
                }
                if !spec.gid_mappings.is_empty() {
                    self.id_mapper.map_gids(child.as_raw(), &spec.gid_mappings)?;
                }

                let mut write_file = std::fs::File::from(ctrl_write);
                write_file
                    .write_all(&[0u8])
                    .map_err(|e| StrataError::DriverFailure(format!("signaling control pipe: {}", e)))?;

                let status = nix::sys::wait::waitpid(child, None)
                    .map_err(|e| StrataError::DriverFailure(format!("waiting for unpack child: {}", e)))?;

                match status {
                    nix::sys::wait::WaitStatus::Exited(_, 0) => Ok(UnpackOutput::default()),
                    other => Err(StrataError::DriverFailure(format!(
                        "unpack child failed: {:?}",
                        other
                    ))),
                }
            }
            Ok(ForkResult::Child) => {
                drop(ctrl_write);
                let exit_code = match run_child(&spec, ctrl_read, &input, self.whiteout_dev_path.as_deref()) {
                    Ok(_) => 0,
                    Err(_) => 1,
                };
                std::process::exit(exit_code);
            }
            Err(e) => Err(StrataError::DriverFailure(format!("fork failed: {}", e))),
        }
    }
}

fn run_child(
    spec: &UnpackSpec<Box<dyn Read + Send>>,
    ctrl_read: nix::unistd::OwnedFd,
    input: &[u8],
    whiteout_dev_path: Option<&std::path::Path>,
) -> StrataResult<()> {
    unshare(CloneFlags::CLONE_NEWUSER)
        .map_err(|e| StrataError::DriverFailure(format!("unshare(CLONE_NEWUSER): {}", e)))?;

    // Block until the parent has written our uid/gid maps.
    let mut ctrl_file = std::fs::File::from(ctrl_read);
    let mut buf = [0u8; 1];
    ctrl_file
        .read_exact(&mut buf)
        .map_err(|e| StrataError::DriverFailure(format!("reading control pipe: {}", e)))?;

    let target_dir_file = open_target_dir(&spec.target_path)?;

    let whiteout_dev_dir: Option<PathBuf> = whiteout_dev_path.and_then(|p| p.parent()).map(Path::to_path_buf);
    let whiteout_dev_dir_file = match &whiteout_dev_dir {
        Some(dir) => Some(open_target_dir(dir)?),
        None => None,
    };
    let whiteout_dev_name = whiteout_dev_path.and_then(|p| p.file_name()).map(|n| n.to_string_lossy().into_owned());

    let whiteout = match (&whiteout_dev_dir_file, &whiteout_dev_name) {
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
        running_as_root: true,
        whiteout,
    };

    let mut archive = Archive::new(input);
    unpack_entries(&mut archive, &ctx)?;
    Ok(())
}

