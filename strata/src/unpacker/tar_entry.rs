//! Pure tar-entry-to-filesystem engine, usable from both the privileged
//! (in-process chroot) and namespaced (child-process) unpacker variants.
//!
//! Every filesystem operation is relative to an open directory fd for the
//! volume root, matching the `*at` syscalls the original uses to avoid
//! resolving any absolute path baked into a malicious tar entry.

use std::ffi::CString;
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};

use filetime::{set_symlink_file_times, FileTime};
use nix::errno::Errno;
use nix::fcntl::{open, openat, OFlag};
use nix::sys::stat::{fchmod, fchmodat, fstat, FchmodatFlags, Mode};
use nix::unistd::{
    fchownat, linkat, mkdirat, symlinkat, unlinkat, FchownatFlags, LinkatFlags, Uid, Gid,
    UnlinkatFlags,
};
use strata_shared::{StrataError, StrataResult};
use tar::{Archive, EntryType};

use super::{translate_id, UnpackOutput};
use strata_shared::IdMappingSpec;

/// Whiteout handling strategy: overlay needs the 0:0 char-device trick,
/// other backends (e.g. btrfs without overlay on top) just delete.
pub enum WhiteoutStrategy<'a> {
    Overlay { whiteout_dev_dir_fd: BorrowedFd<'a>, whiteout_dev_name: &'a str },
    PlainDelete,
}

pub struct EntryContext<'a> {
    pub target_dir_fd: BorrowedFd<'a>,
    pub uid_mappings: &'a [IdMappingSpec],
    pub gid_mappings: &'a [IdMappingSpec],
    pub running_as_root: bool,
    pub whiteout: WhiteoutStrategy<'a>,
}

/// Opens `target_path` as an `O_DIRECTORY` fd suitable for `*at` calls.
pub fn open_target_dir(target_path: &Path) -> StrataResult<std::fs::File> {
    let fd = open(target_path, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty()).map_err(|e| {
        StrataError::DriverFailure(format!(
            "opening target directory {}: {}",
            target_path.display(),
            e
        ))
    })?;
    Ok(std::fs::File::from(fd))
}

/// Streams every entry of `archive` into the directory referenced by
/// `ctx.target_dir_fd`, returning total bytes written and the parent
/// directories of any opaque-whiteout markers encountered.
pub fn unpack_entries<R: Read>(
    archive: &mut Archive<R>,
    ctx: &EntryContext,
) -> StrataResult<UnpackOutput> {
    let mut bytes_written = 0u64;
    let mut opaque_whiteouts = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| StrataError::IntegrityFailure(format!("reading tar stream: {}", e)))?
    {
        let mut entry = entry.map_err(|e| StrataError::IntegrityFailure(format!("reading tar entry: {}", e)))?;
        let entry_path = entry
            .path()
            .map_err(|e| StrataError::IntegrityFailure(format!("invalid tar entry path: {}", e)))?
            .into_owned();

        let file_name = entry_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if file_name == ".wh..wh..opq" {
            let parent = entry_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            opaque_whiteouts.push(parent);
            continue;
        }

        if file_name.contains(".wh.") {
            remove_whiteout(ctx, &entry_path)?;
            continue;
        }

        let uid = entry.header().uid().unwrap_or(0) as u32;
        let gid = entry.header().gid().unwrap_or(0) as u32;
        let mode = entry.header().mode().unwrap_or(0o644);
        let mtime = entry.header().mtime().unwrap_or(0);
        let entry_type = entry.header().entry_type();
        let link_name = entry
            .link_name()
            .ok()
            .flatten()
            .map(|p| p.into_owned());

        let written = match entry_type {
            EntryType::Block | EntryType::Char => 0,
            EntryType::Link => {
                let target = link_name.ok_or_else(|| {
                    StrataError::IntegrityFailure(format!(
                        "hard link entry `{}` has no link name",
                        entry_path.display()
                    ))
                })?;
                create_hard_link(ctx, &entry_path, &target)?;
                0
            }
            EntryType::Symlink => {
                let target = link_name.ok_or_else(|| {
                    StrataError::IntegrityFailure(format!(
                        "symlink entry `{}` has no link name",
                        entry_path.display()
                    ))
                })?;
                create_symlink(ctx, &entry_path, &target, uid, gid, mtime)?;
                0
            }
            EntryType::Directory => {
                create_directory(ctx, &entry_path, mode, uid, gid, mtime)?;
                0
            }
            _ => create_regular_file(ctx, &entry_path, mode, uid, gid, mtime, &mut entry)?,
        };

        bytes_written += written;
    }

    Ok(UnpackOutput {
        bytes_written,
        opaque_whiteouts,
    })
}

fn cpath(path: &Path) -> StrataResult<CString> {
    CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| StrataError::IntegrityFailure(format!("tar entry path contains a NUL byte: {}", e)))
}

fn permission_denied_message(entry_path: &Path) -> String {
    let dir = entry_path.parent().unwrap_or(Path::new("/"));
    format!(
        "'{}' does not give write permission to its owner. This image can only be unpacked using uid and gid mappings, or by running as root.",
        dir.display()
    )
}

fn create_directory(
    ctx: &EntryContext,
    entry_path: &Path,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u64,
) -> StrataResult<()> {
    let path = cpath(entry_path)?;
    let fmode = Mode::from_bits_truncate(mode);

    match mkdirat(Some(ctx.target_dir_fd.as_raw_fd()), path.as_c_str(), fmode) {
        Ok(()) => {}
        Err(Errno::EEXIST) => {}
        Err(Errno::EACCES) => return Err(StrataError::Permission(permission_denied_message(entry_path))),
        Err(e) => {
            return Err(StrataError::DriverFailure(format!(
                "making directory `{}`: {}",
                entry_path.display(),
                e
            )))
        }
    }

    chown_entry(ctx, entry_path, uid, gid)?;

    fchmodat(
        Some(ctx.target_dir_fd.as_raw_fd()),
        path.as_c_str(),
        fmode,
        FchmodatFlags::FollowSymlink,
    )
    .map_err(|e| StrataError::DriverFailure(format!("chmoding directory `{}`: {}", entry_path.display(), e)))?;

    set_entry_mtime(ctx, entry_path, mtime)
}

fn create_regular_file<R: Read>(
    ctx: &EntryContext,
    entry_path: &Path,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u64,
    reader: &mut R,
) -> StrataResult<u64> {
    let path = cpath(entry_path)?;
    let fmode = Mode::from_bits_truncate(mode);

    let fd = openat(
        Some(ctx.target_dir_fd.as_raw_fd()),
        path.as_c_str(),
        OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_WRONLY,
        fmode,
    )
    .map_err(|e| match e {
        Errno::EACCES => StrataError::Permission(permission_denied_message(entry_path)),
        e => StrataError::DriverFailure(format!("creating file `{}`: {}", entry_path.display(), e)),
    })?;

    let file = std::fs::File::from(fd);
    let written = {
        let mut file_ref = &file;
        std::io::copy(reader, &mut file_ref)
            .map_err(|e| StrataError::DriverFailure(format!("writing file `{}`: {}", entry_path.display(), e)))?
    };

    if ctx.running_as_root {
        let translated_uid = translate_id(uid, ctx.uid_mappings);
        let translated_gid = translate_id(gid, ctx.gid_mappings);
        nix::unistd::fchown(
            file.as_fd(),
            Some(Uid::from_raw(translated_uid)),
            Some(Gid::from_raw(translated_gid)),
        )
        .map_err(|e| {
            StrataError::DriverFailure(format!("chowning file `{}`: {}", entry_path.display(), e))
        })?;
    }

    fchmod(file.as_fd(), fmode)
        .map_err(|e| StrataError::DriverFailure(format!("chmoding file `{}`: {}", entry_path.display(), e)))?;

    set_entry_mtime(ctx, entry_path, mtime)?;

    Ok(written)
}

fn create_hard_link(ctx: &EntryContext, entry_path: &Path, link_name: &Path) -> StrataResult<()> {
    let target = cpath(entry_path)?;
    let source = cpath(link_name)?;

    linkat(
        Some(ctx.target_dir_fd.as_raw_fd()),
        source.as_c_str(),
        Some(ctx.target_dir_fd.as_raw_fd()),
        target.as_c_str(),
        LinkatFlags::NoSymlinkFollow,
    )
    .map_err(|e| {
        StrataError::DriverFailure(format!(
            "linking `{}` -> `{}`: {}",
            entry_path.display(),
            link_name.display(),
            e
        ))
    })
}

fn create_symlink(
    ctx: &EntryContext,
    entry_path: &Path,
    link_name: &Path,
    uid: u32,
    gid: u32,
    mtime: u64,
) -> StrataResult<()> {
    let path = cpath(entry_path)?;

    if entry_exists(ctx, entry_path) {
        unlinkat(Some(ctx.target_dir_fd.as_raw_fd()), path.as_c_str(), UnlinkatFlags::NoRemoveDir)
            .map_err(|e| {
                StrataError::DriverFailure(format!("removing symlink `{}`: {}", entry_path.display(), e))
            })?;
    }

    symlinkat(link_name, Some(ctx.target_dir_fd.as_raw_fd()), path.as_c_str()).map_err(|e| {
        StrataError::DriverFailure(format!(
            "creating symlink `{}` -> `{}`: {}",
            entry_path.display(),
            link_name.display(),
            e
        ))
    })?;

    set_entry_mtime(ctx, entry_path, mtime)?;

    if ctx.running_as_root {
        chown_entry_no_follow(ctx, entry_path, uid, gid)?;
    }

    Ok(())
}

fn chown_entry(ctx: &EntryContext, entry_path: &Path, uid: u32, gid: u32) -> StrataResult<()> {
    if !ctx.running_as_root {
        return Ok(());
    }

    let path = cpath(entry_path)?;
    let translated_uid = translate_id(uid, ctx.uid_mappings);
    let translated_gid = translate_id(gid, ctx.gid_mappings);

    fchownat(
        Some(ctx.target_dir_fd.as_raw_fd()),
        path.as_c_str(),
        Some(Uid::from_raw(translated_uid)),
        Some(Gid::from_raw(translated_gid)),
        FchownatFlags::FollowSymlink,
    )
    .map_err(|e| {
        StrataError::DriverFailure(format!(
            "chowning {}:{} `{}`: {}",
            translated_uid,
            translated_gid,
            entry_path.display(),
            e
        ))
    })
}

fn chown_entry_no_follow(ctx: &EntryContext, entry_path: &Path, uid: u32, gid: u32) -> StrataResult<()> {
    let path = cpath(entry_path)?;
    let translated_uid = translate_id(uid, ctx.uid_mappings);
    let translated_gid = translate_id(gid, ctx.gid_mappings);

    fchownat(
        Some(ctx.target_dir_fd.as_raw_fd()),
        path.as_c_str(),
        Some(Uid::from_raw(translated_uid)),
        Some(Gid::from_raw(translated_gid)),
        FchownatFlags::NoFollowSymlink,
    )
    .map_err(|e| {
        StrataError::DriverFailure(format!(
            "chowning link {}:{} `{}`: {}",
            translated_uid,
            translated_gid,
            entry_path.display(),
            e
        ))
    })
}

fn set_entry_mtime(_ctx: &EntryContext, entry_path: &Path, mtime: u64) -> StrataResult<()> {
    // filetime operates on absolute/relative paths resolved from the
    // process cwd; callers run this with the volume root already as cwd
    // (privileged, post-chroot) so `entry_path` resolves correctly.
    let ft = FileTime::from_unix_time(mtime as i64, 0);
    set_symlink_file_times(entry_path, ft, ft)
        .map_err(|e| StrataError::DriverFailure(format!("setting mtime on `{}`: {}", entry_path.display(), e)))
}

fn entry_exists(ctx: &EntryContext, entry_path: &Path) -> bool {
    let Ok(path) = cpath(entry_path) else {
        return false;
    };
    fstatat_exists(ctx.target_dir_fd, &path)
}

fn fstatat_exists(dir_fd: BorrowedFd<'_>, path: &CString) -> bool {
    nix::sys::stat::fstatat(
        Some(dir_fd.as_raw_fd()),
        path.as_c_str(),
        nix::fcntl::AtFlags::AT_SYMLINK_NOFOLLOW,
    )
    .is_ok()
}

fn remove_whiteout(ctx: &EntryContext, entry_path: &Path) -> StrataResult<()> {
    let stripped = strip_whiteout_prefix(entry_path);
    let stripped_cpath = cpath(&stripped)?;

    match unlinkat(Some(ctx.target_dir_fd.as_raw_fd()), stripped_cpath.as_c_str(), UnlinkatFlags::NoRemoveDir) {
        Ok(()) | Err(Errno::ENOENT) => {}
        Err(e) => {
            return Err(StrataError::DriverFailure(format!(
                "removing whiteout target `{}`: {}",
                stripped.display(),
                e
            )))
        }
    }

    if let WhiteoutStrategy::Overlay {
        whiteout_dev_dir_fd,
        whiteout_dev_name,
    } = ctx.whiteout
    {
        let dev_name = CString::new(whiteout_dev_name).unwrap();
        linkat(
            Some(whiteout_dev_dir_fd.as_raw_fd()),
            dev_name.as_c_str(),
            Some(ctx.target_dir_fd.as_raw_fd()),
            stripped_cpath.as_c_str(),
            LinkatFlags::NoSymlinkFollow,
        )
        .map_err(|e| {
            StrataError::DriverFailure(format!(
                "creating whiteout device at `{}`: {}",
                stripped.display(),
                e
            ))
        })?;
    }

    Ok(())
}

fn strip_whiteout_prefix(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    PathBuf::from(s.replacen(".wh.", "", 1))
}

#[allow(dead_code)]
fn stat_exists(fd: BorrowedFd<'_>) -> bool {
    fstat(fd.as_raw_fd()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_whiteout_prefix_removes_first_marker_only() {
        assert_eq!(
            strip_whiteout_prefix(Path::new("etc/.wh.passwd")),
            PathBuf::from("etc/passwd")
        );
        assert_eq!(
            strip_whiteout_prefix(Path::new(".wh.a.wh.b")),
            PathBuf::from("a.wh.b")
        );
    }

    #[test]
    fn permission_denied_message_names_parent_directory() {
        let msg = permission_denied_message(Path::new("usr/local/bin/tool"));
        assert!(msg.contains("usr/local/bin"));
        assert!(msg.contains("uid and gid mappings"));
    }
}
