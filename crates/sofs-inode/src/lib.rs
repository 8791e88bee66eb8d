#![forbid(unsafe_code)]
//! Layer 2: inode operations.
//!
//! Reading and writing inode records against an expected status, and the
//! permission check with its two distinct denial flavours: execute missing
//! on a path component (EACCES at the host boundary) versus read/write
//! missing on the target (EPERM).

use sofs_block::BufferCache;
use sofs_error::{Result, SofsError};
use sofs_ondisk::{check_inode_free_dirty, check_inode_in_use, Inode};
use sofs_types::{unix_timestamp, AccessMode, Credentials, InodeNumber};
use tracing::trace;

/// Expected state of the inode an operation addresses.
///
/// The C-shaped surface took a raw status word and could fail with an
/// unknown-status error; the enum makes that case unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeStatus {
    InUse,
    FreeDirty,
}

/// Read an inode, validating it against the expected status.
///
/// Reading an in-use inode stamps its last-access time on the on-disk copy
/// before returning, so the returned record matches the disk.
pub fn read_inode(cache: &mut BufferCache, n: InodeNumber, status: InodeStatus) -> Result<Inode> {
    let mut inode = cache.fetch_inode(n)?;
    match status {
        InodeStatus::InUse => {
            {
                let sb = cache.superblock()?;
                check_inode_in_use(n, &inode, sb)?;
            }
            inode.touch_atime(unix_timestamp());
            cache.put_inode(n, &inode)?;
        }
        InodeStatus::FreeDirty => {
            let sb = cache.superblock()?;
            check_inode_free_dirty(n, &inode, sb)?;
        }
    }
    Ok(inode)
}

/// Write an inode after validating it against the expected status.
///
/// Writing an in-use inode stamps both its last-access and last-
/// modification times in place first.
pub fn write_inode(
    cache: &mut BufferCache,
    n: InodeNumber,
    inode: &mut Inode,
    status: InodeStatus,
) -> Result<()> {
    match status {
        InodeStatus::InUse => {
            {
                let sb = cache.superblock()?;
                check_inode_in_use(n, inode, sb)?;
            }
            inode.touch_atime_mtime(unix_timestamp());
        }
        InodeStatus::FreeDirty => {
            let sb = cache.superblock()?;
            check_inode_free_dirty(n, inode, sb)?;
        }
    }
    trace!(target: "sofs::inode", inode = n.0, "inode written");
    cache.put_inode(n, inode)
}

/// Check the caller's credentials against a requested operation on an
/// in-use inode.
///
/// The superuser is granted read and write outright, and execute whenever
/// any of the three triads carries it. Everyone else is matched to exactly
/// one triad: owner, then group, then other. A deficit that includes
/// execute reports `ExecDenied`; any other deficit reports `TargetDenied`.
pub fn access_check(
    cache: &mut BufferCache,
    n: InodeNumber,
    requested: AccessMode,
    cred: Credentials,
) -> Result<()> {
    let inode = read_inode(cache, n, InodeStatus::InUse)?;
    let perms = inode.mode.perms;

    if cred.is_superuser() {
        let any_exec = perms & 0o111 != 0;
        if requested.contains(AccessMode::X) && !any_exec {
            return Err(SofsError::ExecDenied);
        }
        return Ok(());
    }

    let triad = if cred.uid == inode.owner {
        (perms >> 6) & 0o7
    } else if cred.gid == inode.group {
        (perms >> 3) & 0o7
    } else {
        perms & 0o7
    };

    #[expect(clippy::cast_possible_truncation)]
    let missing = requested.missing_from(triad as u8);
    if missing.is_empty() {
        Ok(())
    } else if missing.contains(AccessMode::X) {
        Err(SofsError::ExecDenied)
    } else {
        Err(SofsError::TargetDenied)
    }
}
