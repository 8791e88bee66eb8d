#![forbid(unsafe_code)]
//! Error types for SOFS.
//!
//! Defines `SofsError` and a `Result<T>` alias used throughout the
//! workspace, plus the errno mapping host adaptors rely on. The variants
//! follow the fixed taxonomy of the on-disk core: argument, space, name,
//! permission, consistency and I/O errors, each distinct so fsck and mount
//! can report a specific diagnostic.

use sofs_types::{ClusterNumber, CodecError, InodeNumber};
use thiserror::Error;

/// Unified error type for all SOFS operations.
#[derive(Debug, Error)]
pub enum SofsError {
    // ── Argument errors ─────────────────────────────────────────────────
    #[error("invalid inode number {0}")]
    InvalidInode(u32),

    #[error("invalid cluster number {0}")]
    InvalidCluster(u32),

    #[error("invalid file-cluster index {0}")]
    InvalidClusterIndex(u32),

    #[error("path is not absolute")]
    NotAbsolutePath,

    #[error("name too long")]
    NameTooLong,

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("wrong file type for operation")]
    WrongType,

    #[error("unknown expected inode status")]
    InvalidStatus,

    // ── Space errors ────────────────────────────────────────────────────
    #[error("no free inodes")]
    NoFreeInodes,

    #[error("no free data clusters")]
    NoFreeClusters,

    #[error("file would exceed the maximum cluster count")]
    FileTooBig,

    #[error("directory is full")]
    DirectoryFull,

    #[error("link count would overflow")]
    TooManyLinks,

    // ── Name errors ─────────────────────────────────────────────────────
    #[error("entry not found: {0:?}")]
    NotFound(String),

    #[error("entry already exists: {0:?}")]
    AlreadyExists(String),

    #[error("directory not empty")]
    NotEmpty,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("too many symbolic links in path resolution")]
    SymlinkLoop,

    // ── Permission errors ───────────────────────────────────────────────
    /// Execute permission missing on a path component; maps to `EACCES`.
    #[error("execute permission denied")]
    ExecDenied,

    /// Read or write permission missing on the target; maps to `EPERM`.
    #[error("operation not permitted")]
    TargetDenied,

    // ── Allocation-state errors ─────────────────────────────────────────
    #[error("inode {0} is not allocated")]
    InodeNotAllocated(InodeNumber),

    #[error("cluster {0} is not allocated")]
    ClusterNotAllocated(ClusterNumber),

    #[error("inode {0} still has {1} outstanding references")]
    RefsOutstanding(InodeNumber, u16),

    /// The addressed slot of the reference tree already holds a cluster.
    #[error("file-cluster index already holds a cluster")]
    AlreadyAllocated,

    // ── Consistency errors ──────────────────────────────────────────────
    #[error("invalid superblock: {0}")]
    InvalidSuperblock(&'static str),

    #[error("volume was not properly unmounted")]
    NotProperlyUnmounted,

    #[error("inconsistent in-use inode {0}")]
    InconsistentInodeInUse(InodeNumber),

    #[error("inconsistent free-clean inode {0}")]
    InconsistentFreeCleanInode(InodeNumber),

    #[error("inconsistent free-dirty inode {0}")]
    InconsistentFreeDirtyInode(InodeNumber),

    #[error("inconsistent reference list of inode {0}")]
    InconsistentRefList(InodeNumber),

    #[error("inconsistent data-cluster header of cluster {0}")]
    InconsistentClusterHeader(ClusterNumber),

    #[error("cluster {cluster} is stamped with inode {found}, expected {expected}")]
    WrongInodeStamp {
        cluster: ClusterNumber,
        expected: InodeNumber,
        found: u32,
    },

    /// The addressed slot of the reference tree holds no cluster.
    #[error("reference not on the list of references")]
    RefNotOnList,

    #[error("malformed directory contents in inode {0}")]
    MalformedDirectory(InodeNumber),

    // ── I/O errors ──────────────────────────────────────────────────────
    #[error("device not open")]
    DeviceNotOpen,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("on-disk decode failed: {0}")]
    Codec(#[from] CodecError),
}

impl SofsError {
    /// Convert this error into a POSIX errno suitable for host replies.
    ///
    /// The `ExecDenied`/`TargetDenied` distinction is preserved: the former
    /// surfaces as `EACCES`, the latter as `EPERM`.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::InvalidInode(_)
            | Self::InvalidCluster(_)
            | Self::InvalidClusterIndex(_)
            | Self::NotAbsolutePath
            | Self::InvalidName(_)
            | Self::WrongType
            | Self::InvalidStatus => libc::EINVAL,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NoFreeInodes | Self::NoFreeClusters => libc::ENOSPC,
            Self::FileTooBig | Self::DirectoryFull => libc::EFBIG,
            Self::TooManyLinks => libc::EMLINK,
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::SymlinkLoop => libc::ELOOP,
            Self::ExecDenied => libc::EACCES,
            Self::TargetDenied => libc::EPERM,
            Self::InodeNotAllocated(_)
            | Self::ClusterNotAllocated(_)
            | Self::RefsOutstanding(_, _)
            | Self::AlreadyAllocated => libc::EINVAL,
            Self::InvalidSuperblock(_)
            | Self::NotProperlyUnmounted
            | Self::InconsistentInodeInUse(_)
            | Self::InconsistentFreeCleanInode(_)
            | Self::InconsistentFreeDirtyInode(_)
            | Self::InconsistentRefList(_)
            | Self::InconsistentClusterHeader(_)
            | Self::WrongInodeStamp { .. }
            | Self::RefNotOnList
            | Self::MalformedDirectory(_)
            | Self::Codec(_) => libc::EIO,
            Self::DeviceNotOpen => libc::EBADF,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result alias using `SofsError`.
pub type Result<T> = std::result::Result<T, SofsError>;
