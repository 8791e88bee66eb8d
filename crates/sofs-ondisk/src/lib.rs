#![forbid(unsafe_code)]
//! On-disk structures of the SOFS format.
//!
//! Bit-exact (little-endian) encode/decode for the superblock, inodes,
//! data clusters and directory entries, together with the read-only
//! consistency predicates shared by the allocators, the upper layers and
//! fsck. No I/O happens here; the buffer cache feeds these codecs.

pub mod cluster;
pub mod consist;
pub mod inode;
pub mod superblock;

pub use cluster::{ClusterHeader, DataCluster, DirEntry};
pub use consist::{
    check_cluster_header, check_dir_head, check_inode_free_clean, check_inode_free_dirty,
    check_inode_in_use, check_ref_list, check_superblock, ClusterState,
};
pub use inode::{decode_inode_block, encode_inode_block, FileKind, Inode, InodeAux, Mode};
pub use superblock::{InsertionCache, RetrievalCache, SuperBlock, MSTAT_CLEAN, MSTAT_DIRTY};
