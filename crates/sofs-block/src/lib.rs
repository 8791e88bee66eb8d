#![forbid(unsafe_code)]
//! Block I/O layer for SOFS.
//!
//! Provides the `ByteDevice` trait over the backing file, a file-backed
//! implementation using positional reads/writes, an in-memory device for
//! tests, and the `BufferCache`: the process's single source of truth for
//! on-disk content, with dedicated slots for the superblock, the current
//! inode-table block and two reference clusters.

mod cache;
mod device;

pub use cache::BufferCache;
pub use device::{ByteDevice, FileByteDevice, MemDevice};
