#![forbid(unsafe_code)]
//! The mounted-volume handle.
//!
//! `Volume` owns the buffer cache for the lifetime of a mount and exposes
//! the whole operation surface the host adaptor consumes: allocation,
//! inode I/O, file-cluster mapping, directory entries and byte-granular
//! file reads and writes. One in-flight operation at a time; the host
//! serialises calls.

use sofs_block::{BufferCache, ByteDevice};
use sofs_ondisk::check_superblock;
use sofs_types::{BSLPC, MAX_FILE_CLUSTERS};
use std::path::Path;
use tracing::info;

pub use sofs_error::{Result, SofsError};
pub use sofs_file::ReleaseOp;
pub use sofs_inode::InodeStatus;
pub use sofs_ondisk::{FileKind, Inode, SuperBlock, MSTAT_CLEAN, MSTAT_DIRTY};
pub use sofs_types::{AccessMode, ClusterNumber, Credentials, InodeNumber};

/// A mounted SOFS volume.
pub struct Volume {
    cache: BufferCache,
}

impl Volume {
    /// Mount the volume in the backing file at `path`.
    ///
    /// The superblock is validated first. A volume that was not properly
    /// unmounted gets the offline check run on the spot: if it comes back
    /// clean, mounting proceeds, otherwise the mount is refused and the
    /// host should run fsck. The mount-status flag is set dirty until
    /// `unmount`.
    pub fn mount(path: impl AsRef<Path>) -> Result<Self> {
        Self::mount_device(BufferCache::open(path)?)
    }

    /// Mount over an already-open device (test harnesses use this with an
    /// in-memory device).
    pub fn mount_device(mut cache: BufferCache) -> Result<Self> {
        cache.load_superblock()?;
        check_superblock(cache.superblock()?)?;

        if !cache.superblock()?.properly_unmounted() {
            info!(target: "sofs::core", "volume was not properly unmounted, checking");
            let report = sofs_fsck::check_volume(&mut cache)?;
            if !report.is_clean() {
                return Err(SofsError::NotProperlyUnmounted);
            }
        }

        cache.superblock_mut()?.mstat = MSTAT_DIRTY;
        cache.store_superblock()?;
        cache.sync()?;
        info!(target: "sofs::core", "volume mounted");
        Ok(Self { cache })
    }

    /// Cleanly unmount: mark the volume properly unmounted, flush, release.
    pub fn unmount(mut self) -> Result<()> {
        self.cache.superblock_mut()?.mstat = MSTAT_CLEAN;
        self.cache.store_superblock()?;
        self.cache.sync()?;
        self.cache.release_superblock();
        info!(target: "sofs::core", "volume unmounted");
        Ok(())
    }

    /// The loaded superblock (for inspection tooling).
    pub fn superblock(&self) -> Result<&SuperBlock> {
        self.cache.superblock()
    }

    // ── Allocation ──────────────────────────────────────────────────────

    pub fn allocate_inode(&mut self, kind: FileKind, cred: Credentials) -> Result<InodeNumber> {
        sofs_alloc::alloc_inode(&mut self.cache, kind, cred)
    }

    pub fn free_inode(&mut self, n: InodeNumber) -> Result<()> {
        sofs_alloc::free_inode(&mut self.cache, n)
    }

    pub fn clean_inode(&mut self, n: InodeNumber) -> Result<()> {
        sofs_alloc::clean_inode(&mut self.cache, n)
    }

    pub fn allocate_data_cluster(&mut self, n: InodeNumber) -> Result<ClusterNumber> {
        sofs_alloc::alloc_data_cluster(&mut self.cache, n)
    }

    pub fn free_data_cluster(&mut self, c: ClusterNumber) -> Result<()> {
        sofs_alloc::free_data_cluster(&mut self.cache, c)
    }

    pub fn clean_data_cluster(&mut self, owner: InodeNumber, c: ClusterNumber) -> Result<()> {
        sofs_alloc::clean_data_cluster(&mut self.cache, owner, c)
    }

    // ── Inode I/O ───────────────────────────────────────────────────────

    pub fn read_inode(&mut self, n: InodeNumber, status: InodeStatus) -> Result<Inode> {
        sofs_inode::read_inode(&mut self.cache, n, status)
    }

    pub fn write_inode(
        &mut self,
        n: InodeNumber,
        inode: &mut Inode,
        status: InodeStatus,
    ) -> Result<()> {
        sofs_inode::write_inode(&mut self.cache, n, inode, status)
    }

    pub fn access_check(
        &mut self,
        n: InodeNumber,
        requested: AccessMode,
        cred: Credentials,
    ) -> Result<()> {
        sofs_inode::access_check(&mut self.cache, n, requested, cred)
    }

    /// Set the permission bits of an in-use inode (the formatter and hosts
    /// apply modes after allocation, which hands inodes out with all
    /// permission bits reset).
    pub fn set_permissions(&mut self, n: InodeNumber, perms: u16) -> Result<()> {
        let mut inode = sofs_inode::read_inode(&mut self.cache, n, InodeStatus::InUse)?;
        inode.mode.perms = perms & 0o777;
        sofs_inode::write_inode(&mut self.cache, n, &mut inode, InodeStatus::InUse)
    }

    // ── File-cluster mapping ────────────────────────────────────────────

    pub fn get_file_cluster(
        &mut self,
        n: InodeNumber,
        index: u32,
    ) -> Result<Option<ClusterNumber>> {
        sofs_file::get_file_cluster(&mut self.cache, n, index)
    }

    pub fn alloc_file_cluster(&mut self, n: InodeNumber, index: u32) -> Result<ClusterNumber> {
        sofs_file::alloc_file_cluster(&mut self.cache, n, index)
    }

    pub fn handle_file_cluster(
        &mut self,
        n: InodeNumber,
        index: u32,
        op: ReleaseOp,
    ) -> Result<()> {
        sofs_file::handle_file_cluster(&mut self.cache, n, index, op)
    }

    pub fn handle_file_clusters(
        &mut self,
        n: InodeNumber,
        start_index: u32,
        op: ReleaseOp,
    ) -> Result<()> {
        sofs_file::handle_file_clusters(&mut self.cache, n, start_index, op)
    }

    pub fn read_file_cluster(&mut self, n: InodeNumber, index: u32) -> Result<Vec<u8>> {
        sofs_file::read_file_cluster(&mut self.cache, n, index)
    }

    pub fn write_file_cluster(&mut self, n: InodeNumber, index: u32, data: &[u8]) -> Result<()> {
        sofs_file::write_file_cluster(&mut self.cache, n, index, data)
    }

    pub fn read_symlink_target(&mut self, n: InodeNumber) -> Result<String> {
        sofs_file::read_symlink_target(&mut self.cache, n)
    }

    pub fn write_symlink_target(&mut self, n: InodeNumber, target: &str) -> Result<()> {
        sofs_file::write_symlink_target(&mut self.cache, n, target)
    }

    // ── Directory entries ───────────────────────────────────────────────

    pub fn get_dir_entry_by_path(
        &mut self,
        path: &str,
        cred: Credentials,
    ) -> Result<(InodeNumber, InodeNumber)> {
        sofs_dir::get_dir_entry_by_path(&mut self.cache, path, cred)
    }

    pub fn get_dir_entry_by_name(
        &mut self,
        dir: InodeNumber,
        name: &str,
        cred: Credentials,
    ) -> Result<(InodeNumber, u32)> {
        sofs_dir::get_dir_entry_by_name(&mut self.cache, dir, name, cred)
    }

    pub fn add_dir_entry(
        &mut self,
        dir: InodeNumber,
        name: &str,
        entry: InodeNumber,
        cred: Credentials,
    ) -> Result<()> {
        sofs_dir::add_dir_entry(&mut self.cache, dir, name, entry, cred)
    }

    pub fn remove_dir_entry(
        &mut self,
        dir: InodeNumber,
        name: &str,
        cred: Credentials,
    ) -> Result<()> {
        sofs_dir::remove_dir_entry(&mut self.cache, dir, name, cred)
    }

    pub fn rename_dir_entry(
        &mut self,
        dir: InodeNumber,
        old_name: &str,
        new_name: &str,
        cred: Credentials,
    ) -> Result<()> {
        sofs_dir::rename_dir_entry(&mut self.cache, dir, old_name, new_name, cred)
    }

    pub fn move_dir_entry(
        &mut self,
        src_dir: InodeNumber,
        src_name: &str,
        dst_dir: InodeNumber,
        dst_name: &str,
        cred: Credentials,
    ) -> Result<()> {
        sofs_dir::move_dir_entry(&mut self.cache, src_dir, src_name, dst_dir, dst_name, cred)
    }

    pub fn check_directory_emptiness(&mut self, dir: InodeNumber) -> Result<()> {
        sofs_dir::check_directory_emptiness(&mut self.cache, dir)
    }

    pub fn attach_directory(
        &mut self,
        base: InodeNumber,
        name: &str,
        sub: InodeNumber,
        cred: Credentials,
    ) -> Result<()> {
        sofs_dir::attach_directory(&mut self.cache, base, name, sub, cred)
    }

    pub fn detach_dir_entry(
        &mut self,
        base: InodeNumber,
        name: &str,
        cred: Credentials,
    ) -> Result<()> {
        sofs_dir::detach_dir_entry(&mut self.cache, base, name, cred)
    }

    pub fn list_dir_entries(
        &mut self,
        dir: InodeNumber,
        cred: Credentials,
    ) -> Result<Vec<(String, InodeNumber)>> {
        sofs_dir::list_dir_entries(&mut self.cache, dir, cred)
    }

    // ── Byte-granular file I/O ──────────────────────────────────────────

    /// Read up to `len` bytes of a regular file starting at `offset`,
    /// clamped to the file size; holes read as zeros.
    pub fn read_file(&mut self, n: InodeNumber, offset: u64, len: usize) -> Result<Vec<u8>> {
        let inode = self.read_inode(n, InodeStatus::InUse)?;
        if inode.kind() != Some(FileKind::Regular) {
            return Err(SofsError::WrongType);
        }
        let size = u64::from(inode.size);
        if offset >= size {
            return Ok(Vec::new());
        }
        let end = size.min(offset + len as u64);

        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let index = (pos / BSLPC as u64) as u32;
            let in_cluster = (pos % BSLPC as u64) as usize;
            let take = ((end - pos) as usize).min(BSLPC - in_cluster);
            let payload = self.read_file_cluster(n, index)?;
            out.extend_from_slice(&payload[in_cluster..in_cluster + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    /// Write `data` into a regular file at `offset`, allocating clusters on
    /// the way and growing the size when writing past the end.
    pub fn write_file(&mut self, n: InodeNumber, offset: u64, data: &[u8]) -> Result<()> {
        {
            let inode = self.read_inode(n, InodeStatus::InUse)?;
            if inode.kind() != Some(FileKind::Regular) {
                return Err(SofsError::WrongType);
            }
        }
        let end = offset + data.len() as u64;
        if end > u64::from(MAX_FILE_CLUSTERS) * BSLPC as u64 {
            return Err(SofsError::FileTooBig);
        }

        let mut pos = offset;
        let mut written = 0_usize;
        while pos < end {
            let index = (pos / BSLPC as u64) as u32;
            let in_cluster = (pos % BSLPC as u64) as usize;
            let take = ((end - pos) as usize).min(BSLPC - in_cluster);

            let cluster = match self.get_file_cluster(n, index)? {
                Some(cluster) => cluster,
                None => self.alloc_file_cluster(n, index)?,
            };
            let mut value = self.cache.fetch_cluster(cluster)?;
            value.payload_mut()[in_cluster..in_cluster + take]
                .copy_from_slice(&data[written..written + take]);
            self.cache.put_cluster(cluster, &value)?;

            pos += take as u64;
            written += take;
        }

        let mut inode = self.read_inode(n, InodeStatus::InUse)?;
        if end > u64::from(inode.size) {
            inode.size = end as u32;
        }
        self.write_inode(n, &mut inode, InodeStatus::InUse)
    }

    /// Truncate (or sparsely extend) a regular file to `new_size` bytes.
    /// Shrinking releases whole clusters past the boundary and zeroes the
    /// tail of the boundary cluster.
    pub fn truncate(&mut self, n: InodeNumber, new_size: u64) -> Result<()> {
        let inode = self.read_inode(n, InodeStatus::InUse)?;
        if inode.kind() != Some(FileKind::Regular) {
            return Err(SofsError::WrongType);
        }
        if new_size > u64::from(MAX_FILE_CLUSTERS) * BSLPC as u64 {
            return Err(SofsError::FileTooBig);
        }
        let old_size = u64::from(inode.size);

        if new_size < old_size {
            let keep_clusters = new_size.div_ceil(BSLPC as u64) as u32;
            if keep_clusters < MAX_FILE_CLUSTERS {
                self.handle_file_clusters(n, keep_clusters, ReleaseOp::FreeClean)?;
            }
            // Zero the dead tail of the boundary cluster.
            let tail = (new_size % BSLPC as u64) as usize;
            if tail > 0 {
                let index = (new_size / BSLPC as u64) as u32;
                if let Some(cluster) = self.get_file_cluster(n, index)? {
                    let mut value = self.cache.fetch_cluster(cluster)?;
                    value.payload_mut()[tail..].fill(0);
                    self.cache.put_cluster(cluster, &value)?;
                }
            }
        }

        let mut inode = self.read_inode(n, InodeStatus::InUse)?;
        inode.size = new_size as u32;
        self.write_inode(n, &mut inode, InodeStatus::InUse)
    }
}

/// Mount over an arbitrary byte device.
pub fn mount_on(dev: Box<dyn ByteDevice>) -> Result<Volume> {
    Volume::mount_device(BufferCache::new(dev)?)
}
