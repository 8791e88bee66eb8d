#![forbid(unsafe_code)]
//! Volume formatter: writes the superblock, the inode table with inode 0 as
//! the root directory and the rest as a free list, the root-directory
//! cluster, and the general free list of data clusters.
//!
//! The real magic number is written only after every other structure is in
//! place; an interrupted format leaves a volume that can never be mounted.

use sofs_block::BufferCache;
use sofs_error::{Result, SofsError};
use sofs_ondisk::{
    check_dir_head, check_inode_in_use, check_superblock, encode_inode_block, ClusterHeader,
    DataCluster, DirEntry, FileKind, Inode, InsertionCache, RetrievalCache, SuperBlock,
    MSTAT_CLEAN,
};
use sofs_types::{
    unix_timestamp, BlockNumber, ClusterNumber, Credentials, InodeNumber, BLOCKS_PER_CLUSTER,
    BLOCK_SIZE, DIR_ENTRY_SIZE, DPC, FORMAT_STAMP, IPB, MAGIC, VERSION,
};
use std::path::Path;
use tracing::info;

/// Formatting options.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Volume name stored in the superblock (truncated to the field size).
    pub volume_name: String,
    /// Requested inode count; `None` selects one inode per eight blocks.
    pub inode_count: Option<u32>,
    /// Zero the payload of every free data cluster.
    pub zero_fill: bool,
    /// Owner and group of the root directory.
    pub owner: Credentials,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            volume_name: "SOFS".to_owned(),
            inode_count: None,
            zero_fill: false,
            owner: Credentials::ROOT,
        }
    }
}

/// The computed volume layout, reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeLayout {
    pub ntotal: u32,
    pub itable_size: u32,
    pub itotal: u32,
    pub dzone_total: u32,
}

/// Solve `ntotal == 1 + itable_size + dzone_total * BLOCKS_PER_CLUSTER` for
/// integer table and zone sizes, adjusting the requested inode count.
pub fn solve_layout(ntotal: u32, requested_inodes: u32) -> Result<VolumeLayout> {
    let mut itotal = if requested_inodes == 0 {
        ntotal >> 3
    } else {
        requested_inodes
    };
    itotal = itotal.max(1);

    let mut itable_size = itotal.div_ceil(IPB);
    let usable = ntotal
        .checked_sub(1 + itable_size)
        .ok_or(SofsError::InvalidSuperblock("device too small to format"))?;
    let dzone_total = usable / BLOCKS_PER_CLUSTER;
    // Final adjustment: give any remainder blocks to the inode table so the
    // layout identity holds exactly.
    itable_size = ntotal - 1 - dzone_total * BLOCKS_PER_CLUSTER;
    itotal = itable_size * IPB;

    if dzone_total == 0 || itable_size == 0 {
        return Err(SofsError::InvalidSuperblock("device too small to format"));
    }
    Ok(VolumeLayout {
        ntotal,
        itable_size,
        itotal,
        dzone_total,
    })
}

/// Format the backing file at `path`.
pub fn format(path: impl AsRef<Path>, opts: &FormatOptions) -> Result<VolumeLayout> {
    let mut cache = BufferCache::open(path)?;
    format_device(&mut cache, opts)
}

/// Format an already-open device.
pub fn format_device(cache: &mut BufferCache, opts: &FormatOptions) -> Result<VolumeLayout> {
    let layout = solve_layout(cache.block_count(), opts.inode_count.unwrap_or(0))?;
    info!(
        target: "sofs::mkfs",
        ntotal = layout.ntotal,
        itotal = layout.itotal,
        dzone_total = layout.dzone_total,
        "formatting volume"
    );

    write_superblock(cache, opts, layout, FORMAT_STAMP)?;
    write_inode_table(cache, opts, layout)?;
    write_root_dir(cache)?;
    write_free_clusters(cache, layout, opts.zero_fill)?;

    // All structures are in place; stamp the real magic number.
    write_superblock(cache, opts, layout, MAGIC)?;

    self_check(cache)?;
    cache.sync()?;
    info!(target: "sofs::mkfs", "format complete");
    Ok(layout)
}

fn write_superblock(
    cache: &mut BufferCache,
    opts: &FormatOptions,
    layout: VolumeLayout,
    magic: u32,
) -> Result<()> {
    let general_list = layout.dzone_total > 1;
    let sb = SuperBlock {
        magic,
        version: VERSION,
        name: opts.volume_name.clone(),
        ntotal: layout.ntotal,
        mstat: MSTAT_CLEAN,
        itable_start: 1,
        itable_size: layout.itable_size,
        itotal: layout.itotal,
        ifree: layout.itotal - 1,
        ihead: Some(InodeNumber(1)),
        itail: Some(InodeNumber(layout.itotal - 1)),
        dzone_start: 1 + layout.itable_size,
        dzone_total: layout.dzone_total,
        dzone_free: layout.dzone_total - 1,
        retrieval: RetrievalCache::empty(),
        insertion: InsertionCache::empty(),
        dhead: general_list.then_some(ClusterNumber(1)),
        dtail: general_list.then_some(ClusterNumber(layout.dzone_total - 1)),
    };
    cache.load_superblock()?;
    *cache.superblock_mut()? = sb;
    cache.store_superblock()
}

fn write_inode_table(
    cache: &mut BufferCache,
    opts: &FormatOptions,
    layout: VolumeLayout,
) -> Result<()> {
    let now = unix_timestamp();
    for table_block in 0..layout.itable_size {
        // Built from scratch and written raw: whatever the device held
        // before the format never has to decode.
        let inodes: Vec<Inode> = (0..IPB)
            .map(|slot| {
                let n = table_block * IPB + slot;
                if n == 0 {
                    root_inode(opts.owner, now)
                } else {
                    let next = (n + 1 < layout.itotal).then_some(InodeNumber(n + 1));
                    let prev = (n > 1).then_some(InodeNumber(n - 1));
                    Inode::free_clean(next, prev)
                }
            })
            .collect();
        cache.write_block(BlockNumber(1 + table_block), &encode_inode_block(&inodes))?;
    }
    Ok(())
}

fn root_inode(owner: Credentials, now: u32) -> Inode {
    let mut root = Inode::new_in_use(FileKind::Directory, 0o777, owner.uid, owner.gid, now);
    root.refcount = 2;
    root.size = DPC * DIR_ENTRY_SIZE as u32;
    root.clucount = 1;
    root.direct[0] = Some(ClusterNumber::ROOT_DIR);
    root
}

fn write_root_dir(cache: &mut BufferCache) -> Result<()> {
    let mut cluster = DataCluster::blank_dir(ClusterHeader::allocated_to(InodeNumber::ROOT));
    cluster.set_dir_entry(0, &DirEntry::new(".", InodeNumber::ROOT)?);
    cluster.set_dir_entry(1, &DirEntry::new("..", InodeNumber::ROOT)?);
    cache.put_cluster(ClusterNumber::ROOT_DIR, &cluster)
}

fn write_free_clusters(cache: &mut BufferCache, layout: VolumeLayout, zero_fill: bool) -> Result<()> {
    let dzone_start = 1 + layout.itable_size;
    for n in 1..layout.dzone_total {
        let header = ClusterHeader {
            prev: (n > 1).then_some(ClusterNumber(n - 1)),
            next: (n + 1 < layout.dzone_total).then_some(ClusterNumber(n + 1)),
            stat: None,
        };
        let cluster = ClusterNumber(n);
        if zero_fill {
            cache.put_cluster(cluster, &DataCluster::zeroed(header))?;
        } else {
            // Fast format: only the block carrying the header is written;
            // the rest of the cluster keeps whatever the device held.
            let encoded = DataCluster::zeroed(header).encode();
            cache.write_block(cluster.to_block(dzone_start), &encoded[..BLOCK_SIZE])?;
        }
    }
    Ok(())
}

fn self_check(cache: &mut BufferCache) -> Result<()> {
    cache.load_superblock()?;
    let root = cache.fetch_inode(InodeNumber::ROOT)?;
    let first = cache.fetch_cluster(ClusterNumber::ROOT_DIR)?;
    let sb = cache.superblock()?;
    check_superblock(sb)?;
    check_inode_in_use(InodeNumber::ROOT, &root, sb)?;
    check_dir_head(InodeNumber::ROOT, &root, &first)?;
    if root.refcount < 2 || root.direct[0] != Some(ClusterNumber::ROOT_DIR) {
        return Err(SofsError::InconsistentInodeInUse(InodeNumber::ROOT));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sofs_block::MemDevice;

    fn format_mem(blocks: usize, opts: &FormatOptions) -> (BufferCache, VolumeLayout) {
        let mut cache = BufferCache::new(Box::new(MemDevice::zeroed(blocks * BLOCK_SIZE))).unwrap();
        let layout = format_device(&mut cache, opts).unwrap();
        (cache, layout)
    }

    #[test]
    fn layout_solution_matches_reference() {
        // 100 blocks, 56 inodes: 7 table blocks, 23 clusters.
        let layout = solve_layout(100, 56).unwrap();
        assert_eq!(
            layout,
            VolumeLayout {
                ntotal: 100,
                itable_size: 7,
                itotal: 56,
                dzone_total: 23
            }
        );
        assert_eq!(100, 1 + layout.itable_size + layout.dzone_total * 4);
    }

    #[test]
    fn layout_default_inode_count() {
        // Default: one inode per eight blocks, then adjusted upward to
        // absorb remainder blocks.
        let layout = solve_layout(1000, 0).unwrap();
        assert_eq!(
            layout.ntotal,
            1 + layout.itable_size + layout.dzone_total * 4
        );
        assert_eq!(layout.itotal, layout.itable_size * IPB);
    }

    #[test]
    fn layout_rejects_tiny_devices() {
        assert!(solve_layout(2, 0).is_err());
        assert!(solve_layout(5, 8).is_err());
    }

    #[test]
    fn formatted_volume_passes_predicates() {
        let opts = FormatOptions {
            volume_name: "fresh".to_owned(),
            inode_count: Some(56),
            zero_fill: true,
            owner: Credentials::new(1000, 1000),
        };
        let (mut cache, layout) = format_mem(100, &opts);

        cache.load_superblock().unwrap();
        let sb = cache.superblock().unwrap().clone();
        assert_eq!(sb.magic, MAGIC);
        assert_eq!(sb.name, "fresh");
        assert_eq!(sb.ifree, layout.itotal - 1);
        assert_eq!(sb.dzone_free, layout.dzone_total - 1);
        assert!(sb.properly_unmounted());
        check_superblock(&sb).unwrap();
    }

    #[test]
    fn root_directory_shape() {
        let (mut cache, _) = format_mem(100, &FormatOptions::default());
        cache.load_superblock().unwrap();

        let root = cache.fetch_inode(InodeNumber::ROOT).unwrap();
        assert!(root.is_directory());
        assert_eq!(root.refcount, 2);
        assert_eq!(root.clucount, 1);
        assert_eq!(root.size, DPC * DIR_ENTRY_SIZE as u32);
        assert_eq!(root.direct[0], Some(ClusterNumber::ROOT_DIR));

        let first = cache.fetch_cluster(ClusterNumber::ROOT_DIR).unwrap();
        assert_eq!(first.header.stat, Some(InodeNumber::ROOT));
        assert!(first.dir_entry(0).matches("."));
        assert_eq!(first.dir_entry(0).inode, Some(InodeNumber::ROOT));
        assert!(first.dir_entry(1).matches(".."));
        assert_eq!(first.dir_entry(1).inode, Some(InodeNumber::ROOT));
        for slot in 2..DPC {
            assert!(first.dir_entry(slot).is_free_clean());
        }
    }

    #[test]
    fn inode_free_list_is_doubly_linked() {
        let (mut cache, layout) = format_mem(100, &FormatOptions::default());
        cache.load_superblock().unwrap();
        let sb = cache.superblock().unwrap().clone();

        assert_eq!(sb.ihead, Some(InodeNumber(1)));
        assert_eq!(sb.itail, Some(InodeNumber(layout.itotal - 1)));

        let mut walked = 0_u32;
        let mut prev: Option<InodeNumber> = None;
        let mut cursor = sb.ihead;
        while let Some(n) = cursor {
            let inode = cache.fetch_inode(n).unwrap();
            assert!(inode.is_free_clean(), "inode {n} not free clean");
            let (next, stored_prev) = inode.aux.free_link().unwrap();
            assert_eq!(stored_prev, prev, "prev mismatch at inode {n}");
            prev = Some(n);
            cursor = next;
            walked += 1;
            assert!(walked <= layout.itotal, "free list loops");
        }
        assert_eq!(walked, sb.ifree);
        assert_eq!(prev, sb.itail);
    }

    #[test]
    fn general_free_list_is_doubly_linked() {
        let (mut cache, layout) = format_mem(100, &FormatOptions::default());
        cache.load_superblock().unwrap();
        let sb = cache.superblock().unwrap().clone();

        assert_eq!(sb.dhead, Some(ClusterNumber(1)));
        assert_eq!(sb.dtail, Some(ClusterNumber(layout.dzone_total - 1)));

        let mut walked = 0_u32;
        let mut prev: Option<ClusterNumber> = None;
        let mut cursor = sb.dhead;
        while let Some(c) = cursor {
            let cluster = cache.fetch_cluster(c).unwrap();
            assert_eq!(cluster.header.stat, None, "cluster {c} not clean");
            assert_eq!(cluster.header.prev, prev, "prev mismatch at cluster {c}");
            prev = Some(c);
            cursor = cluster.header.next;
            walked += 1;
            assert!(walked <= layout.dzone_total, "free list loops");
        }
        assert_eq!(walked, sb.dzone_free);
        assert_eq!(prev, sb.dtail);
    }

    #[test]
    fn format_on_file_backing() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(100 * BLOCK_SIZE as u64).unwrap();

        let layout = format(tmp.path(), &FormatOptions::default()).unwrap();
        assert_eq!(layout.ntotal, 100);

        let mut cache = BufferCache::open(tmp.path()).unwrap();
        cache.load_superblock().unwrap();
        check_superblock(cache.superblock().unwrap()).unwrap();
    }
}
