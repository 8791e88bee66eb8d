#![forbid(unsafe_code)]
//! Layer 3: the file-cluster mapper.
//!
//! A file's logical cluster index maps to a physical cluster through a
//! three-tier reference tree: seven direct references in the inode, one
//! single-indirect reference cluster, and one double-indirect cluster of
//! reference clusters. Every intermediate reference cluster is itself
//! allocated to the owning inode and counted in `clucount`.
//!
//! Releasing clusters comes in three flavours. FREE returns the terminal
//! cluster to the free store but leaves the reference tree intact, so a
//! freed file stays reconstructible until its inode is cleaned. FREE_CLEAN
//! additionally scrubs the terminal, nulls the tree entry and cascades:
//! a reference cluster whose entries are all null is freed too, one
//! `clucount` decrement per freed cluster. CLEAN does what FREE_CLEAN does
//! minus the freeing of the terminal, and operates on a free-dirty inode.

use sofs_alloc::{alloc_data_cluster, clean_data_cluster, free_data_cluster};
use sofs_block::BufferCache;
use sofs_error::{Result, SofsError};
use sofs_inode::{read_inode, write_inode, InodeStatus};
use sofs_ondisk::Inode;
use sofs_types::{
    ref_zone, ClusterNumber, CodecError, InodeNumber, RefZone, BSLPC, MAX_FILE_CLUSTERS, MAX_PATH,
    N_DIRECT, RPC,
};
use tracing::trace;

/// Release flavour for `handle_file_cluster` / `handle_file_clusters`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOp {
    /// Free the terminal cluster, leaving the reference tree untouched.
    Free,
    /// Free and scrub the terminal, null the tree entry, cascade.
    FreeClean,
    /// Scrub an already-freed terminal and dismantle the tree entry;
    /// the owning inode is free-dirty.
    Clean,
}

impl ReleaseOp {
    fn inode_status(self) -> InodeStatus {
        match self {
            Self::Clean => InodeStatus::FreeDirty,
            Self::Free | Self::FreeClean => InodeStatus::InUse,
        }
    }

    /// Whether this flavour nulls tree entries and cascades.
    fn dismantles(self) -> bool {
        !matches!(self, Self::Free)
    }
}

fn check_index(index: u32) -> Result<()> {
    if index >= MAX_FILE_CLUSTERS {
        return Err(SofsError::InvalidClusterIndex(index));
    }
    Ok(())
}

// ── GET ─────────────────────────────────────────────────────────────────────

/// Logical cluster number stored at file-cluster index `index`, or `None`
/// if nothing was ever allocated there.
pub fn get_file_cluster(
    cache: &mut BufferCache,
    n: InodeNumber,
    index: u32,
) -> Result<Option<ClusterNumber>> {
    check_index(index)?;
    let inode = read_inode(cache, n, InodeStatus::InUse)?;
    get_from_inode(cache, &inode, index)
}

fn get_from_inode(
    cache: &BufferCache,
    inode: &Inode,
    index: u32,
) -> Result<Option<ClusterNumber>> {
    match ref_zone(index).ok_or(SofsError::InvalidClusterIndex(index))? {
        RefZone::Direct { slot } => Ok(inode.direct[slot]),
        RefZone::Single { slot } => {
            let Some(i1) = inode.i1 else { return Ok(None) };
            Ok(cache.fetch_cluster(i1)?.ref_at(slot))
        }
        RefZone::Double { outer, inner } => {
            let Some(i2) = inode.i2 else { return Ok(None) };
            let Some(mid) = cache.fetch_cluster(i2)?.ref_at(outer) else {
                return Ok(None);
            };
            Ok(cache.fetch_cluster(mid)?.ref_at(inner))
        }
    }
}

// ── ALLOC ───────────────────────────────────────────────────────────────────

/// Materialise the cluster at file-cluster index `index`, creating any
/// intermediate reference clusters on the way.
pub fn alloc_file_cluster(
    cache: &mut BufferCache,
    n: InodeNumber,
    index: u32,
) -> Result<ClusterNumber> {
    check_index(index)?;
    let mut inode = read_inode(cache, n, InodeStatus::InUse)?;

    let allocated = match ref_zone(index).ok_or(SofsError::InvalidClusterIndex(index))? {
        RefZone::Direct { slot } => {
            if inode.direct[slot].is_some() {
                return Err(SofsError::AlreadyAllocated);
            }
            let terminal = alloc_data_cluster(cache, n)?;
            inode.direct[slot] = Some(terminal);
            inode.clucount += 1;
            terminal
        }
        RefZone::Single { slot } => {
            let i1 = materialise_ref_cluster(cache, n, &mut inode.i1, &mut inode.clucount)?;
            insert_terminal(cache, n, i1, slot, &mut inode.clucount)?
        }
        RefZone::Double { outer, inner } => {
            let i2 = materialise_ref_cluster(cache, n, &mut inode.i2, &mut inode.clucount)?;

            let mut mid_ref = cache.fetch_cluster(i2)?.ref_at(outer);
            if mid_ref.is_none() {
                let mid = alloc_blank_ref_cluster(cache, n)?;
                let mut i2_value = cache.fetch_cluster(i2)?;
                i2_value.set_ref(outer, Some(mid));
                cache.put_cluster(i2, &i2_value)?;
                inode.clucount += 1;
                mid_ref = Some(mid);
            }
            let mid = mid_ref.ok_or(SofsError::InconsistentRefList(n))?;
            insert_terminal(cache, n, mid, inner, &mut inode.clucount)?
        }
    };

    write_inode(cache, n, &mut inode, InodeStatus::InUse)?;
    trace!(
        target: "sofs::file",
        inode = n.0,
        index,
        cluster = allocated.0,
        "file cluster allocated"
    );
    Ok(allocated)
}

/// Allocate a cluster and initialise its payload as an all-null reference
/// array.
fn alloc_blank_ref_cluster(cache: &mut BufferCache, n: InodeNumber) -> Result<ClusterNumber> {
    let cluster = alloc_data_cluster(cache, n)?;
    let mut value = cache.fetch_cluster(cluster)?;
    for slot in 0..RPC {
        value.set_ref(slot, None);
    }
    cache.put_cluster(cluster, &value)?;
    Ok(cluster)
}

/// Ensure a single/double-indirect root exists, creating it when absent.
fn materialise_ref_cluster(
    cache: &mut BufferCache,
    n: InodeNumber,
    root: &mut Option<ClusterNumber>,
    clucount: &mut u32,
) -> Result<ClusterNumber> {
    if let Some(existing) = *root {
        return Ok(existing);
    }
    let created = alloc_blank_ref_cluster(cache, n)?;
    *root = Some(created);
    *clucount += 1;
    Ok(created)
}

/// Allocate the terminal cluster and link it into reference cluster
/// `holder` at `slot`; the link is written before the inode is.
fn insert_terminal(
    cache: &mut BufferCache,
    n: InodeNumber,
    holder: ClusterNumber,
    slot: u32,
    clucount: &mut u32,
) -> Result<ClusterNumber> {
    let holder_block = cache.superblock()?.cluster_block(holder);
    cache.load_direct_ref_cluster(holder_block)?;
    if cache.direct_ref_cluster()?.ref_at(slot).is_some() {
        return Err(SofsError::AlreadyAllocated);
    }
    let terminal = alloc_data_cluster(cache, n)?;
    cache.direct_ref_cluster_mut()?.set_ref(slot, Some(terminal));
    cache.store_direct_ref_cluster()?;
    *clucount += 1;
    Ok(terminal)
}

// ── FREE / FREE_CLEAN / CLEAN ───────────────────────────────────────────────

/// Apply a release flavour to the cluster at file-cluster index `index`.
pub fn handle_file_cluster(
    cache: &mut BufferCache,
    n: InodeNumber,
    index: u32,
    op: ReleaseOp,
) -> Result<()> {
    check_index(index)?;
    let mut inode = read_inode(cache, n, op.inode_status())?;
    release_at(cache, n, &mut inode, index, op)?;
    write_inode(cache, n, &mut inode, op.inode_status())
}

fn release_at(
    cache: &mut BufferCache,
    n: InodeNumber,
    inode: &mut Inode,
    index: u32,
    op: ReleaseOp,
) -> Result<()> {
    match ref_zone(index).ok_or(SofsError::InvalidClusterIndex(index))? {
        RefZone::Direct { slot } => {
            let terminal = inode.direct[slot].ok_or(SofsError::RefNotOnList)?;
            release_terminal(cache, n, terminal, op)?;
            if op.dismantles() {
                inode.direct[slot] = None;
                inode.clucount = inode.clucount.saturating_sub(1);
            }
        }
        RefZone::Single { slot } => {
            let i1 = inode.i1.ok_or(SofsError::RefNotOnList)?;
            release_in_ref_cluster(cache, n, i1, slot, op, &mut inode.clucount)?;
            if op.dismantles() && ref_cluster_is_empty(cache, i1)? {
                free_data_cluster(cache, i1)?;
                inode.i1 = None;
                inode.clucount = inode.clucount.saturating_sub(1);
            }
        }
        RefZone::Double { outer, inner } => {
            let i2 = inode.i2.ok_or(SofsError::RefNotOnList)?;
            let i2_block = cache.superblock()?.cluster_block(i2);
            cache.load_single_ind_cluster(i2_block)?;
            let mid = cache
                .single_ind_cluster()?
                .ref_at(outer)
                .ok_or(SofsError::RefNotOnList)?;

            release_in_ref_cluster(cache, n, mid, inner, op, &mut inode.clucount)?;
            if op.dismantles() && ref_cluster_is_empty(cache, mid)? {
                free_data_cluster(cache, mid)?;
                cache.single_ind_cluster_mut()?.set_ref(outer, None);
                cache.store_single_ind_cluster()?;
                inode.clucount = inode.clucount.saturating_sub(1);

                if ref_cluster_is_empty(cache, i2)? {
                    free_data_cluster(cache, i2)?;
                    inode.i2 = None;
                    inode.clucount = inode.clucount.saturating_sub(1);
                }
            }
        }
    }
    Ok(())
}

/// Release the terminal referenced at `slot` of reference cluster `holder`,
/// nulling the entry for the dismantling flavours.
fn release_in_ref_cluster(
    cache: &mut BufferCache,
    n: InodeNumber,
    holder: ClusterNumber,
    slot: u32,
    op: ReleaseOp,
    clucount: &mut u32,
) -> Result<()> {
    let holder_block = cache.superblock()?.cluster_block(holder);
    cache.load_direct_ref_cluster(holder_block)?;
    let terminal = cache
        .direct_ref_cluster()?
        .ref_at(slot)
        .ok_or(SofsError::RefNotOnList)?;

    release_terminal(cache, n, terminal, op)?;
    if op.dismantles() {
        // The slot load survives release_terminal: the terminal and the
        // free-store bookkeeping never alias an allocated reference cluster.
        cache.direct_ref_cluster_mut()?.set_ref(slot, None);
        cache.store_direct_ref_cluster()?;
        *clucount = clucount.saturating_sub(1);
    }
    Ok(())
}

fn release_terminal(
    cache: &mut BufferCache,
    n: InodeNumber,
    terminal: ClusterNumber,
    op: ReleaseOp,
) -> Result<()> {
    match op {
        ReleaseOp::Free => free_data_cluster(cache, terminal),
        ReleaseOp::FreeClean => {
            free_data_cluster(cache, terminal)?;
            clean_data_cluster(cache, n, terminal)
        }
        ReleaseOp::Clean => clean_data_cluster(cache, n, terminal),
    }
}

fn ref_cluster_is_empty(cache: &BufferCache, cluster: ClusterNumber) -> Result<bool> {
    Ok(cache.fetch_cluster(cluster)?.refs_all_null())
}

// ── Bulk range variant ──────────────────────────────────────────────────────

/// Apply a release flavour to every populated file-cluster index from the
/// top of the file down to `start_index`.
///
/// The double-indirect zone is walked first, from the highest index
/// downward, then the single-indirect zone, then the direct zone. Working
/// top-down within a zone means a reference cluster empties exactly when
/// its last populated entry is released, so each cascade fires once.
pub fn handle_file_clusters(
    cache: &mut BufferCache,
    n: InodeNumber,
    start_index: u32,
    op: ReleaseOp,
) -> Result<()> {
    check_index(start_index)?;
    let double_base = N_DIRECT as u32 + RPC;

    // Double-indirect zone.
    let inode = read_inode(cache, n, op.inode_status())?;
    if let Some(i2) = inode.i2 {
        let outer_floor = start_index.saturating_sub(double_base) / RPC;
        for outer in (outer_floor..RPC).rev() {
            let Some(mid) = cache.fetch_cluster(i2)?.ref_at(outer) else {
                continue;
            };
            let snapshot = cache.fetch_cluster(mid)?;
            for inner in (0..RPC).rev() {
                let index = double_base + outer * RPC + inner;
                if index < start_index {
                    break;
                }
                if snapshot.ref_at(inner).is_some() {
                    handle_file_cluster(cache, n, index, op)?;
                }
            }
            // The cascade may have freed the whole double-indirect tree.
            if read_inode(cache, n, op.inode_status())?.i2.is_none() {
                break;
            }
        }
    }

    // Single-indirect zone.
    let inode = read_inode(cache, n, op.inode_status())?;
    if let Some(i1) = inode.i1 {
        if start_index < double_base {
            let snapshot = cache.fetch_cluster(i1)?;
            for slot in (0..RPC).rev() {
                let index = N_DIRECT as u32 + slot;
                if index < start_index {
                    break;
                }
                if snapshot.ref_at(slot).is_some() {
                    handle_file_cluster(cache, n, index, op)?;
                }
            }
        }
    }

    // Direct zone.
    let inode = read_inode(cache, n, op.inode_status())?;
    for slot in (0..N_DIRECT).rev() {
        let index = slot as u32;
        if index < start_index {
            break;
        }
        if inode.direct[slot].is_some() {
            handle_file_cluster(cache, n, index, op)?;
        }
    }
    Ok(())
}

// ── Whole-cluster file I/O ──────────────────────────────────────────────────

/// Read the payload of the cluster at file-cluster index `index`; a hole
/// reads as zeros.
pub fn read_file_cluster(cache: &mut BufferCache, n: InodeNumber, index: u32) -> Result<Vec<u8>> {
    match get_file_cluster(cache, n, index)? {
        Some(cluster) => Ok(cache.fetch_cluster(cluster)?.payload().to_vec()),
        None => Ok(vec![0_u8; BSLPC]),
    }
}

/// Write `data` at the start of the cluster at file-cluster index `index`,
/// allocating it first when absent. Bytes past `data` keep their previous
/// content.
pub fn write_file_cluster(
    cache: &mut BufferCache,
    n: InodeNumber,
    index: u32,
    data: &[u8],
) -> Result<()> {
    if data.len() > BSLPC {
        return Err(SofsError::Codec(CodecError::InvalidField {
            field: "payload",
            reason: "longer than one cluster",
        }));
    }
    let cluster = match get_file_cluster(cache, n, index)? {
        Some(cluster) => cluster,
        None => alloc_file_cluster(cache, n, index)?,
    };
    let mut value = cache.fetch_cluster(cluster)?;
    value.payload_mut()[..data.len()].copy_from_slice(data);
    cache.put_cluster(cluster, &value)
}

// ── Symlink payload ─────────────────────────────────────────────────────────

/// Store a symbolic link's target path in its first cluster and set the
/// inode size to the path length.
pub fn write_symlink_target(cache: &mut BufferCache, n: InodeNumber, target: &str) -> Result<()> {
    {
        let inode = read_inode(cache, n, InodeStatus::InUse)?;
        if !inode.is_symlink() {
            return Err(SofsError::WrongType);
        }
    }
    let bytes = target.as_bytes();
    if bytes.len() > MAX_PATH || bytes.len() + 1 > BSLPC {
        return Err(SofsError::NameTooLong);
    }
    let mut payload = vec![0_u8; bytes.len() + 1];
    payload[..bytes.len()].copy_from_slice(bytes);
    write_file_cluster(cache, n, 0, &payload)?;

    // Re-read: the allocation above may have touched the reference tree.
    let mut inode = read_inode(cache, n, InodeStatus::InUse)?;
    inode.size = bytes.len() as u32;
    write_inode(cache, n, &mut inode, InodeStatus::InUse)
}

/// Fetch a symbolic link's target path.
pub fn read_symlink_target(cache: &mut BufferCache, n: InodeNumber) -> Result<String> {
    let inode = read_inode(cache, n, InodeStatus::InUse)?;
    if !inode.is_symlink() {
        return Err(SofsError::WrongType);
    }
    let payload = read_file_cluster(cache, n, 0)?;
    Ok(sofs_types::trim_nul_padded(&payload))
}
