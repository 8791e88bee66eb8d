//! Inode allocation over the double-linked free list rooted in the
//! superblock. Allocation pops the head; freeing appends at the tail and
//! leaves the record dirty; cleaning is deferred until reuse.

use crate::cluster_alloc::free_data_cluster;
use sofs_block::BufferCache;
use sofs_error::{Result, SofsError};
use sofs_ondisk::{check_inode_free_dirty, FileKind, Inode, InodeAux, Mode};
use sofs_types::{unix_timestamp, Credentials, InodeNumber, N_DIRECT, RPC};
use tracing::trace;

/// Allocate a free inode of the given type.
///
/// The popped inode is cleaned first when dirty, then initialised: type bit
/// set with all permission bits reset, owner and group taken from the
/// caller, counters zeroed, timestamps stamped to now.
pub fn alloc_inode(
    cache: &mut BufferCache,
    kind: FileKind,
    cred: Credentials,
) -> Result<InodeNumber> {
    if cache.superblock()?.ifree == 0 {
        return Err(SofsError::NoFreeInodes);
    }
    let head = cache
        .superblock()?
        .ihead
        .ok_or(SofsError::InvalidSuperblock("free-inode list empty with nonzero count"))?;

    let head_inode = cache.fetch_inode(head)?;
    {
        let sb = cache.superblock()?;
        check_inode_free_dirty(head, &head_inode, sb)?;
    }
    let Some((next, _)) = head_inode.aux.free_link() else {
        return Err(SofsError::InconsistentFreeDirtyInode(head));
    };

    // Detach the head.
    {
        let sb = cache.superblock_mut()?;
        sb.ihead = next;
        if next.is_none() {
            sb.itail = None;
        }
        sb.ifree -= 1;
    }
    if let Some(next) = next {
        let mut next_inode = cache.fetch_inode(next)?;
        match &mut next_inode.aux {
            InodeAux::FreeLink { prev, .. } => *prev = None,
            InodeAux::Stamps { .. } => {
                return Err(SofsError::InconsistentFreeDirtyInode(next));
            }
        }
        cache.put_inode(next, &next_inode)?;
    }

    if head_inode.is_free_dirty() {
        clean_inode(cache, head)?;
    }

    let fresh = Inode::new_in_use(kind, 0, cred.uid, cred.gid, unix_timestamp());
    cache.put_inode(head, &fresh)?;
    cache.store_superblock()?;
    trace!(target: "sofs::alloc", inode = head.0, "inode allocated");
    Ok(head)
}

/// Free an in-use inode, appending it to the tail of the free list.
///
/// The record is left dirty: only the free mode bit and the list linkage
/// change, everything else keeps its stale content.
pub fn free_inode(cache: &mut BufferCache, inode: InodeNumber) -> Result<()> {
    if inode == InodeNumber::ROOT {
        return Err(SofsError::InvalidInode(inode.0));
    }
    let mut value = cache.fetch_inode(inode)?;
    if value.is_free() {
        return Err(SofsError::InodeNotAllocated(inode));
    }
    if value.refcount != 0 {
        return Err(SofsError::RefsOutstanding(inode, value.refcount));
    }

    let old_tail = cache.superblock()?.itail;
    value.mode.free = true;
    value.aux = InodeAux::FreeLink {
        next: None,
        prev: old_tail,
    };

    if let Some(tail) = old_tail {
        let mut tail_inode = cache.fetch_inode(tail)?;
        match &mut tail_inode.aux {
            InodeAux::FreeLink { next, .. } => *next = Some(inode),
            InodeAux::Stamps { .. } => {
                return Err(SofsError::InconsistentFreeDirtyInode(tail));
            }
        }
        cache.put_inode(tail, &tail_inode)?;
    } else {
        cache.superblock_mut()?.ihead = Some(inode);
    }
    cache.put_inode(inode, &value)?;

    {
        let sb = cache.superblock_mut()?;
        sb.itail = Some(inode);
        sb.ifree += 1;
    }
    cache.store_superblock()?;
    trace!(target: "sofs::alloc", inode = inode.0, "inode freed");
    Ok(())
}

/// Clean a free-dirty inode in place.
///
/// The stale reference tree is dismantled: the arrays inside the single-
/// and double-indirect reference clusters are nulled and the reference
/// clusters themselves returned to the free store (their terminal clusters
/// were already freed when the file was unlinked). The direct references
/// and counters are zeroed and the stale type/permission bits cleared; the
/// free-list linkage is preserved. A no-op on an already clean inode.
pub fn clean_inode(cache: &mut BufferCache, inode: InodeNumber) -> Result<()> {
    if inode == InodeNumber::ROOT {
        return Err(SofsError::InvalidInode(inode.0));
    }
    let mut value = cache.fetch_inode(inode)?;
    if !value.is_free() {
        return Err(SofsError::InconsistentFreeDirtyInode(inode));
    }
    if value.is_free_clean() {
        return Ok(());
    }

    // Double-indirect tree: drain the inner reference clusters, then the
    // outer one.
    if let Some(i2) = value.i2 {
        let i2_block = {
            let sb = cache.superblock()?;
            if !sb.cluster_in_range(i2) {
                return Err(SofsError::InconsistentRefList(inode));
            }
            sb.cluster_block(i2)
        };
        cache.load_single_ind_cluster(i2_block)?;
        for outer in 0..RPC {
            let Some(inner) = cache.single_ind_cluster()?.ref_at(outer) else {
                continue;
            };
            let inner_block = {
                let sb = cache.superblock()?;
                if !sb.cluster_in_range(inner) {
                    return Err(SofsError::InconsistentRefList(inode));
                }
                sb.cluster_block(inner)
            };
            cache.load_direct_ref_cluster(inner_block)?;
            {
                let refs = cache.direct_ref_cluster_mut()?;
                for slot in 0..RPC {
                    refs.set_ref(slot, None);
                }
            }
            cache.store_direct_ref_cluster()?;
            free_data_cluster(cache, inner)?;
            cache.single_ind_cluster_mut()?.set_ref(outer, None);
        }
        cache.store_single_ind_cluster()?;
        free_data_cluster(cache, i2)?;
        value.i2 = None;
    }

    // Single-indirect reference cluster.
    if let Some(i1) = value.i1 {
        let i1_block = {
            let sb = cache.superblock()?;
            if !sb.cluster_in_range(i1) {
                return Err(SofsError::InconsistentRefList(inode));
            }
            sb.cluster_block(i1)
        };
        cache.load_direct_ref_cluster(i1_block)?;
        {
            let refs = cache.direct_ref_cluster_mut()?;
            for slot in 0..RPC {
                refs.set_ref(slot, None);
            }
        }
        cache.store_direct_ref_cluster()?;
        free_data_cluster(cache, i1)?;
        value.i1 = None;
    }

    value.direct = [None; N_DIRECT];
    value.refcount = 0;
    value.size = 0;
    value.clucount = 0;
    value.mode = Mode {
        free: true,
        kind: None,
        perms: 0,
    };
    cache.put_inode(inode, &value)?;
    trace!(target: "sofs::alloc", inode = inode.0, "inode cleaned");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_alloc::alloc_data_cluster;
    use sofs_block::MemDevice;
    use sofs_mkfs::{format_device, FormatOptions};
    use sofs_types::BLOCK_SIZE;

    fn fresh_volume(blocks: usize) -> BufferCache {
        let mut cache =
            BufferCache::new(Box::new(MemDevice::zeroed(blocks * BLOCK_SIZE))).unwrap();
        format_device(&mut cache, &FormatOptions::default()).unwrap();
        cache.load_superblock().unwrap();
        cache
    }

    #[test]
    fn allocate_pops_head_and_initialises() {
        let mut cache = fresh_volume(100);
        let before = cache.superblock().unwrap().ifree;

        let ino = alloc_inode(&mut cache, FileKind::Regular, Credentials::new(7, 8)).unwrap();
        assert_eq!(ino, InodeNumber(1));

        let value = cache.fetch_inode(ino).unwrap();
        assert!(value.is_in_use());
        assert_eq!(value.kind(), Some(FileKind::Regular));
        assert_eq!(value.mode.perms, 0);
        assert_eq!(value.owner, 7);
        assert_eq!(value.group, 8);
        assert_eq!(value.refcount, 0);
        assert_eq!((value.size, value.clucount), (0, 0));

        let sb = cache.superblock().unwrap();
        assert_eq!(sb.ifree, before - 1);
        assert_eq!(sb.ihead, Some(InodeNumber(2)));
        // The new head has no predecessor.
        let new_head = cache.fetch_inode(InodeNumber(2)).unwrap();
        assert_eq!(new_head.aux.free_link(), Some((Some(InodeNumber(3)), None)));
    }

    #[test]
    fn free_appends_at_tail_and_leaves_dirty() {
        let mut cache = fresh_volume(100);
        let ino = alloc_inode(&mut cache, FileKind::Regular, Credentials::ROOT).unwrap();
        let before = cache.superblock().unwrap().ifree;
        let old_tail = cache.superblock().unwrap().itail.unwrap();

        free_inode(&mut cache, ino).unwrap();

        let sb = cache.superblock().unwrap();
        assert_eq!(sb.ifree, before + 1);
        assert_eq!(sb.itail, Some(ino));

        let value = cache.fetch_inode(ino).unwrap();
        assert!(value.is_free_dirty());
        // Stale type bits survive; linkage points back at the old tail.
        assert_eq!(value.kind(), Some(FileKind::Regular));
        assert_eq!(value.aux.free_link(), Some((None, Some(old_tail))));

        let tail_inode = cache.fetch_inode(old_tail).unwrap();
        assert_eq!(tail_inode.aux.free_link().unwrap().0, Some(ino));
    }

    #[test]
    fn free_guards() {
        let mut cache = fresh_volume(100);
        assert!(matches!(
            free_inode(&mut cache, InodeNumber::ROOT),
            Err(SofsError::InvalidInode(0))
        ));
        assert!(matches!(
            free_inode(&mut cache, InodeNumber(9999)),
            Err(SofsError::InvalidInode(_))
        ));
        // Inode 4 is already free.
        assert!(matches!(
            free_inode(&mut cache, InodeNumber(4)),
            Err(SofsError::InodeNotAllocated(_))
        ));

        let ino = alloc_inode(&mut cache, FileKind::Regular, Credentials::ROOT).unwrap();
        let mut value = cache.fetch_inode(ino).unwrap();
        value.refcount = 2;
        cache.put_inode(ino, &value).unwrap();
        assert!(matches!(
            free_inode(&mut cache, ino),
            Err(SofsError::RefsOutstanding(_, 2))
        ));
    }

    #[test]
    fn allocate_free_round_trip_restores_count() {
        let mut cache = fresh_volume(100);
        let before = cache.superblock().unwrap().ifree;
        let ino = alloc_inode(&mut cache, FileKind::Symlink, Credentials::ROOT).unwrap();
        free_inode(&mut cache, ino).unwrap();
        assert_eq!(cache.superblock().unwrap().ifree, before);
    }

    #[test]
    fn dirty_inode_is_cleaned_before_reuse() {
        let mut cache = fresh_volume(100);
        let ino = alloc_inode(&mut cache, FileKind::Regular, Credentials::ROOT).unwrap();

        // Give the inode stale direct references, then unlink-style free the
        // clusters and the inode.
        let c1 = alloc_data_cluster(&mut cache, ino).unwrap();
        let c2 = alloc_data_cluster(&mut cache, ino).unwrap();
        let mut value = cache.fetch_inode(ino).unwrap();
        value.direct[0] = Some(c1);
        value.direct[1] = Some(c2);
        value.clucount = 2;
        value.size = 100;
        cache.put_inode(ino, &value).unwrap();

        crate::free_data_cluster(&mut cache, c1).unwrap();
        crate::free_data_cluster(&mut cache, c2).unwrap();
        let mut value = cache.fetch_inode(ino).unwrap();
        value.refcount = 0;
        cache.put_inode(ino, &value).unwrap();
        free_inode(&mut cache, ino).unwrap();
        assert!(cache.fetch_inode(ino).unwrap().is_free_dirty());

        // Drain the free list until the dirty inode is popped again; the
        // allocator must hand it out clean.
        let mut reused = None;
        let ifree = cache.superblock().unwrap().ifree;
        for _ in 0..ifree {
            let n = alloc_inode(&mut cache, FileKind::Regular, Credentials::ROOT).unwrap();
            if n == ino {
                reused = Some(n);
                break;
            }
        }
        let reused = reused.expect("dirty inode never reused");
        let value = cache.fetch_inode(reused).unwrap();
        assert!(value.is_in_use());
        assert_eq!(value.direct, [None; N_DIRECT]);
        assert_eq!((value.size, value.clucount, value.refcount), (0, 0, 0));
    }

    #[test]
    fn clean_frees_stale_reference_clusters() {
        let mut cache = fresh_volume(100);
        let ino = alloc_inode(&mut cache, FileKind::Regular, Credentials::ROOT).unwrap();

        // Hand the inode a single-indirect reference cluster, then free the
        // inode without dismantling the tree.
        let i1 = alloc_data_cluster(&mut cache, ino).unwrap();
        let mut refs = cache.fetch_cluster(i1).unwrap();
        for slot in 0..RPC {
            refs.set_ref(slot, None);
        }
        cache.put_cluster(i1, &refs).unwrap();
        let mut value = cache.fetch_inode(ino).unwrap();
        value.i1 = Some(i1);
        value.clucount = 1;
        cache.put_inode(ino, &value).unwrap();
        free_inode(&mut cache, ino).unwrap();

        let free_before = cache.superblock().unwrap().dzone_free;
        clean_inode(&mut cache, ino).unwrap();

        let value = cache.fetch_inode(ino).unwrap();
        assert!(value.is_free_clean());
        // The reference cluster went back to the free store.
        assert_eq!(cache.superblock().unwrap().dzone_free, free_before + 1);
        // Linkage survives cleaning: the inode is still on the free list.
        assert_eq!(cache.superblock().unwrap().itail, Some(ino));
    }

    #[test]
    fn clean_rejects_in_use_and_root() {
        let mut cache = fresh_volume(100);
        assert!(matches!(
            clean_inode(&mut cache, InodeNumber::ROOT),
            Err(SofsError::InvalidInode(0))
        ));
        let ino = alloc_inode(&mut cache, FileKind::Regular, Credentials::ROOT).unwrap();
        assert!(matches!(
            clean_inode(&mut cache, ino),
            Err(SofsError::InconsistentFreeDirtyInode(_))
        ));
        // Cleaning an already clean inode is a no-op.
        clean_inode(&mut cache, InodeNumber(5)).unwrap();
    }

    #[test]
    fn exhaustion_reports_no_free_inodes() {
        let mut cache = fresh_volume(100);
        let ifree = cache.superblock().unwrap().ifree;
        for _ in 0..ifree {
            alloc_inode(&mut cache, FileKind::Regular, Credentials::ROOT).unwrap();
        }
        assert!(matches!(
            alloc_inode(&mut cache, FileKind::Regular, Credentials::ROOT),
            Err(SofsError::NoFreeInodes)
        ));
    }
}
