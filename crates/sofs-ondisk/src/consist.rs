//! Consistency predicates: pure, side-effect-free checks over already
//! loaded structures, invoked at the entry of every mutating operation and
//! by fsck. Each failure maps to a distinct error so diagnostics stay
//! specific. No predicate attempts repair.

use crate::cluster::{ClusterHeader, DataCluster};
use crate::inode::Inode;
use crate::superblock::{SuperBlock, MSTAT_CLEAN, MSTAT_DIRTY};
use sofs_error::{Result, SofsError};
use sofs_types::{
    InodeNumber, BSLPC, DIR_ENTRY_SIZE, DPC, DZONE_CACHE_SIZE, IPB, MAGIC, MAX_FILE_CLUSTERS,
    VERSION,
};

/// Expected state for a data-cluster header check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Allocated to some inode: no linkage, owner stamped.
    Allocated,
    /// Free and clean: all header words null.
    FreeClean,
    /// Free and dirty: possibly linked, owner stamp retained.
    FreeDirty,
}

/// Superblock internal consistency: identification, table arithmetic and
/// cache indices.
pub fn check_superblock(sb: &SuperBlock) -> Result<()> {
    if sb.magic != MAGIC {
        return Err(SofsError::InvalidSuperblock("bad magic number"));
    }
    if sb.version != VERSION {
        return Err(SofsError::InvalidSuperblock("bad version number"));
    }
    if sb.mstat != MSTAT_CLEAN && sb.mstat != MSTAT_DIRTY {
        return Err(SofsError::InvalidSuperblock("bad mount-status flag"));
    }
    if sb.itable_start != 1 {
        return Err(SofsError::InvalidSuperblock("inode table must start at block 1"));
    }
    if sb.itotal != sb.itable_size.wrapping_mul(IPB) {
        return Err(SofsError::InvalidSuperblock("inode count does not fill the table"));
    }
    if sb.dzone_start != 1 + sb.itable_size {
        return Err(SofsError::InvalidSuperblock("data zone does not follow the table"));
    }
    if !sb.layout_adds_up() {
        return Err(SofsError::InvalidSuperblock("block count does not match layout"));
    }
    if sb.ifree >= sb.itotal {
        // Inode 0 is always in use, so at least one inode is not free.
        return Err(SofsError::InvalidSuperblock("free-inode count out of range"));
    }
    if sb.dzone_free >= sb.dzone_total {
        // Cluster 0 always holds the root directory.
        return Err(SofsError::InvalidSuperblock("free-cluster count out of range"));
    }
    if (sb.ihead.is_none()) != (sb.ifree == 0) || (sb.itail.is_none()) != (sb.ifree == 0) {
        return Err(SofsError::InvalidSuperblock("inode free-list ends disagree with count"));
    }
    if sb.retrieval.idx as usize > DZONE_CACHE_SIZE {
        return Err(SofsError::InvalidSuperblock("retrieval-cache index out of range"));
    }
    if sb.insertion.idx as usize > DZONE_CACHE_SIZE {
        return Err(SofsError::InvalidSuperblock("insertion-cache index out of range"));
    }
    if sb.dhead.is_none() != sb.dtail.is_none() {
        return Err(SofsError::InvalidSuperblock("cluster free-list ends disagree"));
    }
    Ok(())
}

/// In-use inode consistency: type bit present, counters plausible, every
/// reference within the data zone.
pub fn check_inode_in_use(n: InodeNumber, inode: &Inode, sb: &SuperBlock) -> Result<()> {
    if !inode.is_in_use() || inode.kind().is_none() {
        return Err(SofsError::InconsistentInodeInUse(n));
    }
    if inode.clucount > MAX_FILE_CLUSTERS {
        return Err(SofsError::InconsistentInodeInUse(n));
    }
    let max_size = (MAX_FILE_CLUSTERS as u64).saturating_mul(BSLPC as u64);
    if u64::from(inode.size) > max_size {
        return Err(SofsError::InconsistentInodeInUse(n));
    }
    check_ref_list(n, inode, sb.dzone_total)
        .map_err(|_| SofsError::InconsistentInodeInUse(n))?;
    Ok(())
}

/// Free-clean inode consistency: nothing but the free bit and an in-range
/// free-list linkage.
pub fn check_inode_free_clean(n: InodeNumber, inode: &Inode, sb: &SuperBlock) -> Result<()> {
    if !inode.is_free_clean() {
        return Err(SofsError::InconsistentFreeCleanInode(n));
    }
    check_free_link_range(n, inode, sb)
        .map_err(|_| SofsError::InconsistentFreeCleanInode(n))
}

/// Free-dirty inode consistency: the free bit set and an in-range free-list
/// linkage; stale content is expected and not inspected.
pub fn check_inode_free_dirty(n: InodeNumber, inode: &Inode, sb: &SuperBlock) -> Result<()> {
    if !inode.is_free() {
        return Err(SofsError::InconsistentFreeDirtyInode(n));
    }
    check_free_link_range(n, inode, sb)
        .map_err(|_| SofsError::InconsistentFreeDirtyInode(n))
}

fn check_free_link_range(n: InodeNumber, inode: &Inode, sb: &SuperBlock) -> Result<()> {
    let Some((next, prev)) = inode.aux.free_link() else {
        return Err(SofsError::InconsistentFreeDirtyInode(n));
    };
    for link in [next, prev].into_iter().flatten() {
        if !sb.inode_in_range(link) {
            return Err(SofsError::InconsistentFreeDirtyInode(n));
        }
    }
    Ok(())
}

/// Every non-null reference field of the inode lies within the data zone.
pub fn check_ref_list(n: InodeNumber, inode: &Inode, dzone_total: u32) -> Result<()> {
    let refs = inode
        .direct
        .iter()
        .copied()
        .chain([inode.i1, inode.i2])
        .flatten();
    for cluster in refs {
        if cluster.0 >= dzone_total {
            return Err(SofsError::InconsistentRefList(n));
        }
    }
    Ok(())
}

/// Data-cluster header consistency for an expected state.
pub fn check_cluster_header(
    cluster: sofs_types::ClusterNumber,
    header: &ClusterHeader,
    expected: ClusterState,
    sb: &SuperBlock,
) -> Result<()> {
    for link in [header.prev, header.next].into_iter().flatten() {
        if !sb.cluster_in_range(link) {
            return Err(SofsError::InconsistentClusterHeader(cluster));
        }
    }
    if let Some(owner) = header.stat {
        if !sb.inode_in_range(owner) {
            return Err(SofsError::InconsistentClusterHeader(cluster));
        }
    }
    let shape_ok = match expected {
        ClusterState::Allocated => header.is_allocated(),
        ClusterState::FreeClean => header.is_free_clean(),
        // Dirty clusters range from freshly freed (no linkage, stale owner)
        // to fully linked list nodes; the range checks above are all that
        // can be asserted from the header alone.
        ClusterState::FreeDirty => !header.is_free_clean(),
    };
    if !shape_ok {
        return Err(SofsError::InconsistentClusterHeader(cluster));
    }
    Ok(())
}

/// Directory-content consistency over the directory inode and its first
/// cluster: the size is a whole number of entry clusters within bounds, and
/// slots 0/1 hold `.` (self) and `..`.
pub fn check_dir_head(n: InodeNumber, inode: &Inode, first: &DataCluster) -> Result<()> {
    if !inode.is_directory() {
        return Err(SofsError::NotDirectory);
    }
    let entry_cluster_bytes = DPC as u64 * DIR_ENTRY_SIZE as u64;
    let size = u64::from(inode.size);
    if size == 0 || size % entry_cluster_bytes != 0 {
        return Err(SofsError::MalformedDirectory(n));
    }
    if size > u64::from(MAX_FILE_CLUSTERS) * entry_cluster_bytes {
        return Err(SofsError::MalformedDirectory(n));
    }

    let dot = first.dir_entry(0);
    if !dot.matches(".") || dot.inode != Some(n) {
        return Err(SofsError::MalformedDirectory(n));
    }
    let dotdot = first.dir_entry(1);
    if !dotdot.matches("..") || dotdot.inode.is_none() {
        return Err(SofsError::MalformedDirectory(n));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::DirEntry;
    use crate::inode::FileKind;
    use crate::superblock::{InsertionCache, RetrievalCache};
    use sofs_types::ClusterNumber;

    fn sample_sb() -> SuperBlock {
        SuperBlock {
            magic: MAGIC,
            version: VERSION,
            name: "v".to_owned(),
            ntotal: 100,
            mstat: MSTAT_CLEAN,
            itable_start: 1,
            itable_size: 7,
            itotal: 56,
            ifree: 55,
            ihead: Some(InodeNumber(1)),
            itail: Some(InodeNumber(55)),
            dzone_start: 8,
            dzone_total: 23,
            dzone_free: 22,
            retrieval: RetrievalCache::empty(),
            insertion: InsertionCache::empty(),
            dhead: Some(ClusterNumber(1)),
            dtail: Some(ClusterNumber(22)),
        }
    }

    #[test]
    fn superblock_predicate_accepts_sample() {
        assert!(check_superblock(&sample_sb()).is_ok());
    }

    #[test]
    fn superblock_predicate_rejects_bad_fields() {
        let mut sb = sample_sb();
        sb.magic = 0xDEAD;
        assert!(check_superblock(&sb).is_err());

        let mut sb = sample_sb();
        sb.itotal = 57;
        assert!(check_superblock(&sb).is_err());

        let mut sb = sample_sb();
        sb.ntotal = 99;
        assert!(check_superblock(&sb).is_err());

        let mut sb = sample_sb();
        sb.ihead = None;
        assert!(check_superblock(&sb).is_err());

        let mut sb = sample_sb();
        sb.retrieval.idx = DZONE_CACHE_SIZE as u32 + 1;
        assert!(check_superblock(&sb).is_err());
    }

    #[test]
    fn in_use_predicate() {
        let sb = sample_sb();
        let mut inode = Inode::new_in_use(FileKind::Regular, 0o644, 0, 0, 1);
        assert!(check_inode_in_use(InodeNumber(3), &inode, &sb).is_ok());

        inode.direct[2] = Some(ClusterNumber(23)); // out of the 23-cluster zone
        assert!(matches!(
            check_inode_in_use(InodeNumber(3), &inode, &sb),
            Err(SofsError::InconsistentInodeInUse(_))
        ));

        let free = Inode::free_clean(None, None);
        assert!(check_inode_in_use(InodeNumber(3), &free, &sb).is_err());
    }

    #[test]
    fn free_predicates() {
        let sb = sample_sb();
        let clean = Inode::free_clean(Some(InodeNumber(2)), None);
        assert!(check_inode_free_clean(InodeNumber(1), &clean, &sb).is_ok());
        assert!(check_inode_free_dirty(InodeNumber(1), &clean, &sb).is_ok());

        let mut dirty = clean;
        dirty.mode.kind = Some(FileKind::Regular);
        dirty.size = 10;
        assert!(check_inode_free_clean(InodeNumber(1), &dirty, &sb).is_err());
        assert!(check_inode_free_dirty(InodeNumber(1), &dirty, &sb).is_ok());

        let mut bad_link = clean;
        bad_link.aux = crate::inode::InodeAux::FreeLink {
            next: Some(InodeNumber(56)),
            prev: None,
        };
        assert!(check_inode_free_clean(InodeNumber(1), &bad_link, &sb).is_err());
        assert!(check_inode_free_dirty(InodeNumber(1), &bad_link, &sb).is_err());

        let in_use = Inode::new_in_use(FileKind::Regular, 0o644, 0, 0, 1);
        assert!(check_inode_free_dirty(InodeNumber(1), &in_use, &sb).is_err());
    }

    #[test]
    fn cluster_header_predicate() {
        let sb = sample_sb();
        let allocated = ClusterHeader::allocated_to(InodeNumber(4));
        assert!(
            check_cluster_header(ClusterNumber(2), &allocated, ClusterState::Allocated, &sb)
                .is_ok()
        );
        assert!(
            check_cluster_header(ClusterNumber(2), &allocated, ClusterState::FreeClean, &sb)
                .is_err()
        );

        let clean = ClusterHeader::default();
        assert!(
            check_cluster_header(ClusterNumber(2), &clean, ClusterState::FreeClean, &sb).is_ok()
        );
        assert!(
            check_cluster_header(ClusterNumber(2), &clean, ClusterState::FreeDirty, &sb).is_err()
        );

        let out_of_range = ClusterHeader {
            prev: Some(ClusterNumber(23)),
            next: None,
            stat: None,
        };
        assert!(
            check_cluster_header(ClusterNumber(2), &out_of_range, ClusterState::FreeDirty, &sb)
                .is_err()
        );
    }

    #[test]
    fn dir_head_predicate() {
        let n = InodeNumber(5);
        let mut inode = Inode::new_in_use(FileKind::Directory, 0o755, 0, 0, 1);
        inode.size = DPC * DIR_ENTRY_SIZE as u32;
        inode.clucount = 1;

        let mut first = DataCluster::blank_dir(ClusterHeader::allocated_to(n));
        first.set_dir_entry(0, &DirEntry::new(".", n).unwrap());
        first.set_dir_entry(1, &DirEntry::new("..", InodeNumber(0)).unwrap());
        assert!(check_dir_head(n, &inode, &first).is_ok());

        // Size not a multiple of an entry cluster.
        let mut bad = inode;
        bad.size += 1;
        assert!(check_dir_head(n, &bad, &first).is_err());

        // `.` pointing elsewhere.
        let mut wrong_dot = first.clone();
        wrong_dot.set_dir_entry(0, &DirEntry::new(".", InodeNumber(9)).unwrap());
        assert!(check_dir_head(n, &inode, &wrong_dot).is_err());

        let file = Inode::new_in_use(FileKind::Regular, 0o644, 0, 0, 1);
        assert!(matches!(
            check_dir_head(n, &file, &first),
            Err(SofsError::NotDirectory)
        ));
    }
}
