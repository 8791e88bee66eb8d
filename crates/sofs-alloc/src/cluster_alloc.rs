//! Data-cluster allocation over the retrieval cache, insertion cache and
//! general free list.
//!
//! Allocation pops the retrieval cache, replenishing it from the head of
//! the general list when empty; freeing pushes the insertion cache,
//! depleting it into the tail of the general list when full. The ordering
//! gives at-most-two cache-thrash amortisation: a sequence of N allocates
//! and N frees touches each cluster on disk at most twice.

use sofs_block::BufferCache;
use sofs_error::{Result, SofsError};
use sofs_ondisk::ClusterHeader;
use sofs_types::{ClusterNumber, InodeNumber, DZONE_CACHE_SIZE};
use tracing::{debug, trace};

/// Allocate a free data cluster and associate it to `inode`.
///
/// The inode must be in use; the only consistency check at this level is
/// that it is not free. A dirty cluster coming off the retrieval cache is
/// cleaned before being handed out.
pub fn alloc_data_cluster(cache: &mut BufferCache, inode: InodeNumber) -> Result<ClusterNumber> {
    let target = cache.fetch_inode(inode)?;
    if !target.is_in_use() {
        return Err(SofsError::InvalidInode(inode.0));
    }
    if cache.superblock()?.dzone_free == 0 {
        return Err(SofsError::NoFreeClusters);
    }

    if cache.superblock()?.retrieval.is_empty() {
        replenish(cache)?;
    }
    let cluster = cache
        .superblock_mut()?
        .retrieval
        .pop()
        .ok_or(SofsError::NoFreeClusters)?;

    let mut value = cache.fetch_cluster(cluster)?;
    if value.header.prev.is_some() || value.header.next.is_some() {
        return Err(SofsError::InconsistentClusterHeader(cluster));
    }

    {
        let sb = cache.superblock_mut()?;
        sb.dzone_free -= 1;
    }
    cache.store_superblock()?;

    if let Some(stale_owner) = value.header.stat {
        // Free-dirty: scrub the previous owner's payload before reuse.
        clean_data_cluster(cache, stale_owner, cluster)?;
        value = cache.fetch_cluster(cluster)?;
    }

    value.header = ClusterHeader::allocated_to(inode);
    cache.put_cluster(cluster, &value)?;
    trace!(target: "sofs::alloc", cluster = cluster.0, inode = inode.0, "cluster allocated");
    Ok(cluster)
}

/// Return a cluster to the free store.
///
/// The header linkage is reset but `stat` keeps the previous owner, so the
/// cluster stays recognisably dirty until reuse cleans it.
pub fn free_data_cluster(cache: &mut BufferCache, cluster: ClusterNumber) -> Result<()> {
    let dzone_total = cache.superblock()?.dzone_total;
    if cluster.0 == 0 || cluster.0 >= dzone_total {
        // Cluster 0 holds the root directory and may never be freed.
        return Err(SofsError::InvalidCluster(cluster.0));
    }

    let mut value = cache.fetch_cluster(cluster)?;
    if !value.header.is_allocated() {
        return Err(SofsError::ClusterNotAllocated(cluster));
    }

    if cache.superblock()?.insertion.is_full() {
        deplete(cache)?;
    }

    value.header.prev = None;
    value.header.next = None;
    cache.put_cluster(cluster, &value)?;

    {
        let sb = cache.superblock_mut()?;
        sb.insertion.push(cluster);
        sb.dzone_free += 1;
    }
    cache.store_superblock()?;
    trace!(target: "sofs::alloc", cluster = cluster.0, "cluster freed");
    Ok(())
}

/// Scrub a dirty cluster: verify the owner stamp, zero the payload and
/// clear the stamp.
pub fn clean_data_cluster(
    cache: &mut BufferCache,
    owner: InodeNumber,
    cluster: ClusterNumber,
) -> Result<()> {
    {
        let sb = cache.superblock()?;
        if !sb.inode_in_range(owner) {
            return Err(SofsError::InvalidInode(owner.0));
        }
        if !sb.cluster_in_range(cluster) {
            return Err(SofsError::InvalidCluster(cluster.0));
        }
    }
    let mut value = cache.fetch_cluster(cluster)?;
    if value.header.stat != Some(owner) {
        return Err(SofsError::WrongInodeStamp {
            cluster,
            expected: owner,
            found: InodeNumber::encode(value.header.stat),
        });
    }
    value.zero_payload();
    value.header.stat = None;
    cache.put_cluster(cluster, &value)?;
    trace!(target: "sofs::alloc", cluster = cluster.0, owner = owner.0, "cluster cleaned");
    Ok(())
}

/// Move up to a cache-full of references from the head of the general free
/// list into the retrieval cache. When the general list runs out
/// mid-replenish, the insertion cache is depleted into it first.
fn replenish(cache: &mut BufferCache) -> Result<()> {
    debug_assert!(cache.superblock()?.retrieval.is_empty());
    let mut batch: Vec<ClusterNumber> = Vec::with_capacity(DZONE_CACHE_SIZE);

    while batch.len() < DZONE_CACHE_SIZE {
        let Some(head) = cache.superblock()?.dhead else {
            if cache.superblock()?.insertion.is_empty() {
                break;
            }
            deplete(cache)?;
            continue;
        };

        let mut head_value = cache.fetch_cluster(head)?;
        let next = head_value.header.next;
        if let Some(next) = next {
            let mut next_value = cache.fetch_cluster(next)?;
            next_value.header.prev = None;
            cache.put_cluster(next, &next_value)?;
        }
        head_value.header.next = None;
        cache.put_cluster(head, &head_value)?;

        {
            let sb = cache.superblock_mut()?;
            sb.dhead = next;
            if next.is_none() {
                sb.dtail = None;
            }
        }
        batch.push(head);
    }

    debug!(target: "sofs::alloc", moved = batch.len(), "retrieval cache replenished");
    cache.superblock_mut()?.retrieval.refill(&batch);
    cache.store_superblock()
}

/// Flush the entire insertion cache into the tail of the general free list.
/// Idempotent on an empty cache.
fn deplete(cache: &mut BufferCache) -> Result<()> {
    let entries = cache.superblock_mut()?.insertion.drain();
    if entries.is_empty() {
        return Ok(());
    }
    debug!(target: "sofs::alloc", moved = entries.len(), "insertion cache depleted");

    for entry in entries {
        match cache.superblock()?.dtail {
            None => {
                // First node: becomes both head and tail; its header was
                // already reset by free().
                let sb = cache.superblock_mut()?;
                sb.dhead = Some(entry);
                sb.dtail = Some(entry);
            }
            Some(tail) => {
                let mut tail_value = cache.fetch_cluster(tail)?;
                tail_value.header.next = Some(entry);
                cache.put_cluster(tail, &tail_value)?;

                let mut entry_value = cache.fetch_cluster(entry)?;
                entry_value.header.prev = Some(tail);
                entry_value.header.next = None;
                cache.put_cluster(entry, &entry_value)?;

                cache.superblock_mut()?.dtail = Some(entry);
            }
        }
    }
    cache.store_superblock()
}
