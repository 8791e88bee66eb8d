#![forbid(unsafe_code)]
//! Offline consistency checker.
//!
//! A single read-only pass over the whole volume, phase by phase:
//! superblock arithmetic, the inode table and its free list, the data zone
//! and its free list, the in-superblock caches, the cluster-to-inode
//! reference graph, and finally reachability of the directory tree. Later
//! phases assume the invariants of earlier ones, so the pass short-circuits
//! after the first phase that produces findings. Nothing is ever repaired
//! in place.

use serde::Serialize;
use sofs_block::BufferCache;
use sofs_error::Result;
use sofs_ondisk::{
    check_inode_free_clean, check_inode_free_dirty, check_inode_in_use, check_superblock,
    decode_inode_block, ClusterHeader, DataCluster, Inode, SuperBlock,
};
use sofs_types::{
    ref_zone, BlockNumber, ClusterNumber, InodeNumber, RefZone, DIR_ENTRY_SIZE, DPC,
    INODE_SIZE, IPB,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

// ── Report types ────────────────────────────────────────────────────────────

/// The check phases, in running order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Superblock,
    InodeTable,
    DataZone,
    Caches,
    CrossReference,
    DirectoryTree,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Superblock => "superblock",
            Self::InodeTable => "inode-table",
            Self::DataZone => "data-zone",
            Self::Caches => "caches",
            Self::CrossReference => "cross-reference",
            Self::DirectoryTree => "directory-tree",
        };
        f.write_str(name)
    }
}

/// One consistency violation.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub phase: Phase,
    pub detail: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.phase, self.detail)
    }
}

/// Outcome of a whole-volume check.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CheckReport {
    pub phases_run: Vec<Phase>,
    pub findings: Vec<Finding>,
}

impl CheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    fn record(&mut self, phase: Phase, detail: impl Into<String>) {
        self.findings.push(Finding {
            phase,
            detail: detail.into(),
        });
    }
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Check the volume in the backing file at `path`.
pub fn check(path: impl AsRef<Path>) -> Result<CheckReport> {
    let mut cache = BufferCache::open(path)?;
    check_volume(&mut cache)
}

/// Check an already-open volume. Only reads are issued.
pub fn check_volume(cache: &mut BufferCache) -> Result<CheckReport> {
    cache.load_superblock()?;
    let sb = cache.superblock()?.clone();
    let mut report = CheckReport::default();

    let phases: [(Phase, fn(&BufferCache, &SuperBlock, &mut CheckReport) -> Result<()>); 6] = [
        (Phase::Superblock, phase_superblock),
        (Phase::InodeTable, phase_inode_table),
        (Phase::DataZone, phase_data_zone),
        (Phase::Caches, phase_caches),
        (Phase::CrossReference, phase_cross_reference),
        (Phase::DirectoryTree, phase_directory_tree),
    ];

    for (phase, run) in phases {
        report.phases_run.push(phase);
        run(cache, &sb, &mut report)?;
        if !report.is_clean() {
            debug!(target: "sofs::fsck", %phase, findings = report.findings.len(), "short-circuiting");
            break;
        }
    }

    info!(
        target: "sofs::fsck",
        phases = report.phases_run.len(),
        findings = report.findings.len(),
        "check finished"
    );
    Ok(report)
}

// ── Shared read-only helpers ────────────────────────────────────────────────

/// All inodes of the table, decode failures reported as findings.
fn load_inode_table(
    cache: &BufferCache,
    sb: &SuperBlock,
    phase: Phase,
    report: &mut CheckReport,
) -> Result<Vec<Option<Inode>>> {
    let mut inodes = Vec::with_capacity(sb.itotal as usize);
    for table_block in 0..sb.itable_size {
        let raw = cache.read_block(BlockNumber(sb.itable_start + table_block))?;
        match decode_inode_block(&raw) {
            Ok(block) => inodes.extend(block.into_iter().map(Some)),
            Err(error) => {
                for slot in 0..IPB {
                    let n = table_block * IPB + slot;
                    inodes.push(Inode::decode(&raw[slot as usize * INODE_SIZE..]).ok());
                    if inodes.last().is_some_and(Option::is_none) {
                        report.record(phase, format!("inode {n} does not decode: {error}"));
                    }
                }
            }
        }
    }
    Ok(inodes)
}

fn cluster_header(cache: &BufferCache, sb: &SuperBlock, c: ClusterNumber) -> Result<ClusterHeader> {
    Ok(cache.read_cluster(sb.cluster_block(c))?.header)
}

/// Read the data cluster at logical file index `index` of `inode`,
/// following the reference tree without touching the volume.
fn file_cluster_of(
    cache: &BufferCache,
    sb: &SuperBlock,
    inode: &Inode,
    index: u32,
) -> Result<Option<DataCluster>> {
    let reference = match ref_zone(index) {
        Some(RefZone::Direct { slot }) => inode.direct[slot],
        Some(RefZone::Single { slot }) => match inode.i1 {
            Some(i1) => cache.read_cluster(sb.cluster_block(i1))?.ref_at(slot),
            None => None,
        },
        Some(RefZone::Double { outer, inner }) => match inode.i2 {
            Some(i2) => match cache.read_cluster(sb.cluster_block(i2))?.ref_at(outer) {
                Some(mid) => cache.read_cluster(sb.cluster_block(mid))?.ref_at(inner),
                None => None,
            },
            None => None,
        },
        None => None,
    };
    match reference {
        Some(c) if sb.cluster_in_range(c) => Ok(Some(cache.read_cluster(sb.cluster_block(c))?)),
        _ => Ok(None),
    }
}

// ── Phase 1: superblock ─────────────────────────────────────────────────────

fn phase_superblock(
    _cache: &BufferCache,
    sb: &SuperBlock,
    report: &mut CheckReport,
) -> Result<()> {
    if let Err(error) = check_superblock(sb) {
        report.record(Phase::Superblock, error.to_string());
    }
    Ok(())
}

// ── Phase 2: inode table and free list ──────────────────────────────────────

fn phase_inode_table(
    cache: &BufferCache,
    sb: &SuperBlock,
    report: &mut CheckReport,
) -> Result<()> {
    let inodes = load_inode_table(cache, sb, Phase::InodeTable, report)?;

    match inodes.first().copied().flatten() {
        Some(root) if root.is_directory() => {}
        _ => report.record(Phase::InodeTable, "inode 0 is not an in-use directory"),
    }

    let mut free_set: HashSet<u32> = HashSet::new();
    for (n, inode) in inodes.iter().enumerate() {
        let n = n as u32;
        let Some(inode) = inode else { continue };
        let number = InodeNumber(n);
        if inode.is_in_use() {
            if let Err(error) = check_inode_in_use(number, inode, sb) {
                report.record(Phase::InodeTable, error.to_string());
            }
        } else {
            free_set.insert(n);
            let result = if inode.is_free_clean() {
                check_inode_free_clean(number, inode, sb)
            } else {
                check_inode_free_dirty(number, inode, sb)
            };
            if let Err(error) = result {
                report.record(Phase::InodeTable, error.to_string());
            }
        }
    }

    // Walk the free list, bounding traversal by `ifree` to catch loops.
    let mut walked: HashSet<u32> = HashSet::new();
    let mut prev: Option<InodeNumber> = None;
    let mut cursor = sb.ihead;
    let mut steps = 0_u32;
    while let Some(n) = cursor {
        if steps >= sb.ifree {
            report.record(Phase::InodeTable, "inode free list is longer than ifree (loop?)");
            return Ok(());
        }
        if !walked.insert(n.0) {
            report.record(Phase::InodeTable, format!("inode free list revisits inode {n}"));
            return Ok(());
        }
        let Some(inode) = inodes.get(n.0 as usize).copied().flatten() else {
            report.record(Phase::InodeTable, format!("free list reaches invalid inode {n}"));
            return Ok(());
        };
        let Some((next, stored_prev)) = inode.aux.free_link() else {
            report.record(Phase::InodeTable, format!("inode {n} on free list is not free"));
            return Ok(());
        };
        if stored_prev != prev {
            report.record(
                Phase::InodeTable,
                format!("inode {n} prev link disagrees with list order"),
            );
        }
        prev = Some(n);
        cursor = next;
        steps += 1;
    }

    if steps != sb.ifree {
        report.record(
            Phase::InodeTable,
            format!("free list holds {steps} inodes, superblock says {}", sb.ifree),
        );
    }
    if prev != sb.itail {
        report.record(Phase::InodeTable, "free list tail does not match itail");
    }
    for n in free_set {
        if !walked.contains(&n) {
            report.record(
                Phase::InodeTable,
                format!("free inode {n} is not on the free list"),
            );
        }
    }
    Ok(())
}

// ── Phase 3: data zone and general free list ────────────────────────────────

fn phase_data_zone(cache: &BufferCache, sb: &SuperBlock, report: &mut CheckReport) -> Result<()> {
    let root = cluster_header(cache, sb, ClusterNumber::ROOT_DIR)?;
    if root.stat != Some(InodeNumber::ROOT) || root.prev.is_some() || root.next.is_some() {
        report.record(Phase::DataZone, "cluster 0 is not allocated to inode 0");
    }

    for n in 0..sb.dzone_total {
        let header = cluster_header(cache, sb, ClusterNumber(n))?;
        for link in [header.prev, header.next].into_iter().flatten() {
            if !sb.cluster_in_range(link) {
                report.record(
                    Phase::DataZone,
                    format!("cluster {n} links to out-of-range cluster {link}"),
                );
            }
        }
        if let Some(owner) = header.stat {
            if !sb.inode_in_range(owner) {
                report.record(
                    Phase::DataZone,
                    format!("cluster {n} is stamped with out-of-range inode {owner}"),
                );
            }
        }
    }

    // General free list walk, bounded by the free count.
    let mut walked: HashSet<u32> = HashSet::new();
    let mut prev: Option<ClusterNumber> = None;
    let mut cursor = sb.dhead;
    let mut steps = 0_u32;
    while let Some(c) = cursor {
        if steps >= sb.dzone_free {
            report.record(Phase::DataZone, "cluster free list is longer than dzone_free (loop?)");
            return Ok(());
        }
        if !walked.insert(c.0) {
            report.record(Phase::DataZone, format!("cluster free list revisits cluster {c}"));
            return Ok(());
        }
        if !sb.cluster_in_range(c) {
            report.record(Phase::DataZone, format!("free list reaches invalid cluster {c}"));
            return Ok(());
        }
        let header = cluster_header(cache, sb, c)?;
        if header.prev != prev {
            report.record(
                Phase::DataZone,
                format!("cluster {c} prev link disagrees with list order"),
            );
        }
        prev = Some(c);
        cursor = header.next;
        steps += 1;
    }
    if prev != sb.dtail {
        report.record(Phase::DataZone, "cluster free list tail does not match dtail");
    }
    Ok(())
}

// ── Phase 4: cache integrity ────────────────────────────────────────────────

fn phase_caches(cache: &BufferCache, sb: &SuperBlock, report: &mut CheckReport) -> Result<()> {
    for c in sb.retrieval.iter_occupied() {
        if !sb.cluster_in_range(c) {
            report.record(Phase::Caches, format!("retrieval cache holds invalid cluster {c}"));
            continue;
        }
        let header = cluster_header(cache, sb, c)?;
        if header.prev.is_some() || header.next.is_some() {
            report.record(
                Phase::Caches,
                format!("retrieval cache cluster {c} still carries list linkage"),
            );
        }
    }
    for c in sb.insertion.iter_occupied() {
        if !sb.cluster_in_range(c) {
            report.record(Phase::Caches, format!("insertion cache holds invalid cluster {c}"));
            continue;
        }
        let header = cluster_header(cache, sb, c)?;
        if header.prev.is_some() || header.next.is_some() {
            report.record(
                Phase::Caches,
                format!("insertion cache cluster {c} still carries list linkage"),
            );
        }
    }

    // The free count must equal what the three structures actually hold.
    let mut list_len = 0_u32;
    let mut cursor = sb.dhead;
    let mut guard = 0_u32;
    while let Some(c) = cursor {
        list_len += 1;
        guard += 1;
        if guard > sb.dzone_total {
            break;
        }
        cursor = cluster_header(cache, sb, c)?.next;
    }
    let held = sb.retrieval.occupied() as u32 + sb.insertion.occupied() as u32 + list_len;
    if held != sb.dzone_free {
        report.record(
            Phase::Caches,
            format!(
                "free structures hold {held} clusters, superblock says {}",
                sb.dzone_free
            ),
        );
    }
    Ok(())
}

// ── Phase 5: cluster-to-inode cross-reference ───────────────────────────────

fn phase_cross_reference(
    cache: &BufferCache,
    sb: &SuperBlock,
    report: &mut CheckReport,
) -> Result<()> {
    let inodes = load_inode_table(cache, sb, Phase::CrossReference, report)?;
    let mut owner_of: HashMap<u32, u32> = HashMap::new();

    let mut claim = |c: ClusterNumber, n: u32, report: &mut CheckReport| {
        if let Some(previous) = owner_of.insert(c.0, n) {
            report.record(
                Phase::CrossReference,
                format!("cluster {c} referenced by both inode {previous} and inode {n}"),
            );
        }
    };

    for (n, inode) in inodes.iter().enumerate() {
        let n = n as u32;
        let Some(inode) = inode else { continue };
        if !inode.is_in_use() {
            continue;
        }

        for c in inode.direct.iter().copied().flatten() {
            claim(c, n, report);
        }
        if let Some(i1) = inode.i1 {
            claim(i1, n, report);
            for c in cache.read_cluster(sb.cluster_block(i1))?.iter_refs() {
                claim(c, n, report);
            }
        }
        if let Some(i2) = inode.i2 {
            claim(i2, n, report);
            for mid in cache.read_cluster(sb.cluster_block(i2))?.iter_refs() {
                claim(mid, n, report);
                if sb.cluster_in_range(mid) {
                    for c in cache.read_cluster(sb.cluster_block(mid))?.iter_refs() {
                        claim(c, n, report);
                    }
                }
            }
        }
    }

    // Ownership stamps must agree with the reference graph.
    for (c, n) in &owner_of {
        let cluster = ClusterNumber(*c);
        if !sb.cluster_in_range(cluster) {
            report.record(
                Phase::CrossReference,
                format!("inode {n} references out-of-range cluster {c}"),
            );
            continue;
        }
        let header = cluster_header(cache, sb, cluster)?;
        if header.stat != Some(InodeNumber(*n)) {
            report.record(
                Phase::CrossReference,
                format!("cluster {c} referenced by inode {n} but stamped for another owner"),
            );
        }
    }
    Ok(())
}

// ── Phase 6: directory-tree reachability ────────────────────────────────────

fn phase_directory_tree(
    cache: &BufferCache,
    sb: &SuperBlock,
    report: &mut CheckReport,
) -> Result<()> {
    let inodes = load_inode_table(cache, sb, Phase::DirectoryTree, report)?;
    let mut link_count: HashMap<u32, u32> = HashMap::new();
    let mut visited: HashSet<u32> = HashSet::new();
    let mut stack: Vec<(InodeNumber, InodeNumber)> = vec![(InodeNumber::ROOT, InodeNumber::ROOT)];

    while let Some((dir, parent)) = stack.pop() {
        if !visited.insert(dir.0) {
            report.record(
                Phase::DirectoryTree,
                format!("directory {dir} reached twice (loop or extra link)"),
            );
            continue;
        }
        let Some(inode) = inodes.get(dir.0 as usize).copied().flatten() else {
            report.record(Phase::DirectoryTree, format!("directory {dir} does not decode"));
            continue;
        };
        let total_slots = inode.size / DIR_ENTRY_SIZE as u32;
        for index in 0..total_slots {
            let Some(cluster) = file_cluster_of(cache, sb, &inode, index / DPC)? else {
                report.record(
                    Phase::DirectoryTree,
                    format!("directory {dir} is missing entry cluster {}", index / DPC),
                );
                break;
            };
            let entry = cluster.dir_entry(index % DPC);
            if index == 0 {
                if !entry.matches(".") || entry.inode != Some(dir) {
                    report.record(
                        Phase::DirectoryTree,
                        format!("directory {dir} slot 0 is not `.` to itself"),
                    );
                }
            } else if index == 1 {
                if !entry.matches("..") || entry.inode != Some(parent) {
                    report.record(
                        Phase::DirectoryTree,
                        format!("directory {dir} slot 1 does not point back at {parent}"),
                    );
                }
            }
            if entry.is_unoccupied() {
                continue;
            }
            let Some(target) = entry.inode else { continue };
            *link_count.entry(target.0).or_insert(0) += 1;

            if index < 2 {
                continue;
            }
            match inodes.get(target.0 as usize).copied().flatten() {
                Some(child) if child.is_in_use() => {
                    if child.is_directory() {
                        stack.push((target, dir));
                    }
                }
                _ => report.record(
                    Phase::DirectoryTree,
                    format!(
                        "entry {:?} in directory {dir} references inode {target} which is not in use",
                        entry.name_str()
                    ),
                ),
            }
        }
    }

    // Link counts: every in-use inode's refcount must equal the number of
    // directory entries naming it.
    for (n, inode) in inodes.iter().enumerate() {
        let n = n as u32;
        let Some(inode) = inode else { continue };
        if !inode.is_in_use() {
            continue;
        }
        let counted = link_count.get(&n).copied().unwrap_or(0);
        if counted != u32::from(inode.refcount) {
            report.record(
                Phase::DirectoryTree,
                format!(
                    "inode {n} has refcount {} but {counted} directory entries reference it",
                    inode.refcount
                ),
            );
        }
        if inode.is_directory() && !visited.contains(&n) {
            report.record(
                Phase::DirectoryTree,
                format!("directory inode {n} is unreachable from the root"),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sofs_alloc::alloc_inode;
    use sofs_block::MemDevice;
    use sofs_dir::{add_dir_entry, remove_dir_entry};
    use sofs_file::write_file_cluster;
    use sofs_mkfs::{format_device, FormatOptions};
    use sofs_ondisk::FileKind;
    use sofs_types::{Credentials, BLOCK_SIZE};

    const CRED: Credentials = Credentials::ROOT;
    const ROOT: InodeNumber = InodeNumber::ROOT;

    fn fresh_volume(blocks: usize) -> BufferCache {
        let mut cache =
            BufferCache::new(Box::new(MemDevice::zeroed(blocks * BLOCK_SIZE))).unwrap();
        format_device(&mut cache, &FormatOptions::default()).unwrap();
        cache.load_superblock().unwrap();
        cache
    }

    fn new_file(cache: &mut BufferCache, parent: InodeNumber, name: &str) -> InodeNumber {
        let ino = alloc_inode(cache, FileKind::Regular, CRED).unwrap();
        let mut value = cache.fetch_inode(ino).unwrap();
        value.mode.perms = 0o644;
        cache.put_inode(ino, &value).unwrap();
        add_dir_entry(cache, parent, name, ino, CRED).unwrap();
        ino
    }

    fn new_dir(cache: &mut BufferCache, parent: InodeNumber, name: &str) -> InodeNumber {
        let ino = alloc_inode(cache, FileKind::Directory, CRED).unwrap();
        let mut value = cache.fetch_inode(ino).unwrap();
        value.mode.perms = 0o755;
        cache.put_inode(ino, &value).unwrap();
        add_dir_entry(cache, parent, name, ino, CRED).unwrap();
        ino
    }

    #[test]
    fn fresh_volume_is_clean() {
        let mut cache = fresh_volume(100);
        let report = check_volume(&mut cache).unwrap();
        assert!(report.is_clean(), "findings: {:?}", report.findings);
        assert_eq!(report.phases_run.len(), 6);
    }

    #[test]
    fn exercised_volume_is_clean() {
        let mut cache = fresh_volume(400);
        let d = new_dir(&mut cache, ROOT, "d");
        let f = new_file(&mut cache, d, "f");
        write_file_cluster(&mut cache, f, 0, b"hello").unwrap();
        write_file_cluster(&mut cache, f, 9, b"indirect").unwrap();
        let mut value = cache.fetch_inode(f).unwrap();
        value.size = 5;
        cache.put_inode(f, &value).unwrap();
        new_file(&mut cache, ROOT, "g");
        remove_dir_entry(&mut cache, ROOT, "g", CRED).unwrap();

        let report = check_volume(&mut cache).unwrap();
        assert!(report.is_clean(), "findings: {:?}", report.findings);
    }

    #[test]
    fn bad_magic_stops_at_phase_one() {
        let mut cache = fresh_volume(100);
        cache.superblock_mut().unwrap().magic = 0xBEEF;
        cache.store_superblock().unwrap();

        let report = check_volume(&mut cache).unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.phases_run, vec![Phase::Superblock]);
    }

    #[test]
    fn broken_free_list_is_detected() {
        let mut cache = fresh_volume(100);
        // Corrupt the prev link of the second free inode.
        let n = InodeNumber(2);
        let mut value = cache.fetch_inode(n).unwrap();
        value.aux = sofs_ondisk::InodeAux::FreeLink {
            next: Some(InodeNumber(3)),
            prev: Some(InodeNumber(9)),
        };
        cache.put_inode(n, &value).unwrap();

        let report = check_volume(&mut cache).unwrap();
        assert!(report
            .findings
            .iter()
            .any(|f| f.phase == Phase::InodeTable && f.detail.contains("prev link")));
    }

    #[test]
    fn wrong_free_count_is_detected() {
        let mut cache = fresh_volume(100);
        cache.superblock_mut().unwrap().dzone_free -= 1;
        cache.store_superblock().unwrap();

        let report = check_volume(&mut cache).unwrap();
        assert!(!report.is_clean());
    }

    #[test]
    fn double_reference_is_detected() {
        let mut cache = fresh_volume(100);
        let a = new_file(&mut cache, ROOT, "a");
        let b = new_file(&mut cache, ROOT, "b");
        write_file_cluster(&mut cache, a, 0, b"x").unwrap();

        // Point b's first direct reference at a's cluster.
        let stolen = cache.fetch_inode(a).unwrap().direct[0];
        let mut value = cache.fetch_inode(b).unwrap();
        value.direct[0] = stolen;
        value.clucount = 1;
        cache.put_inode(b, &value).unwrap();

        let report = check_volume(&mut cache).unwrap();
        assert!(report
            .findings
            .iter()
            .any(|f| f.phase == Phase::CrossReference && f.detail.contains("referenced by both")));
    }

    #[test]
    fn broken_dot_entry_is_detected() {
        let mut cache = fresh_volume(100);
        let d = new_dir(&mut cache, ROOT, "d");
        let cluster = cache.fetch_inode(d).unwrap().direct[0].unwrap();
        let mut value = cache.fetch_cluster(cluster).unwrap();
        let mut dot = value.dir_entry(0);
        dot.inode = Some(ROOT);
        value.set_dir_entry(0, &dot);
        cache.put_cluster(cluster, &value).unwrap();

        let report = check_volume(&mut cache).unwrap();
        assert!(report
            .findings
            .iter()
            .any(|f| f.phase == Phase::DirectoryTree && f.detail.contains("slot 0")));
    }

    #[test]
    fn refcount_mismatch_is_detected() {
        let mut cache = fresh_volume(100);
        let f = new_file(&mut cache, ROOT, "f");
        let mut value = cache.fetch_inode(f).unwrap();
        value.refcount = 5;
        cache.put_inode(f, &value).unwrap();

        let report = check_volume(&mut cache).unwrap();
        assert!(report
            .findings
            .iter()
            .any(|f| f.phase == Phase::DirectoryTree && f.detail.contains("refcount")));
    }
}
