//! Invariant checks over longer operation sequences: the free counters
//! must always equal what the on-disk structures actually hold, and file
//! contents must survive arbitrary interleavings of create, write, rename
//! and remove.

use sofs_core::Volume;
use sofs_inode::InodeStatus;
use sofs_mkfs::{format, FormatOptions};
use sofs_ondisk::FileKind;
use sofs_types::{Credentials, InodeNumber, BLOCK_SIZE, BSLPC};
use std::collections::HashMap;

const CRED: Credentials = Credentials::ROOT;
const ROOT: InodeNumber = InodeNumber::ROOT;

struct TestVolume {
    _file: tempfile::NamedTempFile,
    path: std::path::PathBuf,
}

fn formatted(blocks: u64) -> TestVolume {
    let file = tempfile::NamedTempFile::new().expect("temp file");
    file.as_file()
        .set_len(blocks * BLOCK_SIZE as u64)
        .expect("set_len");
    format(file.path(), &FormatOptions::default()).expect("format");
    let path = file.path().to_owned();
    TestVolume { _file: file, path }
}

/// Walk the inode free list and return its length, verifying the
/// double-linkage on the way.
fn free_list_len(vol: &mut Volume) -> u32 {
    let itotal = vol.superblock().unwrap().itotal;
    let mut cursor = vol.superblock().unwrap().ihead;
    let mut prev = None;
    let mut steps = 0;
    while let Some(n) = cursor {
        assert!(steps <= itotal, "free list does not terminate");
        let inode = vol.read_inode(n, InodeStatus::FreeDirty).unwrap();
        let (next, stored_prev) = inode.aux.free_link().unwrap();
        assert_eq!(stored_prev, prev, "prev linkage broken at inode {n}");
        prev = Some(n);
        cursor = next;
        steps += 1;
    }
    assert_eq!(prev, vol.superblock().unwrap().itail);
    steps
}

/// Tiny deterministic generator so runs are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 16
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

#[test]
fn ifree_always_matches_the_list() {
    let tv = formatted(100);
    let mut vol = Volume::mount(&tv.path).unwrap();

    assert_eq!(free_list_len(&mut vol), vol.superblock().unwrap().ifree);

    let a = vol.allocate_inode(FileKind::Regular, CRED).unwrap();
    let b = vol.allocate_inode(FileKind::Regular, CRED).unwrap();
    assert_eq!(free_list_len(&mut vol), vol.superblock().unwrap().ifree);

    vol.free_inode(a).unwrap();
    assert_eq!(free_list_len(&mut vol), vol.superblock().unwrap().ifree);
    vol.free_inode(b).unwrap();
    assert_eq!(free_list_len(&mut vol), vol.superblock().unwrap().ifree);
}

#[test]
fn mixed_workload_preserves_content_and_counters() {
    let tv = formatted(1000);
    let mut vol = Volume::mount(&tv.path).unwrap();
    let mut rng = Lcg(0x5EED);

    // Shadow model: name -> (inode, expected content).
    let mut live: HashMap<String, (InodeNumber, Vec<u8>)> = HashMap::new();
    let mut serial = 0_u32;

    for _ in 0..200 {
        match rng.below(5) {
            // Create a file.
            0 | 1 => {
                if live.len() >= 24 {
                    continue;
                }
                serial += 1;
                let name = format!("f{serial}");
                let n = vol.allocate_inode(FileKind::Regular, CRED).unwrap();
                vol.set_permissions(n, 0o644).unwrap();
                vol.add_dir_entry(ROOT, &name, n, CRED).unwrap();
                live.insert(name, (n, Vec::new()));
            }
            // Write somewhere inside (or past the end of) a file.
            2 => {
                let Some(name) = pick(&live, &mut rng) else { continue };
                let (n, content) = live.get_mut(&name).unwrap();
                let offset = rng.below(2 * BSLPC as u64);
                let len = 1 + rng.below(BSLPC as u64) as usize;
                let byte = (rng.next() % 251) as u8;
                let data = vec![byte; len];
                vol.write_file(*n, offset, &data).unwrap();

                let end = offset as usize + len;
                if content.len() < end {
                    content.resize(end, 0);
                }
                content[offset as usize..end].copy_from_slice(&data);
            }
            // Rename.
            3 => {
                let Some(name) = pick(&live, &mut rng) else { continue };
                serial += 1;
                let renamed = format!("r{serial}");
                vol.rename_dir_entry(ROOT, &name, &renamed, CRED).unwrap();
                let entry = live.remove(&name).unwrap();
                live.insert(renamed, entry);
            }
            // Remove.
            _ => {
                let Some(name) = pick(&live, &mut rng) else { continue };
                vol.remove_dir_entry(ROOT, &name, CRED).unwrap();
                live.remove(&name);
            }
        }

        assert_eq!(
            free_list_len(&mut vol),
            vol.superblock().unwrap().ifree,
            "ifree drifted from the list"
        );
    }

    // Every surviving file reads back exactly what the model says.
    for (name, (n, content)) in &live {
        let (found, _) = vol.get_dir_entry_by_name(ROOT, name, CRED).unwrap();
        assert_eq!(found, *n);
        let read_back = vol.read_file(*n, 0, content.len().max(1)).unwrap();
        assert_eq!(&read_back, content, "content mismatch for {name}");
    }

    // Directory listing agrees with the model (plus `.` and `..`).
    let listing = vol.list_dir_entries(ROOT, CRED).unwrap();
    assert_eq!(listing.len(), live.len() + 2);

    vol.unmount().unwrap();
    let report = sofs_fsck::check(&tv.path).unwrap();
    assert!(report.is_clean(), "findings: {:?}", report.findings);
}

fn pick(live: &HashMap<String, (InodeNumber, Vec<u8>)>, rng: &mut Lcg) -> Option<String> {
    if live.is_empty() {
        return None;
    }
    let idx = rng.below(live.len() as u64) as usize;
    live.keys().nth(idx).cloned()
}

#[test]
fn cluster_counters_survive_allocate_free_cycles() {
    let tv = formatted(1000);
    let mut vol = Volume::mount(&tv.path).unwrap();
    let mut rng = Lcg(0xD15C);

    let n = vol.allocate_inode(FileKind::Regular, CRED).unwrap();
    vol.set_permissions(n, 0o600).unwrap();
    vol.add_dir_entry(ROOT, "churn", n, CRED).unwrap();
    let baseline = vol.superblock().unwrap().dzone_free;

    // Grow and shrink the file repeatedly across the direct/single-
    // indirect boundary; the free count must come back to the baseline
    // every time the file is emptied.
    for round in 0..8 {
        let clusters = 1 + rng.below(12) as u32;
        for index in 0..clusters {
            vol.alloc_file_cluster(n, index).unwrap();
        }
        vol.handle_file_clusters(n, 0, sofs_core::ReleaseOp::FreeClean)
            .unwrap();
        assert_eq!(
            vol.superblock().unwrap().dzone_free,
            baseline,
            "free-cluster count drifted in round {round}"
        );
        let inode = vol.read_inode(n, InodeStatus::InUse).unwrap();
        assert_eq!(inode.clucount, 0, "clucount drifted in round {round}");
    }

    vol.unmount().unwrap();
    assert!(sofs_fsck::check(&tv.path).unwrap().is_clean());
}
