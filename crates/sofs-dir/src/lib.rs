#![forbid(unsafe_code)]
//! Layer 4: directory entries.
//!
//! A directory's payload is a contiguous array of fixed-size entries,
//! `DPC` per cluster, the first two always `.` and `..`. Removed entries
//! keep their residual name bytes behind a leading nul so offline recovery
//! can still see the prior name; lookups treat a leading nul or a null
//! inode as an empty slot either way.

mod path;

pub use path::{get_dir_entry_by_path, split_last_component};

use sofs_alloc::free_inode;
use sofs_block::BufferCache;
use sofs_error::{Result, SofsError};
use sofs_file::{alloc_file_cluster, get_file_cluster, handle_file_clusters, ReleaseOp};
use sofs_inode::{access_check, read_inode, write_inode, InodeStatus};
use sofs_ondisk::{check_dir_head, DirEntry, Inode};
use sofs_types::{
    AccessMode, ClusterNumber, Credentials, InodeNumber, DIR_ENTRY_SIZE, DPC, MAX_FILE_CLUSTERS,
    MAX_NAME,
};
use tracing::{debug, trace};

/// Bytes a directory grows by when a new entry cluster is allocated.
const ENTRY_CLUSTER_BYTES: u32 = DPC * DIR_ENTRY_SIZE as u32;

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(SofsError::InvalidName(name.to_owned()));
    }
    if name.len() > MAX_NAME {
        return Err(SofsError::NameTooLong);
    }
    Ok(())
}

/// Read a directory inode, insisting it is an in-use directory with a sane
/// head cluster.
fn read_dir_inode(cache: &mut BufferCache, dir: InodeNumber) -> Result<Inode> {
    let inode = read_inode(cache, dir, InodeStatus::InUse)?;
    if !inode.is_directory() {
        return Err(SofsError::NotDirectory);
    }
    let first = inode
        .direct[0]
        .ok_or(SofsError::MalformedDirectory(dir))?;
    let head = cache.fetch_cluster(first)?;
    check_dir_head(dir, &inode, &head)?;
    Ok(inode)
}

// ── Slot addressing ─────────────────────────────────────────────────────────

fn slot_cluster(cache: &mut BufferCache, dir: InodeNumber, index: u32) -> Result<ClusterNumber> {
    get_file_cluster(cache, dir, index / DPC)?.ok_or(SofsError::MalformedDirectory(dir))
}

fn read_slot(cache: &mut BufferCache, dir: InodeNumber, index: u32) -> Result<DirEntry> {
    let cluster = slot_cluster(cache, dir, index)?;
    Ok(cache.fetch_cluster(cluster)?.dir_entry(index % DPC))
}

fn write_slot(
    cache: &mut BufferCache,
    dir: InodeNumber,
    index: u32,
    entry: &DirEntry,
) -> Result<()> {
    let cluster = slot_cluster(cache, dir, index)?;
    let mut value = cache.fetch_cluster(cluster)?;
    value.set_dir_entry(index % DPC, entry);
    cache.put_cluster(cluster, &value)
}

// ── Scanning ────────────────────────────────────────────────────────────────

struct DirScan {
    found: Option<(u32, InodeNumber)>,
    first_free_clean: Option<u32>,
    first_free_dirty: Option<u32>,
    total_slots: u32,
}

impl DirScan {
    /// The slot `add` should use, or `None` when the directory must grow.
    fn insertion_slot(&self) -> Option<u32> {
        self.first_free_clean.or(self.first_free_dirty)
    }
}

/// Walk every entry slot within the directory's current size. `name` is
/// matched against live entries; the smallest free slot of each flavour is
/// tracked for insertion.
fn scan_dir(
    cache: &mut BufferCache,
    dir: InodeNumber,
    inode: &Inode,
    name: Option<&str>,
) -> Result<DirScan> {
    let total_slots = inode.size / DIR_ENTRY_SIZE as u32;
    let mut scan = DirScan {
        found: None,
        first_free_clean: None,
        first_free_dirty: None,
        total_slots,
    };

    let clusters = total_slots.div_ceil(DPC);
    for cluster_index in 0..clusters {
        let cluster = get_file_cluster(cache, dir, cluster_index)?
            .ok_or(SofsError::MalformedDirectory(dir))?;
        let value = cache.fetch_cluster(cluster)?;
        for slot in 0..DPC {
            let index = cluster_index * DPC + slot;
            if index >= total_slots {
                break;
            }
            let entry = value.dir_entry(slot);
            if entry.is_unoccupied() {
                if entry.is_free_clean() {
                    scan.first_free_clean.get_or_insert(index);
                } else {
                    scan.first_free_dirty.get_or_insert(index);
                }
                continue;
            }
            if scan.found.is_none() {
                if let (Some(wanted), Some(inode)) = (name, entry.inode) {
                    if entry.matches(wanted) {
                        scan.found = Some((index, inode));
                    }
                }
            }
        }
        if scan.found.is_some() && scan.first_free_clean.is_some() {
            break;
        }
    }
    Ok(scan)
}

// ── Lookup ──────────────────────────────────────────────────────────────────

/// Locate a live entry named `name` in the directory; the caller needs
/// execute permission on it. Returns the entry's inode number and its slot
/// index.
pub fn get_dir_entry_by_name(
    cache: &mut BufferCache,
    dir: InodeNumber,
    name: &str,
    cred: Credentials,
) -> Result<(InodeNumber, u32)> {
    check_name(name)?;
    let inode = read_dir_inode(cache, dir)?;
    access_check(cache, dir, AccessMode::X, cred)?;

    let scan = scan_dir(cache, dir, &inode, Some(name))?;
    match scan.found {
        Some((index, entry)) => Ok((entry, index)),
        None => Err(SofsError::NotFound(name.to_owned())),
    }
}

// ── Add ─────────────────────────────────────────────────────────────────────

/// Add an entry `name → entry_inode` to the directory.
///
/// A directory entry gets its first cluster initialised with `.`/`..` and
/// both link counts are raised; writes are ordered payload cluster, entry
/// inode, directory inode, so a crash never leaves a dangling
/// back-reference without a forward one.
pub fn add_dir_entry(
    cache: &mut BufferCache,
    dir: InodeNumber,
    name: &str,
    entry_inode: InodeNumber,
    cred: Credentials,
) -> Result<()> {
    check_name(name)?;
    let dir_value = read_dir_inode(cache, dir)?;
    access_check(cache, dir, AccessMode::X, cred)?;
    access_check(cache, dir, AccessMode::W, cred)?;

    let entry_value = read_inode(cache, entry_inode, InodeStatus::InUse)?;
    let is_dir = entry_value.is_directory();

    let scan = scan_dir(cache, dir, &dir_value, Some(name))?;
    if scan.found.is_some() {
        return Err(SofsError::AlreadyExists(name.to_owned()));
    }

    // Refcount bumps: the new name entry, plus for directories the child's
    // own `.` and the parent's new `..` edge.
    let entry_bump: u16 = if is_dir { 2 } else { 1 };
    if entry_value.refcount.checked_add(entry_bump).is_none() {
        return Err(SofsError::TooManyLinks);
    }
    if is_dir && dir_value.refcount == u16::MAX {
        return Err(SofsError::TooManyLinks);
    }

    if is_dir {
        init_child_directory(cache, entry_inode, dir)?;
    }

    // Payload first: place the entry, growing by one cluster if no free
    // slot exists within the current size.
    let mut grew = false;
    let index = match scan.insertion_slot() {
        Some(index) => index,
        None => {
            let cluster_index = scan.total_slots / DPC;
            if cluster_index >= MAX_FILE_CLUSTERS {
                return Err(SofsError::DirectoryFull);
            }
            let cluster = alloc_file_cluster(cache, dir, cluster_index)?;
            let mut value = cache.fetch_cluster(cluster)?;
            for slot in 0..DPC {
                value.set_dir_entry(slot, &DirEntry::EMPTY);
            }
            cache.put_cluster(cluster, &value)?;
            grew = true;
            scan.total_slots
        }
    };
    write_slot(cache, dir, index, &DirEntry::new(name, entry_inode)?)?;

    // Entry inode second.
    let mut entry_value = read_inode(cache, entry_inode, InodeStatus::InUse)?;
    entry_value.refcount += entry_bump;
    write_inode(cache, entry_inode, &mut entry_value, InodeStatus::InUse)?;

    // Directory inode last.
    let mut dir_value = read_inode(cache, dir, InodeStatus::InUse)?;
    if grew {
        dir_value.size += ENTRY_CLUSTER_BYTES;
    }
    if is_dir {
        dir_value.refcount += 1;
    }
    write_inode(cache, dir, &mut dir_value, InodeStatus::InUse)?;

    trace!(target: "sofs::dir", dir = dir.0, entry = entry_inode.0, name, "entry added");
    Ok(())
}

/// Give a fresh directory inode its first cluster, with `.` and `..`
/// installed and every other slot empty.
fn init_child_directory(
    cache: &mut BufferCache,
    child: InodeNumber,
    parent: InodeNumber,
) -> Result<()> {
    let cluster = alloc_file_cluster(cache, child, 0)?;
    let mut value = cache.fetch_cluster(cluster)?;
    for slot in 0..DPC {
        value.set_dir_entry(slot, &DirEntry::EMPTY);
    }
    value.set_dir_entry(0, &DirEntry::new(".", child)?);
    value.set_dir_entry(1, &DirEntry::new("..", parent)?);
    cache.put_cluster(cluster, &value)?;

    let mut child_value = read_inode(cache, child, InodeStatus::InUse)?;
    child_value.size = ENTRY_CLUSTER_BYTES;
    write_inode(cache, child, &mut child_value, InodeStatus::InUse)
}

// ── Remove ──────────────────────────────────────────────────────────────────

/// Remove the entry named `name`; a directory entry must be empty.
///
/// The slot is marked dirty (leading name byte zeroed, residue kept). When
/// the entry's link count reaches zero its clusters are bulk-freed and the
/// inode is freed dirty; cleaning waits for reuse.
pub fn remove_dir_entry(
    cache: &mut BufferCache,
    dir: InodeNumber,
    name: &str,
    cred: Credentials,
) -> Result<()> {
    check_name(name)?;
    if name == "." || name == ".." {
        return Err(SofsError::InvalidName(name.to_owned()));
    }
    read_dir_inode(cache, dir)?;
    access_check(cache, dir, AccessMode::X, cred)?;
    access_check(cache, dir, AccessMode::W, cred)?;

    let (entry_inode, index) = get_dir_entry_by_name(cache, dir, name, cred)?;
    let entry_value = read_inode(cache, entry_inode, InodeStatus::InUse)?;
    let is_dir = entry_value.is_directory();
    if is_dir {
        check_directory_emptiness(cache, entry_inode)?;
    }

    // Payload first: dirty the slot but keep the residual bytes.
    let mut slot = read_slot(cache, dir, index)?;
    slot.mark_removed();
    write_slot(cache, dir, index, &slot)?;

    // Entry inode second: drop the name link, and for directories the
    // vanishing `.`/`..` pair.
    let mut entry_value = read_inode(cache, entry_inode, InodeStatus::InUse)?;
    entry_value.refcount = entry_value.refcount.saturating_sub(if is_dir { 2 } else { 1 });
    let gone = entry_value.refcount == 0;
    write_inode(cache, entry_inode, &mut entry_value, InodeStatus::InUse)?;

    if gone {
        handle_file_clusters(cache, entry_inode, 0, ReleaseOp::Free)?;
        free_inode(cache, entry_inode)?;
        debug!(target: "sofs::dir", inode = entry_inode.0, "last link removed, inode freed");
    }

    // Directory inode last.
    if is_dir {
        let mut dir_value = read_inode(cache, dir, InodeStatus::InUse)?;
        dir_value.refcount = dir_value.refcount.saturating_sub(1);
        write_inode(cache, dir, &mut dir_value, InodeStatus::InUse)?;
    }

    trace!(target: "sofs::dir", dir = dir.0, name, "entry removed");
    Ok(())
}

// ── Rename ──────────────────────────────────────────────────────────────────

/// Rewrite the name of an entry in place; the inode it references (and so
/// every link count) is untouched.
pub fn rename_dir_entry(
    cache: &mut BufferCache,
    dir: InodeNumber,
    old_name: &str,
    new_name: &str,
    cred: Credentials,
) -> Result<()> {
    check_name(old_name)?;
    check_name(new_name)?;
    read_dir_inode(cache, dir)?;
    access_check(cache, dir, AccessMode::X, cred)?;
    access_check(cache, dir, AccessMode::W, cred)?;

    let (entry_inode, index) = get_dir_entry_by_name(cache, dir, old_name, cred)?;
    if get_dir_entry_by_name(cache, dir, new_name, cred).is_ok() {
        return Err(SofsError::AlreadyExists(new_name.to_owned()));
    }

    write_slot(cache, dir, index, &DirEntry::new(new_name, entry_inode)?)?;
    trace!(target: "sofs::dir", dir = dir.0, old_name, new_name, "entry renamed");
    Ok(())
}

// ── Emptiness ───────────────────────────────────────────────────────────────

/// A directory is empty when slots 0/1 are `.` and `..` and every further
/// slot has a zeroed leading name byte.
pub fn check_directory_emptiness(cache: &mut BufferCache, dir: InodeNumber) -> Result<()> {
    let inode = read_dir_inode(cache, dir)?;
    let total_slots = inode.size / DIR_ENTRY_SIZE as u32;
    for index in 2..total_slots {
        let entry = read_slot(cache, dir, index)?;
        if entry.name[0] != 0 {
            return Err(SofsError::NotEmpty);
        }
    }
    Ok(())
}

// ── Attach / detach ─────────────────────────────────────────────────────────

/// Install `base → sub` for a fully-built directory `sub`, rewriting the
/// `..` inside it to point at the new base and bumping both link counts.
pub fn attach_directory(
    cache: &mut BufferCache,
    base: InodeNumber,
    name: &str,
    sub: InodeNumber,
    cred: Credentials,
) -> Result<()> {
    check_name(name)?;
    if name == "." || name == ".." {
        return Err(SofsError::InvalidName(name.to_owned()));
    }
    let base_value = read_dir_inode(cache, base)?;
    access_check(cache, base, AccessMode::X, cred)?;
    access_check(cache, base, AccessMode::W, cred)?;
    read_dir_inode(cache, sub)?;

    let scan = scan_dir(cache, base, &base_value, Some(name))?;
    if scan.found.is_some() {
        return Err(SofsError::AlreadyExists(name.to_owned()));
    }

    // Children before parents: repoint the sub's `..` first.
    write_slot(cache, sub, 1, &DirEntry::new("..", base)?)?;

    let mut grew = false;
    let index = match scan.insertion_slot() {
        Some(index) => index,
        None => {
            let cluster_index = scan.total_slots / DPC;
            if cluster_index >= MAX_FILE_CLUSTERS {
                return Err(SofsError::DirectoryFull);
            }
            let cluster = alloc_file_cluster(cache, base, cluster_index)?;
            let mut value = cache.fetch_cluster(cluster)?;
            for slot in 0..DPC {
                value.set_dir_entry(slot, &DirEntry::EMPTY);
            }
            cache.put_cluster(cluster, &value)?;
            grew = true;
            scan.total_slots
        }
    };
    write_slot(cache, base, index, &DirEntry::new(name, sub)?)?;

    let mut sub_value = read_inode(cache, sub, InodeStatus::InUse)?;
    sub_value.refcount = sub_value
        .refcount
        .checked_add(1)
        .ok_or(SofsError::TooManyLinks)?;
    write_inode(cache, sub, &mut sub_value, InodeStatus::InUse)?;

    let mut base_value = read_inode(cache, base, InodeStatus::InUse)?;
    if grew {
        base_value.size += ENTRY_CLUSTER_BYTES;
    }
    base_value.refcount = base_value
        .refcount
        .checked_add(1)
        .ok_or(SofsError::TooManyLinks)?;
    write_inode(cache, base, &mut base_value, InodeStatus::InUse)?;

    trace!(target: "sofs::dir", base = base.0, sub = sub.0, name, "directory attached");
    Ok(())
}

/// Undo an attach: drop the `base → sub` edge and both link counts. The
/// `..` inside the sub keeps pointing at the old base until the next
/// attach rewrites it.
pub fn detach_dir_entry(
    cache: &mut BufferCache,
    base: InodeNumber,
    name: &str,
    cred: Credentials,
) -> Result<()> {
    check_name(name)?;
    if name == "." || name == ".." {
        return Err(SofsError::InvalidName(name.to_owned()));
    }
    read_dir_inode(cache, base)?;
    access_check(cache, base, AccessMode::X, cred)?;
    access_check(cache, base, AccessMode::W, cred)?;

    let (sub, index) = get_dir_entry_by_name(cache, base, name, cred)?;
    read_dir_inode(cache, sub)?;

    let mut slot = read_slot(cache, base, index)?;
    slot.mark_removed();
    write_slot(cache, base, index, &slot)?;

    let mut sub_value = read_inode(cache, sub, InodeStatus::InUse)?;
    sub_value.refcount = sub_value.refcount.saturating_sub(1);
    write_inode(cache, sub, &mut sub_value, InodeStatus::InUse)?;

    let mut base_value = read_inode(cache, base, InodeStatus::InUse)?;
    base_value.refcount = base_value.refcount.saturating_sub(1);
    write_inode(cache, base, &mut base_value, InodeStatus::InUse)?;

    trace!(target: "sofs::dir", base = base.0, sub = sub.0, name, "directory detached");
    Ok(())
}

// ── Cross-directory move ────────────────────────────────────────────────────

/// Move `src_dir/src_name` to `dst_dir/dst_name`, displacing an existing
/// destination the way rename(2) does. Every step that can fail rolls back
/// the steps before it.
pub fn move_dir_entry(
    cache: &mut BufferCache,
    src_dir: InodeNumber,
    src_name: &str,
    dst_dir: InodeNumber,
    dst_name: &str,
    cred: Credentials,
) -> Result<()> {
    check_name(src_name)?;
    check_name(dst_name)?;
    if [src_name, dst_name].iter().any(|n| *n == "." || *n == "..") {
        return Err(SofsError::InvalidName(src_name.to_owned()));
    }
    if src_dir == dst_dir && src_name == dst_name {
        return Ok(());
    }

    let (moved, _) = get_dir_entry_by_name(cache, src_dir, src_name, cred)?;
    let moved_is_dir = read_inode(cache, moved, InodeStatus::InUse)?.is_directory();

    // A live destination is renamed to a collision-proof throwaway first,
    // and only actually removed once the move went through.
    let mut throwaway: Option<String> = None;
    if let Ok((displaced, _)) = get_dir_entry_by_name(cache, dst_dir, dst_name, cred) {
        let displaced_is_dir = read_inode(cache, displaced, InodeStatus::InUse)?.is_directory();
        if moved_is_dir && !displaced_is_dir {
            return Err(SofsError::NotDirectory);
        }
        if !moved_is_dir && displaced_is_dir {
            return Err(SofsError::IsDirectory);
        }
        if displaced_is_dir {
            check_directory_emptiness(cache, displaced)?;
        }
        let name = format!(".mv-{}", displaced.0);
        rename_dir_entry(cache, dst_dir, dst_name, &name, cred)?;
        throwaway = Some(name);
    }

    let moved_result = if src_dir == dst_dir {
        rename_dir_entry(cache, src_dir, src_name, dst_name, cred)
    } else if moved_is_dir {
        attach_directory(cache, dst_dir, dst_name, moved, cred).and_then(|()| {
            detach_dir_entry(cache, src_dir, src_name, cred).inspect_err(|_| {
                let _ = detach_dir_entry(cache, dst_dir, dst_name, cred);
                let _ = attach_directory(cache, src_dir, src_name, moved, cred);
            })
        })
    } else {
        add_dir_entry(cache, dst_dir, dst_name, moved, cred).and_then(|()| {
            remove_dir_entry(cache, src_dir, src_name, cred).inspect_err(|_| {
                let _ = remove_dir_entry(cache, dst_dir, dst_name, cred);
            })
        })
    };

    if let Err(error) = moved_result {
        if let Some(name) = throwaway {
            let _ = rename_dir_entry(cache, dst_dir, &name, dst_name, cred);
        }
        return Err(error);
    }

    if let Some(name) = throwaway {
        remove_dir_entry(cache, dst_dir, &name, cred).inspect_err(|_| {
            debug!(target: "sofs::dir", dir = dst_dir.0, name = %name, "throwaway removal failed");
        })?;
    }
    Ok(())
}

// ── Listing ─────────────────────────────────────────────────────────────────

/// Live entries of a directory in slot order, `.`/`..` included. The
/// caller needs read permission.
pub fn list_dir_entries(
    cache: &mut BufferCache,
    dir: InodeNumber,
    cred: Credentials,
) -> Result<Vec<(String, InodeNumber)>> {
    let inode = read_dir_inode(cache, dir)?;
    access_check(cache, dir, AccessMode::R, cred)?;

    let total_slots = inode.size / DIR_ENTRY_SIZE as u32;
    let mut entries = Vec::new();
    for index in 0..total_slots {
        let entry = read_slot(cache, dir, index)?;
        if !entry.is_unoccupied() {
            if let Some(inode) = entry.inode {
                entries.push((entry.name_str(), inode));
            }
        }
    }
    Ok(entries)
}
