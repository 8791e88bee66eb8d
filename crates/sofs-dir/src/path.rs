//! Path resolution: recursive descent over absolute paths with exactly one
//! level of symbolic-link expansion.

use crate::{get_dir_entry_by_name, read_dir_inode};
use sofs_block::BufferCache;
use sofs_error::{Result, SofsError};
use sofs_file::read_symlink_target;
use sofs_inode::{access_check, read_inode, InodeStatus};
use sofs_types::{AccessMode, Credentials, InodeNumber, MAX_NAME, MAX_PATH, MAX_SYMLINK};

/// Split an absolute path into its dirname and final component.
///
/// Trailing slashes are ignored; the root path yields `("/", ".")` so a
/// lookup of `/` lands on the root directory's own `.` entry.
#[must_use]
pub fn split_last_component(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return ("/".to_owned(), ".".to_owned());
    }
    match trimmed.rfind('/') {
        Some(0) => ("/".to_owned(), trimmed[1..].to_owned()),
        Some(pos) => (trimmed[..pos].to_owned(), trimmed[pos + 1..].to_owned()),
        None => ("/".to_owned(), trimmed.to_owned()),
    }
}

/// Resolve an absolute path to the inode of its final component and of the
/// directory holding it.
///
/// Every component but the last must be a directory the caller may
/// traverse (execute permission). A component resolving to a symbolic link
/// is expanded once; a second expansion fails with the loop error.
pub fn get_dir_entry_by_path(
    cache: &mut BufferCache,
    path: &str,
    cred: Credentials,
) -> Result<(InodeNumber, InodeNumber)> {
    if path.len() > MAX_PATH {
        return Err(SofsError::NameTooLong);
    }
    if !path.starts_with('/') {
        return Err(SofsError::NotAbsolutePath);
    }
    let mut expansions = 0_u32;
    traverse(cache, path, InodeNumber::ROOT, cred, &mut expansions)
}

fn traverse(
    cache: &mut BufferCache,
    path: &str,
    root: InodeNumber,
    cred: Credentials,
    expansions: &mut u32,
) -> Result<(InodeNumber, InodeNumber)> {
    if path.len() > MAX_PATH {
        return Err(SofsError::NameTooLong);
    }
    let (dirname, basename) = split_last_component(path);
    if basename.len() > MAX_NAME {
        return Err(SofsError::NameTooLong);
    }

    let parent = if dirname == "/" {
        root
    } else {
        traverse(cache, &dirname, root, cred, expansions)?.1
    };

    let parent_value = read_inode(cache, parent, InodeStatus::InUse)?;
    if !parent_value.is_directory() {
        return Err(SofsError::NotDirectory);
    }
    read_dir_inode(cache, parent)?;
    access_check(cache, parent, AccessMode::X, cred)?;

    let (entry, _) = get_dir_entry_by_name(cache, parent, &basename, cred)?;
    let entry_value = read_inode(cache, entry, InodeStatus::InUse)?;
    if entry_value.is_symlink() {
        if *expansions >= MAX_SYMLINK {
            return Err(SofsError::SymlinkLoop);
        }
        *expansions += 1;
        let target = read_symlink_target(cache, entry)?;
        let (next_path, next_root) = normalise_target(cache, &target, parent, cred)?;
        return traverse(cache, &next_path, next_root, cred, expansions);
    }

    Ok((parent, entry))
}

/// Rewrite a symlink target as an absolute-shaped path plus the directory
/// it is anchored at: `/…` is anchored at the volume root, `./…` at the
/// directory holding the link, `../…` at that directory's parent, and a
/// bare name at the holding directory.
fn normalise_target(
    cache: &mut BufferCache,
    target: &str,
    current_dir: InodeNumber,
    cred: Credentials,
) -> Result<(String, InodeNumber)> {
    if target.is_empty() {
        return Err(SofsError::NotFound(String::new()));
    }
    if target.starts_with('/') {
        return Ok((target.to_owned(), InodeNumber::ROOT));
    }
    if target == ".." || target.starts_with("../") {
        let (parent, _) = get_dir_entry_by_name(cache, current_dir, "..", cred)?;
        let rest = &target[2..];
        let path = if rest.is_empty() { "/." } else { rest };
        return Ok((path.to_owned(), parent));
    }
    if target == "." || target.starts_with("./") {
        let rest = &target[1..];
        let path = if rest.is_empty() { "/." } else { rest };
        return Ok((path.to_owned(), current_dir));
    }
    Ok((format!("/{target}"), current_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::add_dir_entry;
    use sofs_alloc::alloc_inode;
    use sofs_block::{BufferCache, MemDevice};
    use sofs_file::write_symlink_target;
    use sofs_mkfs::{format_device, FormatOptions};
    use sofs_ondisk::FileKind;
    use sofs_types::BLOCK_SIZE;

    const ROOT: InodeNumber = InodeNumber::ROOT;
    const CRED: Credentials = Credentials::ROOT;

    fn fresh_volume() -> BufferCache {
        let mut cache = BufferCache::new(Box::new(MemDevice::zeroed(400 * BLOCK_SIZE))).unwrap();
        format_device(&mut cache, &FormatOptions::default()).unwrap();
        cache.load_superblock().unwrap();
        cache
    }

    fn new_inode(cache: &mut BufferCache, kind: FileKind, perms: u16) -> InodeNumber {
        let ino = alloc_inode(cache, kind, CRED).unwrap();
        let mut value = cache.fetch_inode(ino).unwrap();
        value.mode.perms = perms;
        cache.put_inode(ino, &value).unwrap();
        ino
    }

    fn mkdir(cache: &mut BufferCache, parent: InodeNumber, name: &str) -> InodeNumber {
        let ino = new_inode(cache, FileKind::Directory, 0o755);
        add_dir_entry(cache, parent, name, ino, CRED).unwrap();
        ino
    }

    fn mkfile(cache: &mut BufferCache, parent: InodeNumber, name: &str) -> InodeNumber {
        let ino = new_inode(cache, FileKind::Regular, 0o644);
        add_dir_entry(cache, parent, name, ino, CRED).unwrap();
        ino
    }

    fn symlink(cache: &mut BufferCache, parent: InodeNumber, name: &str, target: &str) -> InodeNumber {
        let ino = new_inode(cache, FileKind::Symlink, 0o777);
        write_symlink_target(cache, ino, target).unwrap();
        add_dir_entry(cache, parent, name, ino, CRED).unwrap();
        ino
    }

    #[test]
    fn split_component_cases() {
        assert_eq!(
            split_last_component("/a/b/c"),
            ("/a/b".to_owned(), "c".to_owned())
        );
        assert_eq!(split_last_component("/a"), ("/".to_owned(), "a".to_owned()));
        assert_eq!(split_last_component("/"), ("/".to_owned(), ".".to_owned()));
        assert_eq!(
            split_last_component("/a/b/"),
            ("/a".to_owned(), "b".to_owned())
        );
    }

    #[test]
    fn resolves_nested_paths() {
        let mut cache = fresh_volume();
        let a = mkdir(&mut cache, ROOT, "a");
        let b = mkdir(&mut cache, a, "b");
        let c = mkfile(&mut cache, b, "c");

        assert_eq!(
            get_dir_entry_by_path(&mut cache, "/a/b/c", CRED).unwrap(),
            (b, c)
        );
        assert_eq!(
            get_dir_entry_by_path(&mut cache, "/a/b", CRED).unwrap(),
            (a, b)
        );
        assert_eq!(
            get_dir_entry_by_path(&mut cache, "/", CRED).unwrap(),
            (ROOT, ROOT)
        );
        assert_eq!(
            get_dir_entry_by_path(&mut cache, "/a/..", CRED).unwrap().1,
            ROOT
        );
    }

    #[test]
    fn rejects_bad_paths() {
        let mut cache = fresh_volume();
        assert!(matches!(
            get_dir_entry_by_path(&mut cache, "a/b", CRED),
            Err(SofsError::NotAbsolutePath)
        ));
        assert!(matches!(
            get_dir_entry_by_path(&mut cache, "/missing", CRED),
            Err(SofsError::NotFound(_))
        ));
        let long = format!("/{}", "x".repeat(MAX_PATH));
        assert!(matches!(
            get_dir_entry_by_path(&mut cache, &long, CRED),
            Err(SofsError::NameTooLong)
        ));
        let long_component = format!("/{}", "x".repeat(MAX_NAME + 1));
        assert!(matches!(
            get_dir_entry_by_path(&mut cache, &long_component, CRED),
            Err(SofsError::NameTooLong)
        ));
    }

    #[test]
    fn file_in_the_middle_is_not_a_directory() {
        let mut cache = fresh_volume();
        mkfile(&mut cache, ROOT, "f");
        assert!(matches!(
            get_dir_entry_by_path(&mut cache, "/f/deeper", CRED),
            Err(SofsError::NotDirectory)
        ));
    }

    #[test]
    fn absolute_symlink_expands_once() {
        let mut cache = fresh_volume();
        let d = mkdir(&mut cache, ROOT, "d");
        let f = mkfile(&mut cache, d, "f");
        symlink(&mut cache, ROOT, "s", "/d/f");

        assert_eq!(
            get_dir_entry_by_path(&mut cache, "/s", CRED).unwrap(),
            (d, f)
        );
    }

    #[test]
    fn relative_symlink_forms() {
        let mut cache = fresh_volume();
        let d = mkdir(&mut cache, ROOT, "d");
        let e = mkdir(&mut cache, ROOT, "e");
        let f = mkfile(&mut cache, d, "f");
        let g = mkfile(&mut cache, e, "g");

        // `../d/f` inside /e: anchored at e's parent (the root).
        symlink(&mut cache, e, "up", "../d/f");
        assert_eq!(
            get_dir_entry_by_path(&mut cache, "/e/up", CRED).unwrap(),
            (d, f)
        );

        // `./g` inside /e: anchored at /e itself.
        symlink(&mut cache, e, "here", "./g");
        assert_eq!(
            get_dir_entry_by_path(&mut cache, "/e/here", CRED).unwrap(),
            (e, g)
        );

        // Bare name inside /d.
        symlink(&mut cache, d, "plain", "f");
        assert_eq!(
            get_dir_entry_by_path(&mut cache, "/d/plain", CRED).unwrap(),
            (d, f)
        );
    }

    #[test]
    fn second_symlink_reports_loop() {
        let mut cache = fresh_volume();
        let d = mkdir(&mut cache, ROOT, "d");
        mkfile(&mut cache, d, "f");
        symlink(&mut cache, ROOT, "s", "/d/f");
        symlink(&mut cache, ROOT, "t", "/s");

        assert!(matches!(
            get_dir_entry_by_path(&mut cache, "/t", CRED),
            Err(SofsError::SymlinkLoop)
        ));
        // A self-referential link trips the same guard.
        symlink(&mut cache, ROOT, "me", "/me");
        assert!(matches!(
            get_dir_entry_by_path(&mut cache, "/me", CRED),
            Err(SofsError::SymlinkLoop)
        ));
    }

    #[test]
    fn missing_execute_on_component_is_eacces_flavour() {
        let mut cache = fresh_volume();
        let owner = Credentials::new(100, 100);
        let locked = new_inode(&mut cache, FileKind::Directory, 0o755);
        add_dir_entry(&mut cache, ROOT, "locked", locked, CRED).unwrap();
        mkfile(&mut cache, locked, "f");
        let mut value = cache.fetch_inode(locked).unwrap();
        value.mode.perms = 0o600;
        value.owner = owner.uid;
        cache.put_inode(locked, &value).unwrap();

        assert!(matches!(
            get_dir_entry_by_path(&mut cache, "/locked/f", owner),
            Err(SofsError::ExecDenied)
        ));
    }
}
