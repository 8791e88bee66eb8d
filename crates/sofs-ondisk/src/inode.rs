//! Inode records: 64 bytes each, `IPB` per block of the inode table.
//!
//! An inode is in exactly one of three states: in use, free in the clean
//! state, or free in the dirty state. The two timestamp words double as the
//! free-list linkage when the inode is free, so the decoded representation
//! carries them as a tagged variant chosen by the mode's free bit.

use sofs_types::{
    put_le_u16, put_le_u32, read_le_u16, read_le_u32, ClusterNumber, CodecError, InodeNumber,
    INODE_SIZE, N_DIRECT,
};

/// File-type bit: directory.
pub const MODE_DIR: u16 = 0x1000;
/// File-type bit: regular file.
pub const MODE_FILE: u16 = 0x2000;
/// File-type bit: symbolic link.
pub const MODE_SYMLINK: u16 = 0x4000;
/// The inode is free; combined with stale type bits it marks the dirty state.
pub const MODE_FREE: u16 = 0x8000;
/// Mask covering all type bits.
pub const MODE_TYPE_MASK: u16 = 0xF000;
/// Mask covering the nine rwxrwxrwx permission bits.
pub const MODE_PERM_MASK: u16 = 0o777;

/// Legal file types of an in-use inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Directory,
    Regular,
    Symlink,
}

impl FileKind {
    #[must_use]
    pub fn type_bit(self) -> u16 {
        match self {
            Self::Directory => MODE_DIR,
            Self::Regular => MODE_FILE,
            Self::Symlink => MODE_SYMLINK,
        }
    }

    fn from_type_bits(bits: u16) -> Result<Option<Self>, CodecError> {
        match bits & !MODE_FREE & MODE_TYPE_MASK {
            0 => Ok(None),
            MODE_DIR => Ok(Some(Self::Directory)),
            MODE_FILE => Ok(Some(Self::Regular)),
            MODE_SYMLINK => Ok(Some(Self::Symlink)),
            _ => Err(CodecError::InvalidField {
                field: "mode",
                reason: "more than one file-type bit set",
            }),
        }
    }
}

/// Decoded mode word: free bit, file type and permission bits.
///
/// `kind == None` is only meaningful together with `free` (a clean free
/// inode); serialisation reconstructs the raw word exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub free: bool,
    pub kind: Option<FileKind>,
    pub perms: u16,
}

impl Mode {
    #[must_use]
    pub fn in_use(kind: FileKind, perms: u16) -> Self {
        Self {
            free: false,
            kind: Some(kind),
            perms: perms & MODE_PERM_MASK,
        }
    }

    /// The mode of a clean free inode: the free bit alone.
    #[must_use]
    pub fn free_clean() -> Self {
        Self {
            free: true,
            kind: None,
            perms: 0,
        }
    }

    pub fn decode(raw: u16) -> Result<Self, CodecError> {
        Ok(Self {
            free: raw & MODE_FREE != 0,
            kind: FileKind::from_type_bits(raw)?,
            perms: raw & MODE_PERM_MASK,
        })
    }

    #[must_use]
    pub fn encode(self) -> u16 {
        let mut raw = self.perms & MODE_PERM_MASK;
        if let Some(kind) = self.kind {
            raw |= kind.type_bit();
        }
        if self.free {
            raw |= MODE_FREE;
        }
        raw
    }
}

/// The two overlay words: timestamps while in use, free-list linkage while
/// free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeAux {
    Stamps { atime: u32, mtime: u32 },
    FreeLink {
        next: Option<InodeNumber>,
        prev: Option<InodeNumber>,
    },
}

impl InodeAux {
    /// The free-list linkage, if this inode carries one.
    #[must_use]
    pub fn free_link(self) -> Option<(Option<InodeNumber>, Option<InodeNumber>)> {
        match self {
            Self::FreeLink { next, prev } => Some((next, prev)),
            Self::Stamps { .. } => None,
        }
    }
}

/// A decoded inode record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub mode: Mode,
    pub refcount: u16,
    pub owner: u32,
    pub group: u32,
    pub size: u32,
    pub clucount: u32,
    pub aux: InodeAux,
    pub direct: [Option<ClusterNumber>; N_DIRECT],
    pub i1: Option<ClusterNumber>,
    pub i2: Option<ClusterNumber>,
}

const OFF_MODE: usize = 0x00;
const OFF_REFCOUNT: usize = 0x02;
const OFF_OWNER: usize = 0x04;
const OFF_GROUP: usize = 0x08;
const OFF_SIZE: usize = 0x0C;
const OFF_CLUCOUNT: usize = 0x10;
const OFF_VD1: usize = 0x14;
const OFF_VD2: usize = 0x18;
const OFF_DIRECT: usize = 0x1C;
const OFF_I1: usize = 0x38;
const OFF_I2: usize = 0x3C;

impl Inode {
    /// A freshly allocated in-use inode with no content yet.
    #[must_use]
    pub fn new_in_use(kind: FileKind, perms: u16, owner: u32, group: u32, now: u32) -> Self {
        Self {
            mode: Mode::in_use(kind, perms),
            refcount: 0,
            owner,
            group,
            size: 0,
            clucount: 0,
            aux: InodeAux::Stamps {
                atime: now,
                mtime: now,
            },
            direct: [None; N_DIRECT],
            i1: None,
            i2: None,
        }
    }

    /// A clean free inode holding only its free-list linkage.
    #[must_use]
    pub fn free_clean(next: Option<InodeNumber>, prev: Option<InodeNumber>) -> Self {
        Self {
            mode: Mode::free_clean(),
            refcount: 0,
            owner: 0,
            group: 0,
            size: 0,
            clucount: 0,
            aux: InodeAux::FreeLink { next, prev },
            direct: [None; N_DIRECT],
            i1: None,
            i2: None,
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < INODE_SIZE {
            return Err(CodecError::InsufficientData {
                needed: INODE_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }

        let mode = Mode::decode(read_le_u16(data, OFF_MODE)?)?;
        let vd1 = read_le_u32(data, OFF_VD1)?;
        let vd2 = read_le_u32(data, OFF_VD2)?;
        let aux = if mode.free {
            InodeAux::FreeLink {
                next: InodeNumber::decode(vd1),
                prev: InodeNumber::decode(vd2),
            }
        } else {
            InodeAux::Stamps {
                atime: vd1,
                mtime: vd2,
            }
        };

        let mut direct = [None; N_DIRECT];
        for (slot, entry) in direct.iter_mut().enumerate() {
            *entry = ClusterNumber::decode(read_le_u32(data, OFF_DIRECT + 4 * slot)?);
        }

        Ok(Self {
            mode,
            refcount: read_le_u16(data, OFF_REFCOUNT)?,
            owner: read_le_u32(data, OFF_OWNER)?,
            group: read_le_u32(data, OFF_GROUP)?,
            size: read_le_u32(data, OFF_SIZE)?,
            clucount: read_le_u32(data, OFF_CLUCOUNT)?,
            aux,
            direct,
            i1: ClusterNumber::decode(read_le_u32(data, OFF_I1)?),
            i2: ClusterNumber::decode(read_le_u32(data, OFF_I2)?),
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; INODE_SIZE] {
        let mut data = [0_u8; INODE_SIZE];
        put_le_u16(&mut data, OFF_MODE, self.mode.encode());
        put_le_u16(&mut data, OFF_REFCOUNT, self.refcount);
        put_le_u32(&mut data, OFF_OWNER, self.owner);
        put_le_u32(&mut data, OFF_GROUP, self.group);
        put_le_u32(&mut data, OFF_SIZE, self.size);
        put_le_u32(&mut data, OFF_CLUCOUNT, self.clucount);
        let (vd1, vd2) = match self.aux {
            InodeAux::Stamps { atime, mtime } => (atime, mtime),
            InodeAux::FreeLink { next, prev } => {
                (InodeNumber::encode(next), InodeNumber::encode(prev))
            }
        };
        put_le_u32(&mut data, OFF_VD1, vd1);
        put_le_u32(&mut data, OFF_VD2, vd2);
        for (slot, entry) in self.direct.iter().enumerate() {
            put_le_u32(&mut data, OFF_DIRECT + 4 * slot, ClusterNumber::encode(*entry));
        }
        put_le_u32(&mut data, OFF_I1, ClusterNumber::encode(self.i1));
        put_le_u32(&mut data, OFF_I2, ClusterNumber::encode(self.i2));
        data
    }

    #[must_use]
    pub fn is_in_use(&self) -> bool {
        !self.mode.free
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.mode.free
    }

    /// True when free with every content field scrubbed: ready for reuse
    /// without a cleaning pass.
    #[must_use]
    pub fn is_free_clean(&self) -> bool {
        self.mode.free
            && self.mode.kind.is_none()
            && self.mode.perms == 0
            && self.refcount == 0
            && self.size == 0
            && self.clucount == 0
            && self.direct.iter().all(Option::is_none)
            && self.i1.is_none()
            && self.i2.is_none()
    }

    #[must_use]
    pub fn is_free_dirty(&self) -> bool {
        self.mode.free && !self.is_free_clean()
    }

    #[must_use]
    pub fn kind(&self) -> Option<FileKind> {
        self.mode.kind
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.is_in_use() && self.mode.kind == Some(FileKind::Directory)
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.is_in_use() && self.mode.kind == Some(FileKind::Symlink)
    }

    /// Stamp the last-access time; only meaningful on an in-use inode.
    pub fn touch_atime(&mut self, now: u32) {
        if let InodeAux::Stamps { atime, .. } = &mut self.aux {
            *atime = now;
        }
    }

    /// Stamp both access and modification times.
    pub fn touch_atime_mtime(&mut self, now: u32) {
        if let InodeAux::Stamps { atime, mtime } = &mut self.aux {
            *atime = now;
            *mtime = now;
        }
    }
}

/// Decode a full inode-table block into its `IPB` records.
pub fn decode_inode_block(data: &[u8]) -> Result<Vec<Inode>, CodecError> {
    if data.len() < sofs_types::BLOCK_SIZE {
        return Err(CodecError::InsufficientData {
            needed: sofs_types::BLOCK_SIZE,
            offset: 0,
            actual: data.len(),
        });
    }
    (0..sofs_types::IPB as usize)
        .map(|slot| Inode::decode(&data[slot * INODE_SIZE..(slot + 1) * INODE_SIZE]))
        .collect()
}

/// Encode `IPB` inode records back into a block-sized buffer.
#[must_use]
pub fn encode_inode_block(inodes: &[Inode]) -> Vec<u8> {
    let mut data = vec![0_u8; sofs_types::BLOCK_SIZE];
    for (slot, inode) in inodes.iter().take(sofs_types::IPB as usize).enumerate() {
        data[slot * INODE_SIZE..(slot + 1) * INODE_SIZE].copy_from_slice(&inode.encode());
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_all_states() {
        let in_use = Mode::in_use(FileKind::Directory, 0o755);
        assert_eq!(Mode::decode(in_use.encode()).unwrap(), in_use);
        assert_eq!(in_use.encode(), MODE_DIR | 0o755);

        let clean = Mode::free_clean();
        assert_eq!(clean.encode(), MODE_FREE);
        assert_eq!(Mode::decode(MODE_FREE).unwrap(), clean);

        // Free-dirty keeps the stale type and permission bits.
        let dirty_raw = MODE_FREE | MODE_FILE | 0o644;
        let dirty = Mode::decode(dirty_raw).unwrap();
        assert!(dirty.free);
        assert_eq!(dirty.kind, Some(FileKind::Regular));
        assert_eq!(dirty.encode(), dirty_raw);
    }

    #[test]
    fn mode_rejects_conflicting_type_bits() {
        assert!(Mode::decode(MODE_DIR | MODE_FILE).is_err());
    }

    #[test]
    fn inode_round_trip_in_use() {
        let mut inode = Inode::new_in_use(FileKind::Regular, 0o644, 1000, 1000, 1_700_000_000);
        inode.refcount = 1;
        inode.size = 4242;
        inode.clucount = 3;
        inode.direct[0] = Some(ClusterNumber(5));
        inode.direct[6] = Some(ClusterNumber(9));
        inode.i1 = Some(ClusterNumber(11));

        let decoded = Inode::decode(&inode.encode()).unwrap();
        assert_eq!(decoded, inode);
        assert!(decoded.is_in_use());
        assert!(!decoded.is_free_clean());
    }

    #[test]
    fn inode_round_trip_free_states() {
        let clean = Inode::free_clean(Some(InodeNumber(2)), None);
        let decoded = Inode::decode(&clean.encode()).unwrap();
        assert_eq!(decoded, clean);
        assert!(decoded.is_free_clean());
        assert_eq!(
            decoded.aux.free_link(),
            Some((Some(InodeNumber(2)), None))
        );

        // Free-dirty: free bit set but stale content left behind.
        let mut dirty = clean;
        dirty.mode.kind = Some(FileKind::Regular);
        dirty.size = 100;
        dirty.direct[0] = Some(ClusterNumber(4));
        let decoded = Inode::decode(&dirty.encode()).unwrap();
        assert!(decoded.is_free_dirty());
        assert!(!decoded.is_free_clean());
    }

    #[test]
    fn timestamp_words_overlay_free_links() {
        let inode = Inode::new_in_use(FileKind::Regular, 0o600, 0, 0, 77);
        let raw = inode.encode();
        assert_eq!(read_le_u32(&raw, OFF_VD1).unwrap(), 77);

        let free = Inode::free_clean(Some(InodeNumber(77)), Some(InodeNumber(3)));
        let raw = free.encode();
        assert_eq!(read_le_u32(&raw, OFF_VD1).unwrap(), 77);
        assert_eq!(read_le_u32(&raw, OFF_VD2).unwrap(), 3);
    }

    #[test]
    fn touch_only_affects_in_use() {
        let mut inode = Inode::new_in_use(FileKind::Regular, 0o600, 0, 0, 1);
        inode.touch_atime(50);
        inode.touch_atime_mtime(60);
        assert_eq!(
            inode.aux,
            InodeAux::Stamps {
                atime: 60,
                mtime: 60
            }
        );

        let mut free = Inode::free_clean(None, None);
        free.touch_atime(50);
        assert_eq!(free.aux, InodeAux::FreeLink { next: None, prev: None });
    }

    #[test]
    fn inode_block_round_trip() {
        let mut inodes = vec![Inode::free_clean(None, None); sofs_types::IPB as usize];
        inodes[0] = Inode::new_in_use(FileKind::Directory, 0o777, 0, 0, 9);
        inodes[3].aux = InodeAux::FreeLink {
            next: Some(InodeNumber(4)),
            prev: Some(InodeNumber(2)),
        };

        let block = encode_inode_block(&inodes);
        assert_eq!(block.len(), sofs_types::BLOCK_SIZE);
        let decoded = decode_inode_block(&block).unwrap();
        assert_eq!(decoded, inodes);
    }
}
