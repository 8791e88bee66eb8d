//! Data clusters: a 12-byte header (`prev`, `next`, `stat`) followed by
//! `BSLPC` payload bytes, interpreted as raw file bytes, an array of
//! directory entries, or a flat array of cluster references.

use sofs_error::{Result, SofsError};
use sofs_types::{
    put_le_u32, read_le_u32, ClusterNumber, CodecError, InodeNumber, BSLPC, CLUSTER_HEADER_SIZE,
    CLUSTER_SIZE, DIR_ENTRY_SIZE, DPC, MAX_NAME, RPC,
};

/// The three header words of every data cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClusterHeader {
    pub prev: Option<ClusterNumber>,
    pub next: Option<ClusterNumber>,
    pub stat: Option<InodeNumber>,
}

impl ClusterHeader {
    /// Header of a cluster allocated to `inode`.
    #[must_use]
    pub fn allocated_to(inode: InodeNumber) -> Self {
        Self {
            prev: None,
            next: None,
            stat: Some(inode),
        }
    }

    /// True when the header matches the allocated shape: no linkage, a
    /// stamped owner.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.prev.is_none() && self.next.is_none() && self.stat.is_some()
    }

    /// True when the header matches the free-clean shape: everything null.
    #[must_use]
    pub fn is_free_clean(&self) -> bool {
        self.prev.is_none() && self.next.is_none() && self.stat.is_none()
    }
}

/// A decoded data cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCluster {
    pub header: ClusterHeader,
    payload: Box<[u8]>,
}

impl DataCluster {
    /// A cluster with a zeroed payload.
    #[must_use]
    pub fn zeroed(header: ClusterHeader) -> Self {
        Self {
            header,
            payload: vec![0_u8; BSLPC].into_boxed_slice(),
        }
    }

    /// A reference cluster: every payload slot set to the null reference.
    #[must_use]
    pub fn blank_refs(header: ClusterHeader) -> Self {
        let mut cluster = Self::zeroed(header);
        for slot in 0..RPC {
            cluster.set_ref(slot, None);
        }
        cluster
    }

    /// A directory cluster: every entry slot empty.
    #[must_use]
    pub fn blank_dir(header: ClusterHeader) -> Self {
        let mut cluster = Self::zeroed(header);
        for slot in 0..DPC {
            cluster.set_dir_entry(slot, &DirEntry::EMPTY);
        }
        cluster
    }

    pub fn decode(data: &[u8]) -> std::result::Result<Self, CodecError> {
        if data.len() < CLUSTER_SIZE {
            return Err(CodecError::InsufficientData {
                needed: CLUSTER_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }
        let header = ClusterHeader {
            prev: ClusterNumber::decode(read_le_u32(data, 0)?),
            next: ClusterNumber::decode(read_le_u32(data, 4)?),
            stat: InodeNumber::decode(read_le_u32(data, 8)?),
        };
        Ok(Self {
            header,
            payload: data[CLUSTER_HEADER_SIZE..CLUSTER_SIZE].into(),
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![0_u8; CLUSTER_SIZE];
        put_le_u32(&mut data, 0, ClusterNumber::encode(self.header.prev));
        put_le_u32(&mut data, 4, ClusterNumber::encode(self.header.next));
        put_le_u32(&mut data, 8, InodeNumber::encode(self.header.stat));
        data[CLUSTER_HEADER_SIZE..].copy_from_slice(&self.payload);
        data
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// Zero the whole payload area.
    pub fn zero_payload(&mut self) {
        self.payload.fill(0);
    }

    // ── Reference-array view ────────────────────────────────────────────

    /// Read reference slot `slot` (< `RPC`).
    #[must_use]
    pub fn ref_at(&self, slot: u32) -> Option<ClusterNumber> {
        let offset = slot as usize * 4;
        let raw = u32::from_le_bytes([
            self.payload[offset],
            self.payload[offset + 1],
            self.payload[offset + 2],
            self.payload[offset + 3],
        ]);
        ClusterNumber::decode(raw)
    }

    /// Write reference slot `slot` (< `RPC`).
    pub fn set_ref(&mut self, slot: u32, value: Option<ClusterNumber>) {
        let offset = slot as usize * 4;
        self.payload[offset..offset + 4].copy_from_slice(&ClusterNumber::encode(value).to_le_bytes());
    }

    /// True when every reference slot is null.
    #[must_use]
    pub fn refs_all_null(&self) -> bool {
        (0..RPC).all(|slot| self.ref_at(slot).is_none())
    }

    /// All non-null references in slot order.
    pub fn iter_refs(&self) -> impl Iterator<Item = ClusterNumber> + '_ {
        (0..RPC).filter_map(|slot| self.ref_at(slot))
    }

    // ── Directory-entry view ────────────────────────────────────────────

    /// Read directory-entry slot `slot` (< `DPC`).
    #[must_use]
    pub fn dir_entry(&self, slot: u32) -> DirEntry {
        let offset = slot as usize * DIR_ENTRY_SIZE;
        let mut name = [0_u8; MAX_NAME + 1];
        name.copy_from_slice(&self.payload[offset..offset + MAX_NAME + 1]);
        let raw = u32::from_le_bytes([
            self.payload[offset + MAX_NAME + 1],
            self.payload[offset + MAX_NAME + 2],
            self.payload[offset + MAX_NAME + 3],
            self.payload[offset + MAX_NAME + 4],
        ]);
        DirEntry {
            name,
            inode: InodeNumber::decode(raw),
        }
    }

    /// Write directory-entry slot `slot` (< `DPC`).
    pub fn set_dir_entry(&mut self, slot: u32, entry: &DirEntry) {
        let offset = slot as usize * DIR_ENTRY_SIZE;
        self.payload[offset..offset + MAX_NAME + 1].copy_from_slice(&entry.name);
        self.payload[offset + MAX_NAME + 1..offset + DIR_ENTRY_SIZE]
            .copy_from_slice(&InodeNumber::encode(entry.inode).to_le_bytes());
    }
}

/// A fixed-size directory entry: a nul-terminated base name and the inode
/// number it references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; MAX_NAME + 1],
    pub inode: Option<InodeNumber>,
}

impl DirEntry {
    /// A never-used slot: empty name, null inode.
    pub const EMPTY: Self = Self {
        name: [0; MAX_NAME + 1],
        inode: None,
    };

    /// Build an entry after validating the name: non-empty, no `/`, no
    /// interior nul, at most `MAX_NAME` bytes.
    pub fn new(name: &str, inode: InodeNumber) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.contains(&b'/') || bytes.contains(&0) {
            return Err(SofsError::InvalidName(name.to_owned()));
        }
        if bytes.len() > MAX_NAME {
            return Err(SofsError::NameTooLong);
        }
        let mut field = [0_u8; MAX_NAME + 1];
        field[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            name: field,
            inode: Some(inode),
        })
    }

    /// The stored name up to its first nul byte.
    #[must_use]
    pub fn name_str(&self) -> String {
        sofs_types::trim_nul_padded(&self.name)
    }

    /// True when the slot does not hold a live entry: removed (leading nul)
    /// or never used (null inode).
    #[must_use]
    pub fn is_unoccupied(&self) -> bool {
        self.name[0] == 0 || self.inode.is_none()
    }

    /// A free slot with no residue at all.
    #[must_use]
    pub fn is_free_clean(&self) -> bool {
        self.name[0] == 0 && self.inode.is_none()
    }

    /// A removed slot still carrying residual name bytes or a stale inode
    /// reference.
    #[must_use]
    pub fn is_free_dirty(&self) -> bool {
        self.is_unoccupied() && !self.is_free_clean()
    }

    /// True when this slot holds a live entry named `name`.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        !self.is_unoccupied() && self.name_str() == name
    }

    /// Mark the slot removed: zero the leading name byte, preserving the
    /// residual bytes so offline recovery can still see the prior name.
    pub fn mark_removed(&mut self) {
        self.name[0] = 0;
    }
}
