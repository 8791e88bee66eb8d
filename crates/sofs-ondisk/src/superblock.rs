//! The superblock: global volume metadata living in block 0.

use sofs_types::{
    put_le_u32, read_le_u32, trim_nul_padded, BlockNumber, ClusterNumber, CodecError, InodeNumber,
    BLOCKS_PER_CLUSTER, BLOCK_SIZE, DZONE_CACHE_SIZE, IPB, NULL_REFERENCE, VOLUME_NAME_SIZE,
};

/// `mstat` value: the volume was properly unmounted.
pub const MSTAT_CLEAN: u32 = 0;

/// `mstat` value: the volume was not properly unmounted.
pub const MSTAT_DIRTY: u32 = 1;

/// Retrieval cache: bounded array of free-cluster references filled from the
/// top down. `idx == DZONE_CACHE_SIZE` means empty; the occupied portion is
/// `refs[idx..]` and allocation pops at `refs[idx]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalCache {
    pub idx: u32,
    pub refs: [u32; DZONE_CACHE_SIZE],
}

impl RetrievalCache {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            idx: DZONE_CACHE_SIZE as u32,
            refs: [NULL_REFERENCE; DZONE_CACHE_SIZE],
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.idx as usize >= DZONE_CACHE_SIZE
    }

    #[must_use]
    pub fn occupied(&self) -> usize {
        DZONE_CACHE_SIZE.saturating_sub(self.idx as usize)
    }

    /// Pop the next reference. The slot is blanked so stale references never
    /// survive in the unoccupied region.
    pub fn pop(&mut self) -> Option<ClusterNumber> {
        if self.is_empty() {
            return None;
        }
        let raw = self.refs[self.idx as usize];
        self.refs[self.idx as usize] = NULL_REFERENCE;
        self.idx += 1;
        ClusterNumber::decode(raw)
    }

    /// Refill from `batch` (ordered oldest first), placing the oldest at the
    /// lowest occupied index so pops preserve FIFO order.
    ///
    /// Must only be called with `batch.len() <= idx`.
    pub fn refill(&mut self, batch: &[ClusterNumber]) {
        debug_assert!(batch.len() <= self.idx as usize);
        for entry in batch.iter().rev() {
            self.idx -= 1;
            self.refs[self.idx as usize] = entry.0;
        }
    }

    /// References currently held, pop order first.
    pub fn iter_occupied(&self) -> impl Iterator<Item = ClusterNumber> + '_ {
        self.refs[self.idx.min(DZONE_CACHE_SIZE as u32) as usize..]
            .iter()
            .filter_map(|raw| ClusterNumber::decode(*raw))
    }
}

/// Insertion cache: bounded array filled from the bottom up. `idx == 0`
/// means empty; the occupied portion is `refs[..idx]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertionCache {
    pub idx: u32,
    pub refs: [u32; DZONE_CACHE_SIZE],
}

impl InsertionCache {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            idx: 0,
            refs: [NULL_REFERENCE; DZONE_CACHE_SIZE],
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.idx == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.idx as usize >= DZONE_CACHE_SIZE
    }

    #[must_use]
    pub fn occupied(&self) -> usize {
        (self.idx as usize).min(DZONE_CACHE_SIZE)
    }

    /// Push a freed-cluster reference; the caller depletes first when full.
    pub fn push(&mut self, cluster: ClusterNumber) {
        debug_assert!(!self.is_full());
        self.refs[self.idx as usize] = cluster.0;
        self.idx += 1;
    }

    /// Drain all held references (oldest first) and reset to empty.
    pub fn drain(&mut self) -> Vec<ClusterNumber> {
        let taken: Vec<ClusterNumber> = self.iter_occupied().collect();
        let occupied = self.occupied();
        self.refs[..occupied].fill(NULL_REFERENCE);
        self.idx = 0;
        taken
    }

    /// References currently held, oldest first.
    pub fn iter_occupied(&self) -> impl Iterator<Item = ClusterNumber> + '_ {
        self.refs[..self.occupied()]
            .iter()
            .filter_map(|raw| ClusterNumber::decode(*raw))
    }
}

/// The single superblock record at block 0, padded to `BLOCK_SIZE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    // Header.
    pub magic: u32,
    pub version: u32,
    pub name: String,
    pub ntotal: u32,
    pub mstat: u32,

    // Inode-table metadata.
    pub itable_start: u32,
    pub itable_size: u32,
    pub itotal: u32,
    pub ifree: u32,
    pub ihead: Option<InodeNumber>,
    pub itail: Option<InodeNumber>,

    // Data-zone metadata.
    pub dzone_start: u32,
    pub dzone_total: u32,
    pub dzone_free: u32,
    pub retrieval: RetrievalCache,
    pub insertion: InsertionCache,
    pub dhead: Option<ClusterNumber>,
    pub dtail: Option<ClusterNumber>,
}

// Field offsets within the encoded superblock.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_NAME: usize = 8;
const OFF_NTOTAL: usize = OFF_NAME + VOLUME_NAME_SIZE;
const OFF_MSTAT: usize = OFF_NTOTAL + 4;
const OFF_ITABLE_START: usize = OFF_MSTAT + 4;
const OFF_ITABLE_SIZE: usize = OFF_ITABLE_START + 4;
const OFF_ITOTAL: usize = OFF_ITABLE_SIZE + 4;
const OFF_IFREE: usize = OFF_ITOTAL + 4;
const OFF_IHEAD: usize = OFF_IFREE + 4;
const OFF_ITAIL: usize = OFF_IHEAD + 4;
const OFF_DZONE_START: usize = OFF_ITAIL + 4;
const OFF_DZONE_TOTAL: usize = OFF_DZONE_START + 4;
const OFF_DZONE_FREE: usize = OFF_DZONE_TOTAL + 4;
const OFF_RETRIEVAL: usize = OFF_DZONE_FREE + 4;
const OFF_INSERTION: usize = OFF_RETRIEVAL + 4 + 4 * DZONE_CACHE_SIZE;
const OFF_DHEAD: usize = OFF_INSERTION + 4 + 4 * DZONE_CACHE_SIZE;
const OFF_DTAIL: usize = OFF_DHEAD + 4;
const ENCODED_END: usize = OFF_DTAIL + 4;

impl SuperBlock {
    /// Decode from a block-sized buffer.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < ENCODED_END {
            return Err(CodecError::InsufficientData {
                needed: ENCODED_END,
                offset: 0,
                actual: data.len(),
            });
        }

        let mut retrieval = RetrievalCache::empty();
        retrieval.idx = read_le_u32(data, OFF_RETRIEVAL)?;
        for (slot, raw) in retrieval.refs.iter_mut().enumerate() {
            *raw = read_le_u32(data, OFF_RETRIEVAL + 4 + 4 * slot)?;
        }

        let mut insertion = InsertionCache::empty();
        insertion.idx = read_le_u32(data, OFF_INSERTION)?;
        for (slot, raw) in insertion.refs.iter_mut().enumerate() {
            *raw = read_le_u32(data, OFF_INSERTION + 4 + 4 * slot)?;
        }

        Ok(Self {
            magic: read_le_u32(data, OFF_MAGIC)?,
            version: read_le_u32(data, OFF_VERSION)?,
            name: trim_nul_padded(&data[OFF_NAME..OFF_NAME + VOLUME_NAME_SIZE]),
            ntotal: read_le_u32(data, OFF_NTOTAL)?,
            mstat: read_le_u32(data, OFF_MSTAT)?,
            itable_start: read_le_u32(data, OFF_ITABLE_START)?,
            itable_size: read_le_u32(data, OFF_ITABLE_SIZE)?,
            itotal: read_le_u32(data, OFF_ITOTAL)?,
            ifree: read_le_u32(data, OFF_IFREE)?,
            ihead: InodeNumber::decode(read_le_u32(data, OFF_IHEAD)?),
            itail: InodeNumber::decode(read_le_u32(data, OFF_ITAIL)?),
            dzone_start: read_le_u32(data, OFF_DZONE_START)?,
            dzone_total: read_le_u32(data, OFF_DZONE_TOTAL)?,
            dzone_free: read_le_u32(data, OFF_DZONE_FREE)?,
            retrieval,
            insertion,
            dhead: ClusterNumber::decode(read_le_u32(data, OFF_DHEAD)?),
            dtail: ClusterNumber::decode(read_le_u32(data, OFF_DTAIL)?),
        })
    }

    /// Encode into a block-sized buffer, padding the reserved tail with
    /// zeros.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![0_u8; BLOCK_SIZE];
        put_le_u32(&mut data, OFF_MAGIC, self.magic);
        put_le_u32(&mut data, OFF_VERSION, self.version);
        let name_bytes = self.name.as_bytes();
        let copy_len = name_bytes.len().min(VOLUME_NAME_SIZE - 1);
        data[OFF_NAME..OFF_NAME + copy_len].copy_from_slice(&name_bytes[..copy_len]);
        put_le_u32(&mut data, OFF_NTOTAL, self.ntotal);
        put_le_u32(&mut data, OFF_MSTAT, self.mstat);
        put_le_u32(&mut data, OFF_ITABLE_START, self.itable_start);
        put_le_u32(&mut data, OFF_ITABLE_SIZE, self.itable_size);
        put_le_u32(&mut data, OFF_ITOTAL, self.itotal);
        put_le_u32(&mut data, OFF_IFREE, self.ifree);
        put_le_u32(&mut data, OFF_IHEAD, InodeNumber::encode(self.ihead));
        put_le_u32(&mut data, OFF_ITAIL, InodeNumber::encode(self.itail));
        put_le_u32(&mut data, OFF_DZONE_START, self.dzone_start);
        put_le_u32(&mut data, OFF_DZONE_TOTAL, self.dzone_total);
        put_le_u32(&mut data, OFF_DZONE_FREE, self.dzone_free);
        put_le_u32(&mut data, OFF_RETRIEVAL, self.retrieval.idx);
        for (slot, raw) in self.retrieval.refs.iter().enumerate() {
            put_le_u32(&mut data, OFF_RETRIEVAL + 4 + 4 * slot, *raw);
        }
        put_le_u32(&mut data, OFF_INSERTION, self.insertion.idx);
        for (slot, raw) in self.insertion.refs.iter().enumerate() {
            put_le_u32(&mut data, OFF_INSERTION + 4 + 4 * slot, *raw);
        }
        put_le_u32(&mut data, OFF_DHEAD, ClusterNumber::encode(self.dhead));
        put_le_u32(&mut data, OFF_DTAIL, ClusterNumber::encode(self.dtail));
        data
    }

    #[must_use]
    pub fn properly_unmounted(&self) -> bool {
        self.mstat == MSTAT_CLEAN
    }

    /// Locate an inode within the inode table: the physical block holding it
    /// and the inode's slot index inside that block.
    #[must_use]
    pub fn inode_location(&self, inode: InodeNumber) -> (BlockNumber, usize) {
        let block = self.itable_start + inode.0 / IPB;
        (BlockNumber(block), (inode.0 % IPB) as usize)
    }

    /// Physical number of the first block of a logical data cluster.
    #[must_use]
    pub fn cluster_block(&self, cluster: ClusterNumber) -> BlockNumber {
        cluster.to_block(self.dzone_start)
    }

    /// True when the logical cluster number addresses the data zone.
    #[must_use]
    pub fn cluster_in_range(&self, cluster: ClusterNumber) -> bool {
        cluster.0 < self.dzone_total
    }

    /// True when the inode number addresses the inode table.
    #[must_use]
    pub fn inode_in_range(&self, inode: InodeNumber) -> bool {
        inode.0 < self.itotal
    }

    /// The volume-layout identity `ntotal == 1 + itable_size +
    /// dzone_total * BLOCKS_PER_CLUSTER`.
    #[must_use]
    pub fn layout_adds_up(&self) -> bool {
        self.ntotal
            == 1_u32
                .wrapping_add(self.itable_size)
                .wrapping_add(self.dzone_total.wrapping_mul(BLOCKS_PER_CLUSTER))
    }
}
