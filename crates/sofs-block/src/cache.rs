//! The buffer cache: four distinguished in-memory slots over the backing
//! device, plus raw block/cluster I/O for everything else.
//!
//! Slots are independent and hold decoded content. `load_*` brings a block
//! (or cluster) in, the accessors hand out in-place references, and
//! `store_*` writes the current content back. Loading a new physical
//! address into a slot discards any change that was not stored first;
//! callers own that ordering.

use crate::device::{ByteDevice, FileByteDevice};
use sofs_error::{Result, SofsError};
use sofs_ondisk::{decode_inode_block, encode_inode_block, DataCluster, Inode, SuperBlock};
use sofs_types::{BlockNumber, BLOCK_SIZE, CLUSTER_SIZE};
use std::path::Path;
use tracing::trace;

struct Slot<T> {
    addr: BlockNumber,
    value: T,
}

/// Write-back cache over the backing file, addressed by physical block
/// number. Owned by the mount handle; one in-flight operation at a time.
pub struct BufferCache {
    dev: Box<dyn ByteDevice>,
    block_count: u32,
    sb: Option<SuperBlock>,
    itable: Option<Slot<Vec<Inode>>>,
    dref: Option<Slot<DataCluster>>,
    sind: Option<Slot<DataCluster>>,
}

impl BufferCache {
    /// Open the backing file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Box::new(FileByteDevice::open(path)?))
    }

    /// Wrap an already-open device. The device size must be a positive
    /// multiple of the block size.
    pub fn new(dev: Box<dyn ByteDevice>) -> Result<Self> {
        let len = dev.len_bytes();
        if len == 0 || len % BLOCK_SIZE as u64 != 0 {
            return Err(SofsError::InvalidSuperblock(
                "device size is not a positive multiple of the block size",
            ));
        }
        let block_count = u32::try_from(len / BLOCK_SIZE as u64)
            .map_err(|_| SofsError::InvalidSuperblock("device holds too many blocks"))?;
        Ok(Self {
            dev,
            block_count,
            sb: None,
            itable: None,
            dref: None,
            sind: None,
        })
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    fn check_block_span(&self, block: BlockNumber, blocks: u32) -> Result<()> {
        let end = block.0.checked_add(blocks);
        match end {
            Some(end) if end <= self.block_count => Ok(()),
            _ => Err(SofsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("block {block} (+{blocks}) beyond device end"),
            ))),
        }
    }

    // ── Raw block and cluster I/O ───────────────────────────────────────

    pub fn read_block(&self, block: BlockNumber) -> Result<Vec<u8>> {
        self.check_block_span(block, 1)?;
        let mut buf = vec![0_u8; BLOCK_SIZE];
        self.dev.read_exact_at(block.byte_offset(), &mut buf)?;
        Ok(buf)
    }

    pub fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        self.check_block_span(block, 1)?;
        self.dev.write_all_at(block.byte_offset(), data)
    }

    /// Read a whole cluster starting at physical block `block`.
    pub fn read_cluster(&self, block: BlockNumber) -> Result<DataCluster> {
        self.check_block_span(block, sofs_types::BLOCKS_PER_CLUSTER)?;
        let mut buf = vec![0_u8; CLUSTER_SIZE];
        self.dev.read_exact_at(block.byte_offset(), &mut buf)?;
        Ok(DataCluster::decode(&buf)?)
    }

    /// Write a whole cluster starting at physical block `block`.
    pub fn write_cluster(&self, block: BlockNumber, cluster: &DataCluster) -> Result<()> {
        self.check_block_span(block, sofs_types::BLOCKS_PER_CLUSTER)?;
        self.dev.write_all_at(block.byte_offset(), &cluster.encode())
    }

    // ── Superblock slot ─────────────────────────────────────────────────

    /// Bring the superblock (block 0) into its slot.
    pub fn load_superblock(&mut self) -> Result<()> {
        let raw = self.read_block(BlockNumber(0))?;
        trace!(target: "sofs::block", slot = "superblock", event = "load");
        self.sb = Some(SuperBlock::decode(&raw)?);
        Ok(())
    }

    pub fn superblock(&self) -> Result<&SuperBlock> {
        self.sb.as_ref().ok_or(SofsError::DeviceNotOpen)
    }

    pub fn superblock_mut(&mut self) -> Result<&mut SuperBlock> {
        self.sb.as_mut().ok_or(SofsError::DeviceNotOpen)
    }

    /// Write the superblock slot back to block 0.
    pub fn store_superblock(&mut self) -> Result<()> {
        let sb = self.sb.as_ref().ok_or(SofsError::DeviceNotOpen)?;
        let raw = sb.encode();
        trace!(target: "sofs::block", slot = "superblock", event = "store");
        self.write_block(BlockNumber(0), &raw)
    }

    /// Drop the superblock slot (used on unmount).
    pub fn release_superblock(&mut self) {
        self.sb = None;
    }

    // ── Inode-table block slot ──────────────────────────────────────────

    /// Bring an inode-table block into its slot, discarding whatever the
    /// slot held.
    pub fn load_inode_block(&mut self, block: BlockNumber) -> Result<()> {
        let raw = self.read_block(block)?;
        trace!(target: "sofs::block", slot = "itable", event = "load", block = block.0);
        self.itable = Some(Slot {
            addr: block,
            value: decode_inode_block(&raw)?,
        });
        Ok(())
    }

    pub fn inode_block(&self) -> Result<&[Inode]> {
        self.itable
            .as_ref()
            .map(|slot| slot.value.as_slice())
            .ok_or(SofsError::DeviceNotOpen)
    }

    pub fn inode_block_mut(&mut self) -> Result<&mut [Inode]> {
        self.itable
            .as_mut()
            .map(|slot| slot.value.as_mut_slice())
            .ok_or(SofsError::DeviceNotOpen)
    }

    pub fn store_inode_block(&mut self) -> Result<()> {
        let slot = self.itable.as_ref().ok_or(SofsError::DeviceNotOpen)?;
        trace!(target: "sofs::block", slot = "itable", event = "store", block = slot.addr.0);
        self.write_block(slot.addr, &encode_inode_block(&slot.value))
    }

    // ── Direct-refs cluster slot ────────────────────────────────────────

    pub fn load_direct_ref_cluster(&mut self, block: BlockNumber) -> Result<()> {
        let value = self.read_cluster(block)?;
        trace!(target: "sofs::block", slot = "dref", event = "load", block = block.0);
        self.dref = Some(Slot { addr: block, value });
        Ok(())
    }

    pub fn direct_ref_cluster(&self) -> Result<&DataCluster> {
        self.dref
            .as_ref()
            .map(|slot| &slot.value)
            .ok_or(SofsError::DeviceNotOpen)
    }

    pub fn direct_ref_cluster_mut(&mut self) -> Result<&mut DataCluster> {
        self.dref
            .as_mut()
            .map(|slot| &mut slot.value)
            .ok_or(SofsError::DeviceNotOpen)
    }

    pub fn store_direct_ref_cluster(&mut self) -> Result<()> {
        let slot = self.dref.as_ref().ok_or(SofsError::DeviceNotOpen)?;
        trace!(target: "sofs::block", slot = "dref", event = "store", block = slot.addr.0);
        self.write_cluster(slot.addr, &slot.value)
    }

    // ── Single-indirect-refs cluster slot ───────────────────────────────

    pub fn load_single_ind_cluster(&mut self, block: BlockNumber) -> Result<()> {
        let value = self.read_cluster(block)?;
        trace!(target: "sofs::block", slot = "sind", event = "load", block = block.0);
        self.sind = Some(Slot { addr: block, value });
        Ok(())
    }

    pub fn single_ind_cluster(&self) -> Result<&DataCluster> {
        self.sind
            .as_ref()
            .map(|slot| &slot.value)
            .ok_or(SofsError::DeviceNotOpen)
    }

    pub fn single_ind_cluster_mut(&mut self) -> Result<&mut DataCluster> {
        self.sind
            .as_mut()
            .map(|slot| &mut slot.value)
            .ok_or(SofsError::DeviceNotOpen)
    }

    pub fn store_single_ind_cluster(&mut self) -> Result<()> {
        let slot = self.sind.as_ref().ok_or(SofsError::DeviceNotOpen)?;
        trace!(target: "sofs::block", slot = "sind", event = "store", block = slot.addr.0);
        self.write_cluster(slot.addr, &slot.value)
    }

    // ── Table-addressed conveniences ────────────────────────────────────
    //
    // Location math comes from the loaded superblock; these are the base
    // operations every layer builds on.

    /// Fetch one inode record through the inode-table slot.
    pub fn fetch_inode(&mut self, inode: sofs_types::InodeNumber) -> Result<Inode> {
        let (block, slot) = {
            let sb = self.superblock()?;
            if !sb.inode_in_range(inode) {
                return Err(SofsError::InvalidInode(inode.0));
            }
            sb.inode_location(inode)
        };
        self.load_inode_block(block)?;
        Ok(self.inode_block()?[slot])
    }

    /// Write one inode record through the inode-table slot (read-modify-
    /// write of its block).
    pub fn put_inode(&mut self, inode: sofs_types::InodeNumber, value: &Inode) -> Result<()> {
        let (block, slot) = {
            let sb = self.superblock()?;
            if !sb.inode_in_range(inode) {
                return Err(SofsError::InvalidInode(inode.0));
            }
            sb.inode_location(inode)
        };
        self.load_inode_block(block)?;
        self.inode_block_mut()?[slot] = *value;
        self.store_inode_block()
    }

    /// Read a data cluster by logical number.
    pub fn fetch_cluster(&self, cluster: sofs_types::ClusterNumber) -> Result<DataCluster> {
        let sb = self.superblock()?;
        if !sb.cluster_in_range(cluster) {
            return Err(SofsError::InvalidCluster(cluster.0));
        }
        let block = sb.cluster_block(cluster);
        self.read_cluster(block)
    }

    /// Write a data cluster by logical number.
    pub fn put_cluster(
        &self,
        cluster: sofs_types::ClusterNumber,
        value: &DataCluster,
    ) -> Result<()> {
        let sb = self.superblock()?;
        if !sb.cluster_in_range(cluster) {
            return Err(SofsError::InvalidCluster(cluster.0));
        }
        let block = sb.cluster_block(cluster);
        self.write_cluster(block, value)
    }

    // ── Flushing ────────────────────────────────────────────────────────

    /// Push everything written so far to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}
