//! BIT Builder
//!
//! Writes strictly ascending index entries into a new Block Index Table
//! file.
//!
//! The builder keeps one pending group of up to `BIT_FANOUT` children per
//! tree level. A leaf slot is reserved in file order as its entry arrives;
//! filling a level's group synthesizes, encrypts and appends the parent
//! node and promotes its pointer one level up. Leaves are chained: each
//! leaf's `next` pointer carries the position and pre-generated crypto
//! material of the following leaf slot. Nodes stream to the device through
//! a bounded staging buffer rather than one write per node.

use std::sync::Arc;

use bytes::BytesMut;

use crate::crypto::{random_iv, random_key, Cipher, Iv, Key};
use crate::device::{BlockDevice, BLOCK_SIZE};
use crate::error::{Result, VaultError};
use crate::index::Entry;

use super::{
    seal_node, tree_height, BitFile, BitLeaf, BitNode, NodePointer, BIT_FANOUT, BIT_NODE_SIZE,
    BUILDER_BUFFER_SIZE,
};

/// Builder for one immutable BIT file
pub struct BitBuilder {
    device: Arc<BlockDevice>,
    cipher: Arc<dyn Cipher>,

    id: u64,
    level: u32,
    version: u64,
    capacity: u64,

    /// Absolute device byte offset the staging buffer flushes to next
    begin: u64,
    /// First byte past the file's slot in the index region
    region_end: u64,
    buf: BytesMut,

    height: usize,
    /// Pending (upper key, pointer) group per tree level, leaves at 0
    ctx: Vec<Vec<(u64, NodePointer)>>,

    first_key: Option<u64>,
    last_key: u64,
    entries: u64,

    /// Crypto material pre-generated for the next leaf slot; shared by the
    /// previous leaf's chain pointer
    upcoming: (Key, Iv),
}

impl BitBuilder {
    /// Start building file `id` at its slot in the index region
    pub fn new(
        device: Arc<BlockDevice>,
        cipher: Arc<dyn Cipher>,
        id: u64,
        level: u32,
        version: u64,
        start_block: u64,
        region_blocks: u64,
        capacity: u64,
    ) -> Self {
        let begin = start_block * BLOCK_SIZE as u64;
        let height = tree_height(capacity);
        Self {
            device,
            cipher,
            id,
            level,
            version,
            capacity,
            begin,
            region_end: begin + region_blocks * BLOCK_SIZE as u64,
            buf: BytesMut::with_capacity(BUILDER_BUFFER_SIZE),
            height,
            ctx: vec![Vec::with_capacity(BIT_FANOUT); height],
            first_key: None,
            last_key: 0,
            entries: 0,
            upcoming: (random_key(), random_iv()),
        }
    }

    /// Entries added so far
    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Append one entry; keys must be strictly ascending
    pub fn add(&mut self, entry: &Entry) -> Result<()> {
        if self.entries >= self.capacity {
            return Err(VaultError::OutOfSpace);
        }
        if self.first_key.is_some() && entry.lba <= self.last_key {
            return Err(VaultError::InvalidState(format!(
                "key {} added after {}",
                entry.lba, self.last_key
            )));
        }

        self.flush_buffer_if_full()?;

        if self.first_key.is_none() {
            self.first_key = Some(entry.lba);
        }

        // reserve the leaf slot; its crypto material was fixed when the
        // previous leaf chained to it
        let (leaf_key, leaf_iv) = self.upcoming;
        self.upcoming = (random_key(), random_iv());

        let leaf_pos = self.begin + self.buf.len() as u64;
        let reserved_at = self.buf.len();
        self.buf.resize(reserved_at + BIT_NODE_SIZE, 0);

        self.ctx[0].push((
            entry.lba,
            NodePointer {
                pos: leaf_pos,
                key: leaf_key,
                iv: leaf_iv,
            },
        ));

        // promote filled groups upward
        let mut h = 0;
        while self.ctx[h].len() == BIT_FANOUT {
            self.promote(h)?;
            h += 1;
        }

        // the next leaf lands wherever the buffer now ends
        let next = NodePointer {
            pos: self.begin + self.buf.len() as u64,
            key: self.upcoming.0,
            iv: self.upcoming.1,
        };

        let leaf = BitNode::Leaf(BitLeaf {
            key: entry.lba,
            record: entry.record.clone(),
            next,
        });
        let slot = seal_node(&*self.cipher, &leaf, &leaf_key, &leaf_iv)?;
        self.buf[reserved_at..reserved_at + BIT_NODE_SIZE].copy_from_slice(&slot);

        self.last_key = entry.lba;
        self.entries += 1;
        Ok(())
    }

    /// Finalize partially-filled ancestor groups and return the file handle
    pub fn complete(mut self) -> Result<BitFile> {
        let Some(first_key) = self.first_key else {
            return Err(VaultError::InvalidState(
                "completing an empty builder".to_string(),
            ));
        };

        // the top group is already occupied only when the tree came out
        // exactly full
        if self.ctx[self.height - 1].is_empty() {
            self.flush_buffer_if_full()?;
            for h in 0..self.height - 1 {
                if self.ctx[h].is_empty() {
                    continue;
                }
                self.promote(h)?;
            }
        }

        self.write_staged()?;
        self.device.flush()?;

        let root = self.ctx[self.height - 1][0].1.clone();
        tracing::debug!(
            id = self.id,
            level = self.level,
            version = self.version,
            entries = self.entries,
            "BIT file built"
        );

        Ok(BitFile::new(
            self.device,
            self.cipher,
            self.id,
            self.level,
            self.version,
            first_key,
            self.last_key,
            root,
        ))
    }

    /// Synthesize the parent of level `h`'s pending group, append it, and
    /// promote its pointer to level `h + 1`
    fn promote(&mut self, h: usize) -> Result<()> {
        let children = std::mem::take(&mut self.ctx[h]);
        let upper = children[children.len() - 1].0;

        let key = random_key();
        let iv = random_iv();
        let pos = self.begin + self.buf.len() as u64;

        let node = BitNode::Inner(children);
        let slot = seal_node(&*self.cipher, &node, &key, &iv)?;
        self.buf.extend_from_slice(&slot);

        self.ctx[h + 1].push((upper, NodePointer { pos, key, iv }));
        Ok(())
    }

    /// Flush the staging buffer when it cannot hold a worst-case parent
    /// chain for one more entry
    fn flush_buffer_if_full(&mut self) -> Result<()> {
        if self.buf.len() + (self.height + 1) * BIT_NODE_SIZE > BUILDER_BUFFER_SIZE {
            self.write_staged()?;
        }
        Ok(())
    }

    fn write_staged(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if self.begin + self.buf.len() as u64 > self.region_end {
            return Err(VaultError::OutOfSpace);
        }
        self.device.write_at(self.begin, &self.buf)?;
        self.begin += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }
}
