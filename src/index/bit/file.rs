//! BIT File
//!
//! Immutable handle over one built Block Index Table: root-descent search
//! and forward iteration. Created by the builder or reloaded from the
//! catalogue; destroyed when compaction consumes it.

use std::sync::Arc;

use crate::crypto::Cipher;
use crate::device::BlockDevice;
use crate::error::{Result, VaultError};
use crate::index::level::LsmFile;
use crate::index::Record;
use crate::meta::FileStat;

use super::{read_node, BitFileIter, BitLeaf, BitNode, NodePointer};

/// Handle over one immutable sorted run
pub struct BitFile {
    device: Arc<BlockDevice>,
    cipher: Arc<dyn Cipher>,

    id: u64,
    level: u32,
    version: u64,
    first_key: u64,
    last_key: u64,
    root: NodePointer,
}

impl BitFile {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<BlockDevice>,
        cipher: Arc<dyn Cipher>,
        id: u64,
        level: u32,
        version: u64,
        first_key: u64,
        last_key: u64,
        root: NodePointer,
    ) -> Self {
        Self {
            device,
            cipher,
            id,
            level,
            version,
            first_key,
            last_key,
            root,
        }
    }

    /// Rebuild a handle from catalogue stats on mount
    pub fn from_stat(device: Arc<BlockDevice>, cipher: Arc<dyn Cipher>, stat: &FileStat) -> Self {
        Self::new(
            device,
            cipher,
            stat.id,
            stat.level,
            stat.version,
            stat.first_key,
            stat.last_key,
            NodePointer {
                pos: stat.root_pos,
                key: stat.root_key,
                iv: stat.root_iv,
            },
        )
    }

    /// Descend from the root to the leaf that could hold `key`.
    ///
    /// Every visited node is decrypted and auth-verified; a verification
    /// failure aborts the whole lookup.
    pub(super) fn search_leaf(&self, key: u64) -> Result<BitLeaf> {
        let mut pointer = self.root.clone();
        loop {
            match read_node(&self.device, &*self.cipher, &pointer)? {
                BitNode::Leaf(leaf) => {
                    if leaf.key != key {
                        return Err(VaultError::NotFound);
                    }
                    return Ok(leaf);
                }
                BitNode::Inner(children) => {
                    match children.iter().find(|(upper, _)| key <= *upper) {
                        Some((_, child)) => pointer = child.clone(),
                        None => return Err(VaultError::NotFound),
                    }
                }
            }
        }
    }

    pub(super) fn first_leaf(&self) -> Result<BitLeaf> {
        self.search_leaf(self.first_key)
    }

    pub(super) fn device(&self) -> &Arc<BlockDevice> {
        &self.device
    }

    pub(super) fn cipher(&self) -> &Arc<dyn Cipher> {
        &self.cipher
    }
}

impl LsmFile for BitFile {
    fn id(&self) -> u64 {
        self.id
    }

    fn level(&self) -> u32 {
        self.level
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn first_key(&self) -> u64 {
        self.first_key
    }

    fn last_key(&self) -> u64 {
        self.last_key
    }

    fn search(&self, key: u64) -> Result<Record> {
        if key < self.first_key || key > self.last_key {
            return Err(VaultError::NotFound);
        }
        Ok(self.search_leaf(key)?.record)
    }

    fn iter(&self) -> Result<Box<dyn Iterator<Item = Result<crate::index::Entry>> + Send>> {
        Ok(Box::new(BitFileIter::new(self)?))
    }

    fn stat(&self) -> FileStat {
        FileStat {
            id: self.id,
            level: self.level,
            version: self.version,
            first_key: self.first_key,
            last_key: self.last_key,
            root_pos: self.root.pos,
            root_key: self.root.key,
            root_iv: self.root.iv,
        }
    }
}
