//! BIT Iterator
//!
//! Forward iteration over one file's entries in key order: start at the
//! leaf holding the first key, then follow next-leaf pointers until the
//! last key has been yielded. Restartable from the first key, but not
//! resumable mid-stream without re-decrypting.

use std::sync::Arc;

use crate::crypto::Cipher;
use crate::device::BlockDevice;
use crate::error::{Result, VaultError};
use crate::index::level::LsmFile;
use crate::index::Entry;

use super::{read_node, BitFile, BitLeaf, BitNode};

/// Iterator over one BIT file's leaf chain
pub struct BitFileIter {
    device: Arc<BlockDevice>,
    cipher: Arc<dyn Cipher>,
    last_key: u64,
    current: Option<BitLeaf>,
    /// Chain-read failure held back until the preceding entry was yielded
    pending_err: Option<VaultError>,
}

impl BitFileIter {
    pub(super) fn new(file: &BitFile) -> Result<Self> {
        let first = file.first_leaf()?;
        Ok(Self {
            device: file.device().clone(),
            cipher: file.cipher().clone(),
            last_key: file.last_key(),
            current: Some(first),
            pending_err: None,
        })
    }

    fn advance(&mut self, leaf: &BitLeaf) -> Result<Option<BitLeaf>> {
        if leaf.key >= self.last_key {
            return Ok(None);
        }
        match read_node(&self.device, &*self.cipher, &leaf.next)? {
            BitNode::Leaf(next) => Ok(Some(next)),
            BitNode::Inner(_) => Err(VaultError::InvalidState(
                "leaf chain pointed at an inner node".to_string(),
            )),
        }
    }
}

impl Iterator for BitFileIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_err.take() {
            self.current = None;
            return Some(Err(e));
        }

        let leaf = self.current.take()?;
        let entry = Entry {
            lba: leaf.key,
            record: leaf.record.clone(),
        };

        match self.advance(&leaf) {
            Ok(next) => self.current = next,
            Err(e) => self.pending_err = Some(e),
        }
        Some(Ok(entry))
    }
}
