//! Reverse Index Table
//!
//! pba -> lba map consulted during GC to discover which logical address must
//! be remapped when a physical block is relocated.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::device::BlockDevice;
use crate::error::{Result, VaultError};
use crate::meta::disk_array::DiskArray;

/// One entry per physical block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReverseIndexEntry {
    pub valid: bool,
    pub lba: u64,
}

impl ReverseIndexEntry {
    pub fn invalid() -> Self {
        Self { valid: false, lba: 0 }
    }
}

/// Persistent pba -> lba mapping
pub struct ReverseIndexTable {
    array: Mutex<DiskArray<ReverseIndexEntry>>,
}

impl ReverseIndexTable {
    pub fn new(device: Arc<BlockDevice>, start_block: u64, nr_block: u64) -> Result<Self> {
        Ok(Self {
            array: Mutex::new(DiskArray::new(
                device,
                start_block,
                nr_block,
                &ReverseIndexEntry::invalid(),
            )?),
        })
    }

    /// Record that `pba` currently holds the ciphertext of `lba`
    pub fn set(&self, pba: u64, lba: u64) -> Result<()> {
        self.array.lock().set(pba, &ReverseIndexEntry { valid: true, lba })
    }

    /// The logical address mapped at `pba`; `NotFound` if none
    pub fn get(&self, pba: u64) -> Result<u64> {
        let entry = self.array.lock().get(pba)?;
        if !entry.valid {
            return Err(VaultError::NotFound);
        }
        Ok(entry.lba)
    }

    pub fn format(&self) -> Result<()> {
        self.array.lock().format(&ReverseIndexEntry::invalid())
    }
}

// =============================================================================
// Tests
// =============================================================================
