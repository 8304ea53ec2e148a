//! Persistent Array & Bitset
//!
//! Fixed-width record array and bit vector stored at a sector-aligned block
//! region, with write-through discipline: `set` forces a device flush before
//! returning, because this state encodes free-space accounting and an
//! unflushed update lost in a crash would silently corrupt allocation.
//!
//! Records are bincode-encoded with a fixed serialized size (computed once
//! from a template value) and packed into blocks without crossing block
//! boundaries.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::device::{BlockDevice, BLOCK_SIZE};
use crate::error::{Result, VaultError};

// =============================================================================
// DiskArray
// =============================================================================

/// Generic fixed-width record array over a block region
pub struct DiskArray<T> {
    device: Arc<BlockDevice>,
    start_block: u64,
    nr_entries: u64,
    entry_size: usize,
    entries_per_block: u64,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> DiskArray<T> {
    /// Create an array view of `nr_entries` records at `start_block`.
    ///
    /// `template` fixes the record size; every stored value must serialize
    /// to the same number of bytes.
    pub fn new(
        device: Arc<BlockDevice>,
        start_block: u64,
        nr_entries: u64,
        template: &T,
    ) -> Result<Self> {
        let entry_size = bincode::serialized_size(template)? as usize;
        if entry_size == 0 || entry_size > BLOCK_SIZE {
            return Err(VaultError::InvalidState(format!(
                "record size {} does not fit a block",
                entry_size
            )));
        }

        Ok(Self {
            device,
            start_block,
            nr_entries,
            entry_size,
            entries_per_block: (BLOCK_SIZE / entry_size) as u64,
            _marker: PhantomData,
        })
    }

    /// Blocks needed to hold `nr_entries` records of `entry_size` bytes
    pub fn blocks_needed(nr_entries: u64, entry_size: usize) -> u64 {
        let entries_per_block = (BLOCK_SIZE / entry_size) as u64;
        nr_entries / entries_per_block + 1
    }

    /// Number of blocks this array occupies
    pub fn nr_blocks(&self) -> u64 {
        Self::blocks_needed(self.nr_entries, self.entry_size)
    }

    /// Number of records
    pub fn nr_entries(&self) -> u64 {
        self.nr_entries
    }

    /// Read a copy of the record at `index`
    pub fn get(&self, index: u64) -> Result<T> {
        if index >= self.nr_entries {
            return Err(VaultError::OutOfRange);
        }

        let block = self.start_block + index / self.entries_per_block;
        let offset = (index % self.entries_per_block) as usize * self.entry_size;

        let data = self.device.read_block(block)?;
        let value = bincode::deserialize(&data[offset..offset + self.entry_size])?;
        Ok(value)
    }

    /// Write the record at `index` and flush before returning
    pub fn set(&self, index: u64, value: &T) -> Result<()> {
        if index >= self.nr_entries {
            return Err(VaultError::OutOfRange);
        }

        let encoded = bincode::serialize(value)?;
        if encoded.len() != self.entry_size {
            return Err(VaultError::Serialization(format!(
                "record serialized to {} bytes, expected {}",
                encoded.len(),
                self.entry_size
            )));
        }

        let block = self.start_block + index / self.entries_per_block;
        let offset = (index % self.entries_per_block) as usize * self.entry_size;

        let mut data = self.device.read_block(block)?;
        data[offset..offset + self.entry_size].copy_from_slice(&encoded);
        self.device.write_block(block, &data)?;
        self.device.flush()
    }

    /// Bulk-initialize every record to `value`, with a single flush at the end
    pub fn format(&self, value: &T) -> Result<()> {
        let encoded = bincode::serialize(value)?;
        if encoded.len() != self.entry_size {
            return Err(VaultError::Serialization(format!(
                "record serialized to {} bytes, expected {}",
                encoded.len(),
                self.entry_size
            )));
        }

        let mut block_image = vec![0u8; BLOCK_SIZE];
        for slot in 0..self.entries_per_block as usize {
            let offset = slot * self.entry_size;
            block_image[offset..offset + self.entry_size].copy_from_slice(&encoded);
        }

        for block in 0..self.nr_blocks() {
            self.device.write_block(self.start_block + block, &block_image)?;
        }
        self.device.flush()
    }
}

// =============================================================================
// DiskBitset
// =============================================================================

/// Bit vector over a block region, built on a word array
pub struct DiskBitset {
    words: DiskArray<u64>,
    nr_bits: u64,
}

impl DiskBitset {
    const BITS_PER_WORD: u64 = 64;

    pub fn new(device: Arc<BlockDevice>, start_block: u64, nr_bits: u64) -> Result<Self> {
        let nr_words = Self::words_for(nr_bits);
        Ok(Self {
            words: DiskArray::new(device, start_block, nr_words, &0u64)?,
            nr_bits,
        })
    }

    /// Blocks needed for a bitset of `nr_bits` bits
    pub fn blocks_needed(nr_bits: u64) -> u64 {
        DiskArray::<u64>::blocks_needed(Self::words_for(nr_bits), std::mem::size_of::<u64>())
    }

    fn words_for(nr_bits: u64) -> u64 {
        if nr_bits == 0 {
            return 0;
        }
        (nr_bits - 1) / Self::BITS_PER_WORD + 1
    }

    /// Number of blocks this bitset occupies
    pub fn nr_blocks(&self) -> u64 {
        self.words.nr_blocks()
    }

    pub fn nr_bits(&self) -> u64 {
        self.nr_bits
    }

    /// Read one bit
    pub fn get(&self, bit: u64) -> Result<bool> {
        if bit >= self.nr_bits {
            return Err(VaultError::OutOfRange);
        }
        let word = self.words.get(bit / Self::BITS_PER_WORD)?;
        Ok(word & (1u64 << (bit % Self::BITS_PER_WORD)) != 0)
    }

    /// Set one bit (write-through)
    pub fn set(&self, bit: u64) -> Result<()> {
        self.update(bit, true)
    }

    /// Clear one bit (write-through)
    pub fn clear(&self, bit: u64) -> Result<()> {
        self.update(bit, false)
    }

    /// Initialize every bit to `value`
    pub fn format(&self, value: bool) -> Result<()> {
        let word = if value { u64::MAX } else { 0 };
        self.words.format(&word)
    }

    fn update(&self, bit: u64, value: bool) -> Result<()> {
        if bit >= self.nr_bits {
            return Err(VaultError::OutOfRange);
        }
        let index = bit / Self::BITS_PER_WORD;
        let mask = 1u64 << (bit % Self::BITS_PER_WORD);

        let mut word = self.words.get(index)?;
        if value {
            word |= mask;
        } else {
            word &= !mask;
        }
        self.words.set(index, &word)
    }
}

// =============================================================================
// Tests
// =============================================================================
