//! Superblock
//!
//! On-disk geometry descriptor at block 0, validated by magic + checksum.
//!
//! All region offsets are computed once at format time from the segment and
//! level geometry; `read`/`write` are the only authorized mutators. A failed
//! `validate` means the device is treated as unformatted: the engine
//! recomputes the geometry from its config and persists a fresh superblock
//! (the destructive initialize path).

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::device::{BlockDevice, BLOCK_SIZE};
use crate::error::{Result, VaultError};
use crate::index::bit;
use crate::meta::catalogue::CatalogueEntry;
use crate::meta::data_seg_table::DataSegmentEntry;
use crate::meta::disk_array::{DiskArray, DiskBitset};
use crate::meta::reverse_index::ReverseIndexEntry;

/// Identifies a formatted VaultDisk device ("VAULTDSK")
pub const SUPERBLOCK_MAGIC: u64 = 0x5641_554C_5444_534B;

/// Block address of the superblock
pub const SUPERBLOCK_LOCATION: u64 = 0;

/// Persistent geometry descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Superblock {
    pub magic: u64,
    pub csum: u32,

    // -------------------------------------------------------------------------
    // Segment Geometry
    // -------------------------------------------------------------------------
    pub blocks_per_segment: u64,
    pub nr_segment: u64,

    // -------------------------------------------------------------------------
    // Index Geometry
    // -------------------------------------------------------------------------
    pub nr_disk_level: u32,
    pub level_growth_ratio: u32,
    pub level0_files: u32,
    pub max_level_files: u64,
    pub file_capacity: u64,

    // -------------------------------------------------------------------------
    // Region Offsets (block addresses)
    // -------------------------------------------------------------------------
    pub index_region_start: u64,
    pub journal_region_start: u64,
    pub seg_validity_start: u64,
    pub data_seg_table_start: u64,
    pub reverse_index_start: u64,
    pub catalogue_start: u64,
    pub data_region_start: u64,
}

impl Superblock {
    /// Compute a fresh superblock (region offsets included) from a config
    pub fn compute(config: &Config) -> Result<Self> {
        let mut sb = Self {
            magic: SUPERBLOCK_MAGIC,
            csum: 0,
            blocks_per_segment: config.blocks_per_segment,
            nr_segment: config.nr_segment,
            nr_disk_level: config.nr_disk_level,
            level_growth_ratio: config.level_growth_ratio,
            level0_files: config.level0_files,
            max_level_files: config.max_level_files,
            file_capacity: config.file_capacity,
            index_region_start: 0,
            journal_region_start: 0,
            seg_validity_start: 0,
            data_seg_table_start: 0,
            reverse_index_start: 0,
            catalogue_start: 0,
            data_region_start: 0,
        };

        let dst_entry_size =
            bincode::serialized_size(&DataSegmentEntry::empty(sb.blocks_per_segment))? as usize;
        let rit_entry_size = bincode::serialized_size(&ReverseIndexEntry::invalid())? as usize;
        let cat_entry_size = bincode::serialized_size(&CatalogueEntry::unused())? as usize;

        let nr_block = sb.nr_segment * sb.blocks_per_segment;
        let file_slots = sb.total_file_slots();

        sb.index_region_start = SUPERBLOCK_LOCATION + 1;
        sb.journal_region_start =
            sb.index_region_start + file_slots * bit::file_region_blocks(sb.file_capacity);
        // journal region reserved, currently zero blocks
        sb.seg_validity_start = sb.journal_region_start;
        sb.data_seg_table_start = sb.seg_validity_start + DiskBitset::blocks_needed(sb.nr_segment);
        sb.reverse_index_start = sb.data_seg_table_start
            + DiskArray::<DataSegmentEntry>::blocks_needed(sb.nr_segment, dst_entry_size);
        sb.catalogue_start = sb.reverse_index_start
            + DiskArray::<ReverseIndexEntry>::blocks_needed(nr_block, rit_entry_size);
        sb.data_region_start =
            sb.catalogue_start + DiskArray::<CatalogueEntry>::blocks_needed(file_slots, cat_entry_size);

        Ok(sb)
    }

    /// Read the superblock from the device (no validation)
    pub fn read(device: &BlockDevice) -> Result<Self> {
        let data = device.read_block(SUPERBLOCK_LOCATION)?;
        let sb: Superblock = bincode::deserialize(&data)?;
        Ok(sb)
    }

    /// Recompute the checksum and persist at the fixed location
    pub fn write(&mut self, device: &BlockDevice) -> Result<()> {
        self.csum = self.checksum()?;

        let encoded = bincode::serialize(self)?;
        if encoded.len() > BLOCK_SIZE {
            return Err(VaultError::InvalidState(
                "superblock does not fit one block".to_string(),
            ));
        }

        let mut block = vec![0u8; BLOCK_SIZE];
        block[..encoded.len()].copy_from_slice(&encoded);
        device.write_block(SUPERBLOCK_LOCATION, &block)?;
        device.flush()
    }

    /// Check the magic constant and the checksum over the geometry fields
    pub fn validate(&self) -> bool {
        if self.magic != SUPERBLOCK_MAGIC {
            return false;
        }
        match self.checksum() {
            Ok(csum) => csum == self.csum,
            Err(_) => false,
        }
    }

    fn checksum(&self) -> Result<u32> {
        let mut copy = self.clone();
        copy.csum = 0;
        let encoded = bincode::serialize(&copy)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&encoded);
        Ok(hasher.finalize())
    }

    // =========================================================================
    // Derived Geometry
    // =========================================================================

    /// Total device size in blocks (metadata regions + data region)
    pub fn total_blocks(&self) -> u64 {
        self.data_region_start + self.nr_segment * self.blocks_per_segment
    }

    /// Total addressable data blocks
    pub fn nr_block(&self) -> u64 {
        self.nr_segment * self.blocks_per_segment
    }

    /// Soft file capacity of a level. The deepest level holds
    /// `max_level_files`; each shallower disk level divides by the growth
    /// ratio; level 0 has its own fixed capacity.
    pub fn level_capacity(&self, level: u32) -> u64 {
        if level == 0 {
            return self.level0_files as u64;
        }
        let mut capacity = self.max_level_files;
        let mut current = self.nr_disk_level - 1;
        while current > level {
            capacity /= self.level_growth_ratio as u64;
            current -= 1;
        }
        capacity.max(1)
    }

    /// Hard per-level file bound: transient headroom for files built during
    /// a compaction before the sources are removed
    pub fn level_max_size(&self, level: u32) -> u64 {
        2 * self.level_capacity(level) + self.level0_files as u64
    }

    /// Catalogue slots = the sum of every level's hard bound
    pub fn total_file_slots(&self) -> u64 {
        (0..self.nr_disk_level).map(|l| self.level_max_size(l)).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn small_config(dir: &TempDir) -> Config {
        Config::builder()
            .device_path(dir.path().join("dev.img"))
            .blocks_per_segment(16)
            .nr_segment(8)
            .nr_disk_level(3)
            .level_growth_ratio(2)
            .level0_files(2)
            .max_level_files(4)
            .file_capacity(64)
            .memtable_capacity(16)
            .build()
    }

    #[test]
    fn test_regions_are_ordered_and_disjoint() {
        let dir = TempDir::new().unwrap();
        let sb = Superblock::compute(&small_config(&dir)).unwrap();

        assert!(sb.index_region_start >= 1);
        assert!(sb.journal_region_start > sb.index_region_start);
        assert!(sb.seg_validity_start >= sb.journal_region_start);
        assert!(sb.data_seg_table_start > sb.seg_validity_start);
        assert!(sb.reverse_index_start > sb.data_seg_table_start);
        assert!(sb.catalogue_start > sb.reverse_index_start);
        assert!(sb.data_region_start > sb.catalogue_start);
        assert_eq!(sb.total_blocks(), sb.data_region_start + 8 * 16);
    }

    #[test]
    fn test_write_read_validate() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut sb = Superblock::compute(&config).unwrap();

        let device = Arc::new(
            BlockDevice::open(&config.device_path, sb.total_blocks()).unwrap(),
        );
        sb.write(&device).unwrap();

        let loaded = Superblock::read(&device).unwrap();
        assert!(loaded.validate());
        assert_eq!(loaded, sb);
    }

    #[test]
    fn test_blank_device_fails_validation() {
        let dir = TempDir::new().unwrap();
        let device =
            BlockDevice::open(&dir.path().join("dev.img"), 16).unwrap();

        // all zeros deserializes but carries neither magic nor checksum
        match Superblock::read(&device) {
            Ok(sb) => assert!(!sb.validate()),
            Err(_) => {}
        }
    }

    #[test]
    fn test_corrupted_field_fails_validation() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let mut sb = Superblock::compute(&config).unwrap();

        let device =
            BlockDevice::open(&config.device_path, sb.total_blocks()).unwrap();
        sb.write(&device).unwrap();

        let mut loaded = Superblock::read(&device).unwrap();
        loaded.nr_segment += 1;
        assert!(!loaded.validate());
    }

    #[test]
    fn test_level_capacities() {
        let dir = TempDir::new().unwrap();
        let sb = Superblock::compute(&small_config(&dir)).unwrap();

        // 3 levels, ratio 2, deepest holds 4 files
        assert_eq!(sb.level_capacity(0), 2);
        assert_eq!(sb.level_capacity(1), 2);
        assert_eq!(sb.level_capacity(2), 4);
    }
}
