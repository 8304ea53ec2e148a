//! Metadata Module
//!
//! Persistent bookkeeping for the engine, laid out in contiguous regions
//! behind the superblock:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ Superblock (block 0)      magic + checksum + geometry     │
//! ├───────────────────────────────────────────────────────────┤
//! │ Index region              BIT file slots                  │
//! ├───────────────────────────────────────────────────────────┤
//! │ Journal region            reserved                        │
//! ├───────────────────────────────────────────────────────────┤
//! │ Segment validity bitmap   1 bit / segment                 │
//! ├───────────────────────────────────────────────────────────┤
//! │ Data segment table        bitmap + count / segment        │
//! ├───────────────────────────────────────────────────────────┤
//! │ Reverse index table       pba -> lba                      │
//! ├───────────────────────────────────────────────────────────┤
//! │ BIT catalogue             per-file handle stats           │
//! ├───────────────────────────────────────────────────────────┤
//! │ Data region               nr_segment * blocks_per_segment │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Mounting validates the superblock; on mismatch the device is treated as
//! unformatted and every region is (destructively) re-initialized.

mod catalogue;
mod data_seg_table;
mod disk_array;
mod reverse_index;
mod superblock;
mod validity;

use std::sync::Arc;

pub use catalogue::{Catalogue, CatalogueEntry, FileStat};
pub use data_seg_table::{DataSegmentEntry, DataSegmentTable, Victim};
pub use disk_array::{DiskArray, DiskBitset};
pub use reverse_index::{ReverseIndexEntry, ReverseIndexTable};
pub use superblock::{Superblock, SUPERBLOCK_MAGIC};
pub use validity::SegmentValidity;

use crate::config::Config;
use crate::device::BlockDevice;
use crate::error::Result;
use crate::index::bit;

/// Aggregate of every persistent table, created at the offsets the
/// superblock records
pub struct Metadata {
    pub superblock: Superblock,
    pub validity: SegmentValidity,
    pub dst: DataSegmentTable,
    pub rit: ReverseIndexTable,
    pub catalogue: Catalogue,
}

impl Metadata {
    /// Mount the device, or format it when the superblock does not
    /// validate. Returns the metadata and whether a format happened.
    pub fn open(device: Arc<BlockDevice>, config: &Config) -> Result<(Self, bool)> {
        let (superblock, should_format) = match Superblock::read(&device) {
            Ok(sb) if sb.validate() => (sb, false),
            _ => {
                let mut sb = Superblock::compute(config)?;
                sb.write(&device)?;
                tracing::info!(
                    nr_segment = sb.nr_segment,
                    blocks_per_segment = sb.blocks_per_segment,
                    "superblock invalid, formatting device"
                );
                (sb, true)
            }
        };

        let validity = SegmentValidity::new(
            device.clone(),
            superblock.seg_validity_start,
            superblock.nr_segment,
        )?;
        let dst = DataSegmentTable::new(
            device.clone(),
            superblock.data_seg_table_start,
            superblock.nr_segment,
            superblock.blocks_per_segment,
        )?;
        let rit = ReverseIndexTable::new(
            device.clone(),
            superblock.reverse_index_start,
            superblock.nr_block(),
        )?;
        let catalogue = Catalogue::new(
            device,
            &superblock,
            bit::file_region_blocks(superblock.file_capacity),
        )?;

        let meta = Self {
            superblock,
            validity,
            dst,
            rit,
            catalogue,
        };

        if should_format {
            meta.format()?;
        } else {
            meta.dst.load(&meta.validity)?;
        }

        Ok((meta, should_format))
    }

    /// Re-initialize every table (destructive)
    pub fn format(&self) -> Result<()> {
        self.validity.format()?;
        self.dst.format()?;
        self.rit.format()?;
        self.catalogue.format()
    }
}
