//! Data Segment Table & Victim Tracking
//!
//! Per-segment block-validity bookkeeping plus the victim index: an ordered
//! view of reclaimable segments ranked by ascending valid-block count.
//!
//! Invariants:
//! - `valid_count == popcount(bitmap)` for every persisted entry
//! - a segment occupies at most one victim-index node at a time
//! - only allocated segments are indexed as victims; the active write target
//!   never is (its count stays at capacity until the first `return_block`)

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::device::BlockDevice;
use crate::error::{Result, VaultError};
use crate::meta::disk_array::DiskArray;
use crate::meta::validity::SegmentValidity;

// =============================================================================
// Persistent Entry
// =============================================================================

/// Per-segment valid-block bitmap and count
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataSegmentEntry {
    pub valid_count: u32,
    pub bitmap: Vec<u64>,
}

impl DataSegmentEntry {
    const BITS_PER_WORD: u64 = 64;

    fn words_for(blocks_per_segment: u64) -> usize {
        ((blocks_per_segment - 1) / Self::BITS_PER_WORD + 1) as usize
    }

    /// Entry with no valid blocks
    pub fn empty(blocks_per_segment: u64) -> Self {
        Self {
            valid_count: 0,
            bitmap: vec![0u64; Self::words_for(blocks_per_segment)],
        }
    }

    /// Entry with every block valid
    pub fn full(blocks_per_segment: u64) -> Self {
        let words = Self::words_for(blocks_per_segment);
        let mut bitmap = vec![u64::MAX; words];
        let tail_bits = blocks_per_segment % Self::BITS_PER_WORD;
        if tail_bits != 0 {
            bitmap[words - 1] = (1u64 << tail_bits) - 1;
        }
        Self {
            valid_count: blocks_per_segment as u32,
            bitmap,
        }
    }

    pub fn is_block_valid(&self, offset: u64) -> bool {
        let word = self.bitmap[(offset / Self::BITS_PER_WORD) as usize];
        word & (1u64 << (offset % Self::BITS_PER_WORD)) != 0
    }

    fn set_block(&mut self, offset: u64) {
        self.bitmap[(offset / Self::BITS_PER_WORD) as usize] |=
            1u64 << (offset % Self::BITS_PER_WORD);
    }

    fn clear_block(&mut self, offset: u64) {
        self.bitmap[(offset / Self::BITS_PER_WORD) as usize] &=
            !(1u64 << (offset % Self::BITS_PER_WORD));
    }

    /// Offsets of all valid blocks, ascending
    pub fn valid_offsets(&self, blocks_per_segment: u64) -> Vec<u64> {
        (0..blocks_per_segment)
            .filter(|&offset| self.is_block_valid(offset))
            .collect()
    }

    /// First invalid block offset, if any
    pub fn first_free_offset(&self, blocks_per_segment: u64) -> Option<u64> {
        (0..blocks_per_segment).find(|&offset| !self.is_block_valid(offset))
    }
}

// =============================================================================
// Victim
// =============================================================================

/// Transient descriptor of a reclaimable segment
#[derive(Debug, Clone)]
pub struct Victim {
    pub segment_id: u64,
    pub valid_count: u32,
    pub bitmap: Vec<u64>,
}

impl Victim {
    fn as_entry(&self) -> DataSegmentEntry {
        DataSegmentEntry {
            valid_count: self.valid_count,
            bitmap: self.bitmap.clone(),
        }
    }

    pub fn valid_offsets(&self, blocks_per_segment: u64) -> Vec<u64> {
        self.as_entry().valid_offsets(blocks_per_segment)
    }

    pub fn first_free_offset(&self, blocks_per_segment: u64) -> Option<u64> {
        self.as_entry().first_free_offset(blocks_per_segment)
    }
}

// =============================================================================
// Table
// =============================================================================

/// Segment lifecycle bookkeeping with an in-memory victim index
pub struct DataSegmentTable {
    inner: Mutex<Inner>,
    blocks_per_segment: u64,
    nr_segment: u64,
}

struct Inner {
    array: DiskArray<DataSegmentEntry>,
    /// Victim index ordered by (valid_count, segment_id)
    victims: BTreeSet<(u32, u64)>,
    /// Membership map: segment -> its current rank in `victims`
    ranks: HashMap<u64, u32>,
}

impl DataSegmentTable {
    pub fn new(
        device: Arc<BlockDevice>,
        start_block: u64,
        nr_segment: u64,
        blocks_per_segment: u64,
    ) -> Result<Self> {
        let template = DataSegmentEntry::empty(blocks_per_segment);
        Ok(Self {
            inner: Mutex::new(Inner {
                array: DiskArray::new(device, start_block, nr_segment, &template)?,
                victims: BTreeSet::new(),
                ranks: HashMap::new(),
            }),
            blocks_per_segment,
            nr_segment,
        })
    }

    /// Rebuild the victim index from persisted entries on mount
    pub fn load(&self, validity: &SegmentValidity) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.victims.clear();
        inner.ranks.clear();

        for segment_id in 0..self.nr_segment {
            if !validity.is_allocated(segment_id)? {
                continue;
            }
            let entry = inner.array.get(segment_id)?;
            if (entry.valid_count as u64) < self.blocks_per_segment {
                inner.victims.insert((entry.valid_count, segment_id));
                inner.ranks.insert(segment_id, entry.valid_count);
            }
        }
        Ok(())
    }

    /// Reset every entry and drop all victims
    pub fn format(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .array
            .format(&DataSegmentEntry::empty(self.blocks_per_segment))?;
        inner.victims.clear();
        inner.ranks.clear();
        Ok(())
    }

    /// Read a copy of one segment's entry
    pub fn entry(&self, segment_id: u64) -> Result<DataSegmentEntry> {
        self.inner.lock().array.get(segment_id)
    }

    /// Mark every block of a free segment valid — the segment becomes the
    /// active write target. Fails if it already has valid blocks.
    pub fn take_segment(&self, segment_id: u64) -> Result<()> {
        let mut inner = self.inner.lock();

        let entry = inner.array.get(segment_id)?;
        if entry.valid_count != 0 {
            return Err(VaultError::InvalidState(format!(
                "segment {} taken with {} valid blocks",
                segment_id, entry.valid_count
            )));
        }

        inner
            .array
            .set(segment_id, &DataSegmentEntry::full(self.blocks_per_segment))?;
        Self::remove_locked(&mut inner, segment_id);
        Ok(())
    }

    /// Mark a single block valid (threaded-logging allocations into a
    /// victim's free slots)
    pub fn take_block(&self, pba: u64) -> Result<()> {
        let segment_id = pba / self.blocks_per_segment;
        let offset = pba % self.blocks_per_segment;
        let mut inner = self.inner.lock();

        let mut entry = inner.array.get(segment_id)?;
        if entry.is_block_valid(offset) {
            return Err(VaultError::InvalidState(format!(
                "block {} already valid",
                pba
            )));
        }
        entry.set_block(offset);
        entry.valid_count += 1;
        inner.array.set(segment_id, &entry)?;

        Self::remove_locked(&mut inner, segment_id);
        if (entry.valid_count as u64) < self.blocks_per_segment {
            inner.victims.insert((entry.valid_count, segment_id));
            inner.ranks.insert(segment_id, entry.valid_count);
        }
        Ok(())
    }

    /// Invalidate one block: a logical overwrite superseded it, or GC
    /// relocated it. Re-ranks the owning segment in the victim index.
    pub fn return_block(&self, pba: u64) -> Result<()> {
        let segment_id = pba / self.blocks_per_segment;
        let offset = pba % self.blocks_per_segment;
        let mut inner = self.inner.lock();

        let mut entry = inner.array.get(segment_id)?;
        if entry.valid_count == 0 || !entry.is_block_valid(offset) {
            return Err(VaultError::InvalidState(format!(
                "block {} returned while not valid",
                pba
            )));
        }
        entry.clear_block(offset);
        entry.valid_count -= 1;
        inner.array.set(segment_id, &entry)?;

        Self::remove_locked(&mut inner, segment_id);
        inner.victims.insert((entry.valid_count, segment_id));
        inner.ranks.insert(segment_id, entry.valid_count);
        Ok(())
    }

    /// The globally least-valid victim, without removing it
    pub fn peek_victim(&self) -> Result<Option<Victim>> {
        let inner = self.inner.lock();
        let Some(&(_, segment_id)) = inner.victims.iter().next() else {
            return Ok(None);
        };
        let entry = inner.array.get(segment_id)?;
        Ok(Some(Victim {
            segment_id,
            valid_count: entry.valid_count,
            bitmap: entry.bitmap,
        }))
    }

    /// Remove and return the least-valid victim
    pub fn pop_victim(&self) -> Result<Option<Victim>> {
        let mut inner = self.inner.lock();
        let Some(&(_, segment_id)) = inner.victims.iter().next() else {
            return Ok(None);
        };
        Self::remove_locked(&mut inner, segment_id);

        let entry = inner.array.get(segment_id)?;
        Ok(Some(Victim {
            segment_id,
            valid_count: entry.valid_count,
            bitmap: entry.bitmap,
        }))
    }

    /// Extract a specific segment from the victim index prior to mutating it
    pub fn remove_victim(&self, segment_id: u64) -> bool {
        Self::remove_locked(&mut self.inner.lock(), segment_id)
    }

    /// Zero a segment's entry after GC freed it
    pub fn reset(&self, segment_id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .array
            .set(segment_id, &DataSegmentEntry::empty(self.blocks_per_segment))?;
        Self::remove_locked(&mut inner, segment_id);
        Ok(())
    }

    /// Victims currently indexed (ascending valid count)
    pub fn victim_segments(&self) -> Vec<u64> {
        self.inner
            .lock()
            .victims
            .iter()
            .map(|&(_, segment_id)| segment_id)
            .collect()
    }

    pub fn victim_count(&self) -> usize {
        self.inner.lock().victims.len()
    }

    fn remove_locked(inner: &mut Inner, segment_id: u64) -> bool {
        if let Some(rank) = inner.ranks.remove(&segment_id) {
            inner.victims.remove(&(rank, segment_id));
            true
        } else {
            false
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BPS: u64 = 16;

    fn setup(nr_segment: u64) -> (TempDir, DataSegmentTable) {
        let dir = TempDir::new().unwrap();
        let dev = Arc::new(BlockDevice::open(&dir.path().join("dev.img"), 16).unwrap());
        let dst = DataSegmentTable::new(dev, 0, nr_segment, BPS).unwrap();
        dst.format().unwrap();
        (dir, dst)
    }

    #[test]
    fn test_take_segment_fills_entry() {
        let (_dir, dst) = setup(4);

        dst.take_segment(1).unwrap();
        let entry = dst.entry(1).unwrap();

        assert_eq!(entry.valid_count as u64, BPS);
        for offset in 0..BPS {
            assert!(entry.is_block_valid(offset));
        }
        // full segment is not a victim
        assert_eq!(dst.victim_count(), 0);
    }

    #[test]
    fn test_take_segment_twice_fails() {
        let (_dir, dst) = setup(4);

        dst.take_segment(0).unwrap();
        assert!(matches!(
            dst.take_segment(0),
            Err(VaultError::InvalidState(_))
        ));
    }

    #[test]
    fn test_return_block_decrements_and_ranks() {
        let (_dir, dst) = setup(4);

        dst.take_segment(2).unwrap();
        dst.return_block(2 * BPS + 5).unwrap();

        let entry = dst.entry(2).unwrap();
        assert_eq!(entry.valid_count as u64, BPS - 1);
        assert!(!entry.is_block_valid(5));
        assert_eq!(dst.victim_segments(), vec![2]);
    }

    #[test]
    fn test_victims_ordered_by_valid_count() {
        let (_dir, dst) = setup(4);

        dst.take_segment(0).unwrap();
        dst.take_segment(1).unwrap();

        // segment 1 loses two blocks, segment 0 loses one
        dst.return_block(BPS).unwrap();
        dst.return_block(BPS + 1).unwrap();
        dst.return_block(3).unwrap();

        let victim = dst.peek_victim().unwrap().unwrap();
        assert_eq!(victim.segment_id, 1);
        assert_eq!(victim.valid_count as u64, BPS - 2);

        let popped = dst.pop_victim().unwrap().unwrap();
        assert_eq!(popped.segment_id, 1);
        // exclusive membership: popping removed it
        assert_eq!(dst.victim_segments(), vec![0]);
    }

    #[test]
    fn test_remove_victim_exclusivity() {
        let (_dir, dst) = setup(4);

        dst.take_segment(0).unwrap();
        dst.return_block(7).unwrap();

        assert!(dst.remove_victim(0));
        assert!(!dst.remove_victim(0));
        assert_eq!(dst.victim_count(), 0);

        // the next return re-inserts at the new rank
        dst.return_block(8).unwrap();
        assert_eq!(dst.victim_segments(), vec![0]);
    }

    #[test]
    fn test_take_block_marks_single_block() {
        let (_dir, dst) = setup(4);

        dst.take_segment(0).unwrap();
        for offset in 0..4 {
            dst.return_block(offset).unwrap();
        }

        dst.take_block(2).unwrap();
        let entry = dst.entry(0).unwrap();
        assert!(entry.is_block_valid(2));
        assert_eq!(entry.valid_count as u64, BPS - 3);

        assert!(matches!(
            dst.take_block(2),
            Err(VaultError::InvalidState(_))
        ));
    }

    #[test]
    fn test_reset_clears_entry_and_victim() {
        let (_dir, dst) = setup(4);

        dst.take_segment(3).unwrap();
        dst.return_block(3 * BPS).unwrap();
        assert_eq!(dst.victim_count(), 1);

        dst.reset(3).unwrap();
        assert_eq!(dst.entry(3).unwrap().valid_count, 0);
        assert_eq!(dst.victim_count(), 0);
    }

    #[test]
    fn test_first_free_offset() {
        let entry = DataSegmentEntry::full(BPS);
        assert_eq!(entry.first_free_offset(BPS), None);

        let mut entry = entry;
        entry.clear_block(9);
        assert_eq!(entry.first_free_offset(BPS), Some(9));
    }
}
