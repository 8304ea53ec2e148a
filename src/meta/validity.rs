//! Segment Validity Bitmap
//!
//! One bit per segment: set = allocated, clear = free. Free-segment scans
//! run from a cursor that persists across calls, with exactly one wraparound
//! retry before reporting the device exhausted.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::BlockDevice;
use crate::error::{Result, VaultError};
use crate::meta::disk_array::DiskBitset;

/// Global allocated/free state of every segment
pub struct SegmentValidity {
    inner: Mutex<Inner>,
    nr_segment: u64,
}

struct Inner {
    bitset: DiskBitset,
    cursor: u64,
}

impl SegmentValidity {
    pub fn new(device: Arc<BlockDevice>, start_block: u64, nr_segment: u64) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(Inner {
                bitset: DiskBitset::new(device, start_block, nr_segment)?,
                cursor: 0,
            }),
            nr_segment,
        })
    }

    /// Mark a segment allocated (write-through)
    pub fn take(&self, segment_id: u64) -> Result<()> {
        self.inner.lock().bitset.set(segment_id)
    }

    pub fn is_allocated(&self, segment_id: u64) -> Result<bool> {
        self.inner.lock().bitset.get(segment_id)
    }

    /// Clear a segment's bit, returning whether it was allocated
    pub fn test_and_clear(&self, segment_id: u64) -> Result<bool> {
        let inner = self.inner.lock();
        let old = inner.bitset.get(segment_id)?;
        inner.bitset.clear(segment_id)?;
        Ok(old)
    }

    /// Find the next free segment, scanning from the cursor with one
    /// wraparound retry; `OutOfSpace` when every segment is allocated.
    pub fn next_free(&self) -> Result<u64> {
        let mut inner = self.inner.lock();

        let mut tries = 0;
        loop {
            while inner.cursor < self.nr_segment {
                let segment = inner.cursor;
                if !inner.bitset.get(segment)? {
                    return Ok(segment);
                }
                inner.cursor += 1;
            }

            if tries >= 1 {
                return Err(VaultError::OutOfSpace);
            }
            tries += 1;
            inner.cursor = 0;
        }
    }

    /// Count allocated segments (mount-time accounting)
    pub fn count_allocated(&self) -> Result<u64> {
        let inner = self.inner.lock();
        let mut count = 0;
        for segment in 0..self.nr_segment {
            if inner.bitset.get(segment)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Reset every segment to free and rewind the cursor
    pub fn format(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.bitset.format(false)?;
        inner.cursor = 0;
        Ok(())
    }

    pub fn nr_segment(&self) -> u64 {
        self.nr_segment
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(nr_segment: u64) -> (TempDir, SegmentValidity) {
        let dir = TempDir::new().unwrap();
        let dev = Arc::new(BlockDevice::open(&dir.path().join("dev.img"), 8).unwrap());
        let validity = SegmentValidity::new(dev, 0, nr_segment).unwrap();
        validity.format().unwrap();
        (dir, validity)
    }

    #[test]
    fn test_scan_skips_allocated() {
        let (_dir, validity) = setup(8);

        assert_eq!(validity.next_free().unwrap(), 0);
        validity.take(0).unwrap();
        validity.take(1).unwrap();
        assert_eq!(validity.next_free().unwrap(), 2);
    }

    #[test]
    fn test_wraparound_retry() {
        let (_dir, validity) = setup(4);

        for segment in 0..4 {
            validity.take(segment).unwrap();
        }
        // cursor is past the end; freeing an early segment is only found
        // through the wraparound retry
        assert!(validity.next_free().is_err());
        assert!(validity.test_and_clear(1).unwrap());
        assert_eq!(validity.next_free().unwrap(), 1);
    }

    #[test]
    fn test_exhausted() {
        let (_dir, validity) = setup(3);

        for segment in 0..3 {
            validity.take(segment).unwrap();
        }
        assert!(matches!(validity.next_free(), Err(VaultError::OutOfSpace)));
    }

    #[test]
    fn test_count_allocated() {
        let (_dir, validity) = setup(8);

        validity.take(2).unwrap();
        validity.take(5).unwrap();
        assert_eq!(validity.count_allocated().unwrap(), 2);

        assert!(validity.test_and_clear(2).unwrap());
        assert!(!validity.test_and_clear(2).unwrap());
        assert_eq!(validity.count_allocated().unwrap(), 1);
    }
}
