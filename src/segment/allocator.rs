//! Segment Allocator
//!
//! Free-segment acquisition and foreground garbage collection.
//!
//! GC runs inline on the calling writer's thread once the free-segment
//! count drops below the configured threshold: this synchronous cost is the
//! deliberate backpressure bounding total space amplification, and is never
//! made asynchronous — an async cleaner could let writers outrun free
//! space. Relocated blocks re-enter the normal write path, so the index and
//! reverse map update as side effects; the victim segment is freed only
//! after every valid block's relocation succeeded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::crypto::Cipher;
use crate::device::BlockDevice;
use crate::error::{Result, VaultError};
use crate::index::tree::LsmTree;
use crate::meta::Metadata;
use crate::segment::buffer::SegmentBuffer;

/// Acquires free segments and reclaims invalidated ones
pub struct SegmentAllocator {
    device: Arc<BlockDevice>,
    cipher: Arc<dyn Cipher>,
    meta: Arc<Metadata>,

    nr_segment: u64,
    blocks_per_segment: u64,
    data_region_start: u64,
    gc_free_threshold: u64,

    free_segments: AtomicU64,
}

impl SegmentAllocator {
    pub fn new(
        device: Arc<BlockDevice>,
        cipher: Arc<dyn Cipher>,
        meta: Arc<Metadata>,
        config: &Config,
    ) -> Result<Self> {
        let nr_segment = meta.superblock.nr_segment;
        let blocks_per_segment = meta.superblock.blocks_per_segment;
        let data_region_start = meta.superblock.data_region_start;
        let allocated = meta.validity.count_allocated()?;

        Ok(Self {
            device,
            cipher,
            meta,
            nr_segment,
            blocks_per_segment,
            data_region_start,
            gc_free_threshold: config.gc_free_threshold,
            free_segments: AtomicU64::new(nr_segment - allocated),
        })
    }

    /// Acquire the next free segment as a write target.
    ///
    /// Scans the validity bitmap from the persistent cursor with one
    /// wraparound retry; `OutOfSpace` when the device is exhausted.
    pub fn alloc(&self) -> Result<u64> {
        let segment_id = self.meta.validity.next_free()?;
        self.meta.validity.take(segment_id)?;
        self.meta.dst.take_segment(segment_id)?;
        self.free_segments.fetch_sub(1, Ordering::SeqCst);

        tracing::debug!(segment = segment_id, "segment allocated");
        Ok(segment_id)
    }

    /// Current free-segment count
    pub fn free_segments(&self) -> u64 {
        self.free_segments.load(Ordering::SeqCst)
    }

    pub fn nr_segment(&self) -> u64 {
        self.nr_segment
    }

    /// Whether the free fraction fell below the cleaning threshold
    pub fn should_gc(&self) -> bool {
        self.free_segments() < self.gc_free_threshold
    }

    /// Reclaim victims until back above the threshold or nothing is
    /// reclaimable. Runs to completion on the calling thread; no
    /// cancellation exists.
    pub fn foreground_gc(&self, segbuf: &SegmentBuffer, tree: &LsmTree) -> Result<()> {
        if !self.should_gc() {
            return Ok(());
        }

        let mut cleaned = 0u64;
        while self.should_gc() {
            let Some(victim) = self.meta.dst.pop_victim()? else {
                // every allocated segment is fully valid; only new
                // overwrites can create reclaimable space
                break;
            };
            self.relocate_victim(&victim, segbuf, tree)?;

            // every relocation and index update succeeded; only now
            // release the segment
            let segment_id = victim.segment_id;
            self.meta.dst.remove_victim(segment_id);
            let was_allocated = self.meta.validity.test_and_clear(segment_id)?;
            self.meta.dst.reset(segment_id)?;

            if was_allocated {
                self.free_segments.fetch_add(1, Ordering::SeqCst);
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            tracing::info!(
                cleaned,
                free = self.free_segments(),
                "foreground gc reclaimed segments"
            );
        }
        Ok(())
    }

    /// Re-write every still-valid block of a victim through the normal
    /// write path
    fn relocate_victim(
        &self,
        victim: &crate::meta::Victim,
        segbuf: &SegmentBuffer,
        tree: &LsmTree,
    ) -> Result<()> {
        tracing::debug!(
            segment = victim.segment_id,
            valid = victim.valid_count,
            "gc relocating victim"
        );

        for offset in victim.valid_offsets(self.blocks_per_segment) {
            let pba = victim.segment_id * self.blocks_per_segment + offset;

            let lba = match self.meta.rit.get(pba) {
                Ok(lba) => lba,
                Err(VaultError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            let Some(record) = tree.get(lba)? else {
                continue;
            };
            if record.pba != pba {
                // the index has already moved on from this copy
                continue;
            }

            let plaintext = match segbuf.query(pba) {
                Some(cached) => cached.to_vec(),
                None => {
                    let ciphertext = self.device.read_block(self.data_region_start + pba)?;
                    self.cipher
                        .decrypt(&ciphertext, &record.key, &record.iv, pba, &record.mac)?
                }
            };
            segbuf.write(lba, &plaintext)?;
        }
        Ok(())
    }
}
