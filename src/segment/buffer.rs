//! Segment Buffer
//!
//! Write staging: a fixed pool of in-memory slots, each holding a
//! plaintext staging buffer and a parallel ciphertext "pipe" buffer sized
//! to one full segment. Exactly one slot is active at a time.
//!
//! ## Write flow
//! 1. If the logical address's current record already lives in the active
//!    slot's open segment, the block is re-encrypted in place at its
//!    existing offset (no cursor movement, no invalidation).
//! 2. Otherwise the block takes the open segment's next offset (or, in the
//!    threaded-logging variant, a free offset of the worst GC victim and
//!    goes straight to the device), is encrypted with the slot's
//!    per-segment key and its pba as tweak, the index and reverse map are
//!    updated, and the superseded physical block is returned.
//! 3. A full slot is handed to the flush workers and the pool rotates to
//!    the next slot with a fresh segment and a fresh random key.
//!
//! ## Concurrency
//! Each slot has its own reader/writer lock: pushes and rotation take the
//! exclusive side; queries and the flush workers take the shared side, so
//! one slot flushes while a sibling is written. Rotation holds the old and
//! new slots' write locks in sequence — there is no window with zero
//! active slots.
//!
//! Flush jobs carry the slot's epoch. Rotation bumps the epoch when it
//! reuses a slot, after flushing any content a worker did not get to in
//! time, so a stale job can never flush (or skip) the wrong segment's
//! data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::{Bytes, BytesMut};
use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::crypto::{random_iv, random_key, Cipher, Key};
use crate::device::{BlockDevice, BLOCK_SIZE};
use crate::error::{Result, VaultError};
use crate::index::tree::LsmTree;
use crate::index::Record;
use crate::meta::Metadata;
use crate::segment::allocator::SegmentAllocator;

/// One staging slot
struct Slot {
    /// Open segment this slot is filling; `None` until first used
    segment: Option<u64>,
    /// Blocks written into the open segment
    cursor: u64,
    /// Bumped whenever the slot is reused for a new segment
    epoch: u64,
    /// Whether the staged prefix is durable on the device
    flushed: AtomicBool,
    /// Per-segment encryption key, refreshed at every rotation
    seg_key: Key,
    /// Plaintext copies, one block per offset
    staging: BytesMut,
    /// Ciphertext mirror handed to the device
    pipe: BytesMut,
}

/// Work item for the flush pool
struct FlushJob {
    index: usize,
    epoch: u64,
}

/// Fixed pool of staging slots with background flush workers
pub struct SegmentBuffer {
    slots: Arc<Vec<RwLock<Slot>>>,
    /// Index of the writable slot; mutated only during rotation, under
    /// both involved slots' write locks
    active: Mutex<usize>,

    device: Arc<BlockDevice>,
    cipher: Arc<dyn Cipher>,
    meta: Arc<Metadata>,
    tree: Arc<LsmTree>,
    allocator: Arc<SegmentAllocator>,

    blocks_per_segment: u64,
    data_region_start: u64,

    tx: Mutex<Option<Sender<FlushJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SegmentBuffer {
    pub fn new(
        device: Arc<BlockDevice>,
        cipher: Arc<dyn Cipher>,
        meta: Arc<Metadata>,
        tree: Arc<LsmTree>,
        allocator: Arc<SegmentAllocator>,
        config: &Config,
    ) -> Result<Self> {
        let sb = &meta.superblock;
        let blocks_per_segment = sb.blocks_per_segment;
        let data_region_start = sb.data_region_start;
        let segment_bytes = (blocks_per_segment as usize) * BLOCK_SIZE;

        let mut slots = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            slots.push(RwLock::new(Slot {
                segment: None,
                cursor: 0,
                epoch: 0,
                flushed: AtomicBool::new(true),
                seg_key: random_key(),
                staging: BytesMut::zeroed(segment_bytes),
                pipe: BytesMut::zeroed(segment_bytes),
            }));
        }
        let slots = Arc::new(slots);

        // the first active slot opens a segment up front
        {
            let mut first = slots[0].write();
            first.segment = Some(allocator.alloc()?);
        }

        let (tx, rx) = unbounded::<FlushJob>();
        let mut workers = Vec::with_capacity(config.flush_workers);
        for worker in 0..config.flush_workers {
            let rx = rx.clone();
            let slots = slots.clone();
            let device = device.clone();
            workers.push(std::thread::spawn(move || {
                while let Ok(job) = rx.recv() {
                    let outcome = flush_slot(
                        &slots,
                        &device,
                        data_region_start,
                        blocks_per_segment,
                        job.index,
                        Some(job.epoch),
                    );
                    if let Err(e) = outcome {
                        tracing::error!(worker, slot = job.index, error = %e, "segment flush failed");
                    }
                }
            }));
        }

        Ok(Self {
            slots,
            active: Mutex::new(0),
            device,
            cipher,
            meta,
            tree,
            allocator,
            blocks_per_segment,
            data_region_start,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Stage one logical block (normal write path)
    pub fn write(&self, lba: u64, payload: &[u8]) -> Result<()> {
        self.write_with(lba, payload, false)
    }

    /// Stage one logical block, optionally through the threaded-logging
    /// variant
    pub fn write_with(&self, lba: u64, payload: &[u8], threaded: bool) -> Result<()> {
        if payload.len() != BLOCK_SIZE {
            return Err(VaultError::OutOfRange);
        }

        loop {
            let index = *self.active.lock();
            let mut slot = self.slots[index].write();
            if *self.active.lock() != index {
                // lost a rotation race; retry against the new active slot
                continue;
            }

            // a previously failed rotation leaves a full slot behind
            if slot.cursor >= self.blocks_per_segment {
                self.rotate(index, &mut slot)?;
                continue;
            }

            let prior = self.tree.get(lba)?;

            // in-place modify: the current copy still sits in this open
            // segment, so overwrite it where it is
            if let (Some(record), Some(segment)) = (&prior, slot.segment) {
                if record.pba / self.blocks_per_segment == segment {
                    return self.modify_in_place(&mut slot, lba, record.clone(), payload);
                }
            }

            if threaded && self.push_threaded(index, slot.segment, lba, payload)? {
                return Ok(());
            }
            // without a usable victim, threaded mode falls back to the
            // open segment

            return self.push_block(index, &mut slot, lba, payload);
        }
    }

    /// Serve a physical block's plaintext if it still sits in an unflushed
    /// slot, scanning most- to least-recently active
    pub fn query(&self, pba: u64) -> Option<Bytes> {
        let pool = self.slots.len();
        let active = *self.active.lock();

        for distance in 0..pool {
            let index = (active + pool - distance) % pool;
            let slot = self.slots[index].read();
            let Some(segment) = slot.segment else {
                continue;
            };
            if pba / self.blocks_per_segment != segment {
                continue;
            }
            let offset = pba % self.blocks_per_segment;
            if offset >= slot.cursor {
                continue;
            }
            let start = offset as usize * BLOCK_SIZE;
            return Some(Bytes::copy_from_slice(&slot.staging[start..start + BLOCK_SIZE]));
        }
        None
    }

    /// Synchronously write every slot's staged prefix to the device
    /// (partial segments included) and flush
    pub fn flush_all(&self) -> Result<()> {
        for index in 0..self.slots.len() {
            flush_slot(
                &self.slots,
                &self.device,
                self.data_region_start,
                self.blocks_per_segment,
                index,
                None,
            )?;
        }
        self.device.flush()
    }

    /// Flush everything and stop the worker pool
    pub fn shutdown(&self) -> Result<()> {
        self.flush_all()?;

        // closing the channel ends the workers
        self.tx.lock().take();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }

    // =========================================================================
    // Write-Path Internals
    // =========================================================================

    fn modify_in_place(
        &self,
        slot: &mut Slot,
        lba: u64,
        record: Record,
        payload: &[u8],
    ) -> Result<()> {
        let offset = (record.pba % self.blocks_per_segment) as usize * BLOCK_SIZE;
        slot.staging[offset..offset + BLOCK_SIZE].copy_from_slice(payload);

        let iv = random_iv();
        let (ciphertext, mac) = self.cipher.encrypt(
            &slot.staging[offset..offset + BLOCK_SIZE],
            &slot.seg_key,
            &iv,
            record.pba,
        )?;
        slot.pipe[offset..offset + BLOCK_SIZE].copy_from_slice(&ciphertext);
        slot.flushed.store(false, Ordering::SeqCst);

        self.tree.put(
            lba,
            Record {
                pba: record.pba,
                key: slot.seg_key,
                iv,
                mac,
            },
        )?;
        Ok(())
    }

    /// Normal push: next offset of the open segment
    fn push_block(&self, index: usize, slot: &mut Slot, lba: u64, payload: &[u8]) -> Result<()> {
        let segment = slot.segment.ok_or_else(|| {
            VaultError::InvalidState("active slot without an open segment".to_string())
        })?;
        let pba = segment * self.blocks_per_segment + slot.cursor;
        let offset = slot.cursor as usize * BLOCK_SIZE;

        slot.staging[offset..offset + BLOCK_SIZE].copy_from_slice(payload);

        let iv = random_iv();
        let (ciphertext, mac) = self.cipher.encrypt(payload, &slot.seg_key, &iv, pba)?;
        slot.pipe[offset..offset + BLOCK_SIZE].copy_from_slice(&ciphertext);
        slot.flushed.store(false, Ordering::SeqCst);

        let prior = self.tree.put(
            lba,
            Record {
                pba,
                key: slot.seg_key,
                iv,
                mac,
            },
        )?;
        if let Some(old) = prior {
            self.meta.dst.return_block(old.pba)?;
        }
        self.meta.rit.set(pba, lba)?;

        slot.cursor += 1;
        if slot.cursor >= self.blocks_per_segment {
            self.rotate(index, slot)?;
        }
        Ok(())
    }

    /// Threaded-logging push: straight to a free offset of the worst
    /// victim, bypassing the staging buffer. Returns `false` when no
    /// victim can safely take the block.
    fn push_threaded(
        &self,
        active_index: usize,
        active_segment: Option<u64>,
        lba: u64,
        payload: &[u8],
    ) -> Result<bool> {
        let Some(victim) = self.meta.dst.peek_victim()? else {
            return Ok(false);
        };
        let Some(offset) = victim.first_free_offset(self.blocks_per_segment) else {
            return Ok(false);
        };

        // a victim still resident in a pool slot would shadow the direct
        // device write with stale staging content; leave it alone
        if active_segment == Some(victim.segment_id) {
            return Ok(false);
        }
        for (index, slot) in self.slots.iter().enumerate() {
            if index == active_index {
                continue;
            }
            if slot.read().segment == Some(victim.segment_id) {
                return Ok(false);
            }
        }

        let pba = victim.segment_id * self.blocks_per_segment + offset;
        self.meta.dst.take_block(pba)?;

        let key = random_key();
        let iv = random_iv();
        let (ciphertext, mac) = self.cipher.encrypt(payload, &key, &iv, pba)?;
        self.device
            .write_block(self.data_region_start + pba, &ciphertext)?;
        self.device.flush()?;

        let prior = self.tree.put(lba, Record { pba, key, iv, mac })?;
        if let Some(old) = prior {
            self.meta.dst.return_block(old.pba)?;
        }
        self.meta.rit.set(pba, lba)?;

        tracing::trace!(lba, pba, "threaded-logging write");
        Ok(true)
    }

    /// Hand the full slot to the flush workers and open the next slot.
    /// Runs under the full slot's write lock; acquires the next slot's
    /// write lock, which waits out any in-flight flush of that slot. If a
    /// queued flush for the next slot has not run yet, its content is
    /// flushed here before the slot is reused.
    fn rotate(&self, current: usize, current_slot: &mut Slot) -> Result<()> {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(FlushJob {
                index: current,
                epoch: current_slot.epoch,
            });
        }

        let next = (current + 1) % self.slots.len();
        let mut next_slot = self.slots[next].write();

        if next_slot.segment.is_some()
            && next_slot.cursor > 0
            && !next_slot.flushed.load(Ordering::SeqCst)
        {
            write_slot_prefix(
                &next_slot,
                &self.device,
                self.data_region_start,
                self.blocks_per_segment,
            )?;
            self.device.flush()?;
            next_slot.flushed.store(true, Ordering::SeqCst);
        }

        let segment = self.allocator.alloc()?;
        next_slot.segment = Some(segment);
        next_slot.cursor = 0;
        next_slot.epoch += 1;
        next_slot.flushed.store(true, Ordering::SeqCst);
        next_slot.seg_key = random_key();
        *self.active.lock() = next;

        tracing::debug!(from = current, to = next, segment, "slot rotation");
        Ok(())
    }
}

/// Write one slot's staged ciphertext prefix to its segment.
///
/// With an epoch given (worker path), a reused slot is left alone — the
/// rotation that reused it already flushed the old content.
fn flush_slot(
    slots: &[RwLock<Slot>],
    device: &BlockDevice,
    data_region_start: u64,
    blocks_per_segment: u64,
    index: usize,
    epoch: Option<u64>,
) -> Result<()> {
    let slot = slots[index].read();
    if let Some(expected) = epoch {
        if slot.epoch != expected {
            return Ok(());
        }
    }
    if slot.segment.is_none() || slot.cursor == 0 {
        return Ok(());
    }

    write_slot_prefix(&slot, device, data_region_start, blocks_per_segment)?;
    device.flush()?;
    slot.flushed.store(true, Ordering::SeqCst);

    tracing::debug!(slot = index, blocks = slot.cursor, "segment flushed");
    Ok(())
}

fn write_slot_prefix(
    slot: &Slot,
    device: &BlockDevice,
    data_region_start: u64,
    blocks_per_segment: u64,
) -> Result<()> {
    let Some(segment) = slot.segment else {
        return Ok(());
    };
    let bytes = slot.cursor as usize * BLOCK_SIZE;
    device.write_blocks(
        data_region_start + segment * blocks_per_segment,
        &slot.pipe[..bytes],
    )
}
