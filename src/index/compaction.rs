//! Compaction
//!
//! Minor compaction flushes the memtable's sorted entries into one new
//! level-0 file. Major compaction demotes files from level L into level
//! L+1 through a k-way merge: a min-heap ordered by (key, version) yields
//! each key's highest-version entry once; merged output rolls into a new
//! file every `file_capacity` entries. Consumed source files are removed
//! from their levels and their catalogue slots released.
//!
//! Compaction pressure propagates downward: a full target level is
//! compacted first, so no level silently overflows.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::crypto::Cipher;
use crate::device::BlockDevice;
use crate::error::{Result, VaultError};
use crate::index::bit::{BitBuilder, BitFile};
use crate::index::level::{Level, LsmFile};
use crate::index::Entry;
use crate::meta::Catalogue;

/// Shared collaborators a compaction needs
pub(crate) struct CompactionCtx<'a> {
    pub device: &'a Arc<BlockDevice>,
    pub cipher: &'a Arc<dyn Cipher>,
    pub catalogue: &'a Catalogue,
    pub file_capacity: u64,
}

// =============================================================================
// K-Way Merge Ordering
// =============================================================================

/// Heap node: orders by ascending key, then descending file version, so
/// the surviving copy of each key pops first
struct HeapItem {
    entry: Entry,
    version: u64,
    src: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.entry.lba == other.entry.lba
            && self.version == other.version
            && self.src == other.src
    }
}

impl Eq for HeapItem {}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.entry
            .lba
            .cmp(&other.entry.lba)
            .then(other.version.cmp(&self.version))
            .then(self.src.cmp(&other.src))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// =============================================================================
// Minor Compaction
// =============================================================================

/// Flush drained memtable entries (already sorted) into a new level-0 file
pub(crate) fn minor_compact(
    ctx: &CompactionCtx,
    levels: &mut Vec<Level>,
    entries: Vec<Entry>,
) -> Result<()> {
    if levels[0].is_full() {
        major_compact(ctx, levels, 0)?;
    }
    if entries.is_empty() {
        return Ok(());
    }

    let count = entries.len();
    let mut builder = new_builder(ctx, 0)?;
    for entry in &entries {
        builder.add(entry)?;
    }
    finish_file(ctx, levels, 0, builder)?;

    tracing::debug!(entries = count, "minor compaction flushed memtable");
    Ok(())
}

// =============================================================================
// Major Compaction
// =============================================================================

/// Merge-demote from `level` into `level + 1`
pub(crate) fn major_compact(
    ctx: &CompactionCtx,
    levels: &mut Vec<Level>,
    level: usize,
) -> Result<()> {
    if level + 1 >= levels.len() {
        // nowhere deeper to demote
        return Err(VaultError::OutOfSpace);
    }
    if levels[level + 1].is_full() {
        major_compact(ctx, levels, level + 1)?;
    }

    let demoted = levels[level].pick_demoted();
    if demoted.is_empty() {
        return Ok(());
    }

    // key range covered by the demoted files
    let mut lo = u64::MAX;
    let mut hi = 0u64;
    for id in &demoted {
        let file = levels[level]
            .file(*id)
            .ok_or_else(|| VaultError::InvalidState(format!("demoted file {} missing", id)))?;
        lo = lo.min(file.first_key());
        hi = hi.max(file.last_key());
    }
    let overlapping = levels[level + 1].find_overlapping(lo, hi);

    // one iterator per source file; iterators own their state, so the
    // levels stay free to mutate afterwards
    let mut sources = Vec::new();
    for (owner, ids) in [(level, &demoted), (level + 1, &overlapping)] {
        for id in ids {
            let file = levels[owner]
                .file(*id)
                .ok_or_else(|| VaultError::InvalidState(format!("source file {} missing", id)))?;
            sources.push((file.iter()?, file.version()));
        }
    }

    let mut heap = BinaryHeap::new();
    for (src, (iter, version)) in sources.iter_mut().enumerate() {
        if let Some(first) = iter.next() {
            heap.push(Reverse(HeapItem {
                entry: first?,
                version: *version,
                src,
            }));
        }
    }

    let mut builder: Option<BitBuilder> = None;
    let mut last_emitted: Option<u64> = None;
    let mut produced = 0usize;

    while let Some(Reverse(item)) = heap.pop() {
        if let Some(next) = sources[item.src].0.next() {
            heap.push(Reverse(HeapItem {
                entry: next?,
                version: item.version,
                src: item.src,
            }));
        }

        // the highest version of this key already popped; discard the rest
        if last_emitted == Some(item.entry.lba) {
            continue;
        }
        last_emitted = Some(item.entry.lba);

        if builder.is_none() {
            builder = Some(new_builder(ctx, (level + 1) as u32)?);
        }
        if let Some(b) = builder.as_mut() {
            b.add(&item.entry)?;
        }

        let full = builder
            .as_ref()
            .map_or(false, |b| b.len() >= ctx.file_capacity);
        if full {
            if let Some(b) = builder.take() {
                finish_file(ctx, levels, level + 1, b)?;
                produced += 1;
            }
        }
    }

    if let Some(b) = builder.take() {
        finish_file(ctx, levels, level + 1, b)?;
        produced += 1;
    }

    // sources are fully merged: drop them from their levels and free
    // their catalogue slots
    for (owner, ids) in [(level, &demoted), (level + 1, &overlapping)] {
        for id in ids {
            levels[owner].remove_file(*id)?;
            ctx.catalogue.release(*id)?;
        }
    }

    tracing::info!(
        level,
        demoted = demoted.len(),
        overlapping = overlapping.len(),
        produced,
        "major compaction"
    );
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn new_builder(ctx: &CompactionCtx, target_level: u32) -> Result<BitBuilder> {
    let id = ctx.catalogue.alloc_file()?;
    let version = ctx.catalogue.next_version();
    Ok(BitBuilder::new(
        ctx.device.clone(),
        ctx.cipher.clone(),
        id,
        target_level,
        version,
        ctx.catalogue.file_start_block(id),
        ctx.catalogue.file_region_blocks(),
        ctx.file_capacity,
    ))
}

fn finish_file(
    ctx: &CompactionCtx,
    levels: &mut [Level],
    target_level: usize,
    builder: BitBuilder,
) -> Result<()> {
    let file: BitFile = builder.complete()?;
    ctx.catalogue.set_stats(&file.stat())?;
    levels[target_level].add_file(Box::new(file))
}
