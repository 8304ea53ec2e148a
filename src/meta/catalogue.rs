//! BIT File Catalogue
//!
//! Persistent registry of Block Index Table files: allocates/releases file
//! slots in the index region, stores each live file's handle stats so the
//! LSM tree can be reloaded on mount, and hands out monotonically increasing
//! file versions.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::crypto::{Iv, Key, IV_SIZE, KEY_SIZE};
use crate::device::BlockDevice;
use crate::error::{Result, VaultError};
use crate::meta::disk_array::DiskArray;
use crate::meta::superblock::Superblock;

// =============================================================================
// Persistent Entry
// =============================================================================

/// Catalogue slot: file stats when `in_use`, garbage otherwise
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogueEntry {
    pub in_use: bool,
    pub level: u32,
    pub version: u64,
    pub first_key: u64,
    pub last_key: u64,
    pub root_pos: u64,
    pub root_key: Key,
    pub root_iv: Iv,
}

impl CatalogueEntry {
    pub fn unused() -> Self {
        Self {
            in_use: false,
            level: 0,
            version: 0,
            first_key: 0,
            last_key: 0,
            root_pos: 0,
            root_key: [0u8; KEY_SIZE],
            root_iv: [0u8; IV_SIZE],
        }
    }
}

/// Runtime handle stats of a live BIT file
#[derive(Debug, Clone, PartialEq)]
pub struct FileStat {
    pub id: u64,
    pub level: u32,
    pub version: u64,
    pub first_key: u64,
    pub last_key: u64,
    pub root_pos: u64,
    pub root_key: Key,
    pub root_iv: Iv,
}

// =============================================================================
// Catalogue
// =============================================================================

pub struct Catalogue {
    inner: Mutex<Inner>,
    file_slots: u64,
    file_region_blocks: u64,
    index_region_start: u64,
}

struct Inner {
    array: DiskArray<CatalogueEntry>,
    /// Slots handed out by `alloc_file` whose stats are not yet persisted
    reserved: HashSet<u64>,
    next_version: u64,
}

impl Catalogue {
    pub fn new(
        device: Arc<BlockDevice>,
        superblock: &Superblock,
        file_region_blocks: u64,
    ) -> Result<Self> {
        let file_slots = superblock.total_file_slots();
        Ok(Self {
            inner: Mutex::new(Inner {
                array: DiskArray::new(
                    device,
                    superblock.catalogue_start,
                    file_slots,
                    &CatalogueEntry::unused(),
                )?,
                reserved: HashSet::new(),
                next_version: 1,
            }),
            file_slots,
            file_region_blocks,
            index_region_start: superblock.index_region_start,
        })
    }

    /// Load every live file's stats; primes the version counter
    pub fn load(&self) -> Result<Vec<FileStat>> {
        let mut inner = self.inner.lock();
        let mut stats = Vec::new();

        for id in 0..self.file_slots {
            let entry = inner.array.get(id)?;
            if !entry.in_use {
                continue;
            }
            inner.next_version = inner.next_version.max(entry.version + 1);
            stats.push(FileStat {
                id,
                level: entry.level,
                version: entry.version,
                first_key: entry.first_key,
                last_key: entry.last_key,
                root_pos: entry.root_pos,
                root_key: entry.root_key,
                root_iv: entry.root_iv,
            });
        }
        Ok(stats)
    }

    pub fn format(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.array.format(&CatalogueEntry::unused())?;
        inner.reserved.clear();
        inner.next_version = 1;
        Ok(())
    }

    /// Reserve a free file slot
    pub fn alloc_file(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        for id in 0..self.file_slots {
            if inner.reserved.contains(&id) {
                continue;
            }
            if !inner.array.get(id)?.in_use {
                inner.reserved.insert(id);
                return Ok(id);
            }
        }
        Err(VaultError::OutOfSpace)
    }

    /// Next monotonically increasing file version
    pub fn next_version(&self) -> u64 {
        let mut inner = self.inner.lock();
        let version = inner.next_version;
        inner.next_version += 1;
        version
    }

    /// Persist a built file's stats, committing its reserved slot
    pub fn set_stats(&self, stat: &FileStat) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.array.set(
            stat.id,
            &CatalogueEntry {
                in_use: true,
                level: stat.level,
                version: stat.version,
                first_key: stat.first_key,
                last_key: stat.last_key,
                root_pos: stat.root_pos,
                root_key: stat.root_key,
                root_iv: stat.root_iv,
            },
        )?;
        inner.reserved.remove(&stat.id);
        Ok(())
    }

    /// Release a consumed file's slot after compaction destroyed it
    pub fn release(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut entry = inner.array.get(id)?;
        entry.in_use = false;
        inner.array.set(id, &entry)?;
        inner.reserved.remove(&id);
        Ok(())
    }

    /// First device block of a file slot's data in the index region
    pub fn file_start_block(&self, id: u64) -> u64 {
        self.index_region_start + id * self.file_region_blocks
    }

    pub fn file_region_blocks(&self) -> u64 {
        self.file_region_blocks
    }

    pub fn file_slots(&self) -> u64 {
        self.file_slots
    }
}
