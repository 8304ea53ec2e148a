//! LSM Tree Orchestrator
//!
//! Coordinates cache, memtable and disk levels.
//!
//! ## Concurrency Model
//! - `cache`: its own mutex, touched first on search
//! - `memtable`: RwLock; never held while level locks are taken
//! - `levels`: RwLock; a compaction (minor or major) holds the write lock
//!   for its whole duration, so concurrent compactions cannot happen and
//!   searches wait out the merge
//!
//! `put` runs synchronously with any compaction it triggers.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::Config;
use crate::crypto::Cipher;
use crate::device::BlockDevice;
use crate::error::{Result, VaultError};
use crate::index::bit::BitFile;
use crate::index::cache::LruCache;
use crate::index::compaction::{self, CompactionCtx};
use crate::index::level::Level;
use crate::index::memtable::{create_memtable, MemTable};
use crate::index::{Entry, Record};
use crate::meta::Metadata;

/// The durable, leveled index: lba -> Record
pub struct LsmTree {
    device: Arc<BlockDevice>,
    cipher: Arc<dyn Cipher>,
    meta: Arc<Metadata>,

    memtable: RwLock<Box<dyn MemTable>>,
    memtable_capacity: usize,

    levels: RwLock<Vec<Level>>,

    cache: Mutex<LruCache<u64, Record>>,

    file_capacity: u64,
}

impl LsmTree {
    /// Build the tree, reloading every live file from the catalogue
    pub fn open(
        device: Arc<BlockDevice>,
        cipher: Arc<dyn Cipher>,
        meta: Arc<Metadata>,
        config: &Config,
    ) -> Result<Self> {
        let sb = &meta.superblock;
        let file_capacity = sb.file_capacity;

        let mut levels: Vec<Level> = (0..sb.nr_disk_level)
            .map(|l| Level::new(l, sb.level_capacity(l), sb.level_max_size(l)))
            .collect();

        let stats = meta.catalogue.load()?;
        let reloaded = stats.len();
        for stat in stats {
            let level = stat.level as usize;
            if level >= levels.len() {
                return Err(VaultError::InvalidState(format!(
                    "catalogue file {} claims level {}",
                    stat.id, stat.level
                )));
            }
            let file = BitFile::from_stat(device.clone(), cipher.clone(), &stat);
            levels[level].add_file(Box::new(file))?;
        }
        if reloaded > 0 {
            tracing::info!(files = reloaded, "index reloaded from catalogue");
        }

        Ok(Self {
            device,
            cipher,
            file_capacity,
            meta,
            memtable: RwLock::new(create_memtable(config.memtable_kind)),
            memtable_capacity: config.memtable_capacity,
            levels: RwLock::new(levels),
            cache: Mutex::new(LruCache::new(config.cache_capacity)),
        })
    }

    /// Point lookup: cache -> memtable -> levels; on-disk hits populate
    /// the cache. `NotFound` is the miss outcome.
    pub fn search(&self, lba: u64) -> Result<Record> {
        if let Some(record) = self.cache.lock().get(&lba) {
            return Ok(record.clone());
        }

        {
            let memtable = self.memtable.read();
            if let Some(record) = memtable.get(lba) {
                drop(memtable);
                self.cache.lock().put(lba, record.clone());
                return Ok(record);
            }
        }

        let mut found = None;
        {
            let levels = self.levels.read();
            for level in levels.iter() {
                match level.search(lba) {
                    Ok(record) => {
                        found = Some(record);
                        break;
                    }
                    Err(VaultError::NotFound) => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        match found {
            Some(record) => {
                self.cache.lock().put(lba, record.clone());
                Ok(record)
            }
            None => Err(VaultError::NotFound),
        }
    }

    /// Lookup with the miss mapped to `None`
    pub fn get(&self, lba: u64) -> Result<Option<Record>> {
        match self.search(lba) {
            Ok(record) => Ok(Some(record)),
            Err(VaultError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Insert a mapping, returning the superseded record (if any) so the
    /// caller can invalidate its physical block. Triggers minor compaction
    /// when the memtable reaches capacity.
    pub fn put(&self, lba: u64, record: Record) -> Result<Option<Record>> {
        let prior = self.get(lba)?;

        let full = {
            let mut memtable = self.memtable.write();
            memtable.put(lba, record.clone());
            memtable.len() >= self.memtable_capacity
        };
        self.cache.lock().put(lba, record);

        if full {
            self.minor_compaction()?;
        }
        Ok(prior)
    }

    /// Force the memtable down to level 0 (engine shutdown)
    pub fn flush(&self) -> Result<()> {
        self.minor_compaction()
    }

    fn minor_compaction(&self) -> Result<()> {
        let mut levels = self.levels.write();
        let entries: Vec<Entry> = self.memtable.write().drain_sorted();
        if entries.is_empty() {
            return Ok(());
        }

        let ctx = CompactionCtx {
            device: &self.device,
            cipher: &self.cipher,
            catalogue: &self.meta.catalogue,
            file_capacity: self.file_capacity,
        };
        compaction::minor_compact(&ctx, &mut levels, entries)
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Entries currently buffered in the memtable
    pub fn memtable_len(&self) -> usize {
        self.memtable.read().len()
    }

    /// File count per level, shallowest first
    pub fn level_file_counts(&self) -> Vec<usize> {
        self.levels.read().iter().map(|l| l.len()).collect()
    }

    /// (first_key, last_key, version) per file of one level, in storage
    /// order
    pub fn level_file_ranges(&self, level: usize) -> Vec<(u64, u64, u64)> {
        let levels = self.levels.read();
        levels
            .get(level)
            .map(|l| {
                l.files()
                    .map(|f| (f.first_key(), f.last_key(), f.version()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
