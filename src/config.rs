//! Configuration for VaultDisk
//!
//! Centralized configuration with sensible defaults.
//!
//! Geometry parameters (segment count and size, level count, growth ratio,
//! file/memtable capacities) are only authoritative when a device is first
//! formatted; on a validated mount the geometry persisted in the superblock
//! wins. Runtime parameters (pool size, workers, cache, GC threshold) take
//! effect on every open.

use std::path::PathBuf;

use crate::error::{Result, VaultError};

/// Main configuration for a VaultDisk engine instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Device
    // -------------------------------------------------------------------------
    /// Path of the backing block device (a regular file works).
    /// A `<path>.lock` sentinel next to it guards exclusive use.
    pub device_path: PathBuf,

    // -------------------------------------------------------------------------
    // Segment Geometry
    // -------------------------------------------------------------------------
    /// Physical blocks per segment (the unit of allocation and GC)
    pub blocks_per_segment: u64,

    /// Total number of data segments on the device
    pub nr_segment: u64,

    // -------------------------------------------------------------------------
    // Index Geometry
    // -------------------------------------------------------------------------
    /// Number of on-disk LSM levels, including level 0
    pub nr_disk_level: u32,

    /// Capacity ratio between adjacent disk levels
    pub level_growth_ratio: u32,

    /// File capacity of level 0
    pub level0_files: u32,

    /// File capacity of the deepest level; shallower levels divide by the
    /// growth ratio
    pub max_level_files: u64,

    /// Entries per Block Index Table file
    pub file_capacity: u64,

    // -------------------------------------------------------------------------
    // Write Path
    // -------------------------------------------------------------------------
    /// Max entries buffered in the memtable before minor compaction
    pub memtable_capacity: usize,

    /// Memtable implementation selected at construction
    pub memtable_kind: MemTableKind,

    /// Number of segment-buffer slots (exactly one is active at a time)
    pub pool_size: usize,

    /// Background flush worker threads
    pub flush_workers: usize,

    /// Record cache capacity (entries); 0 disables the cache
    pub cache_capacity: usize,

    // -------------------------------------------------------------------------
    // Garbage Collection
    // -------------------------------------------------------------------------
    /// Foreground GC runs while fewer than this many segments are free
    pub gc_free_threshold: u64,

    /// Route new writes into GC victims' free slots while under space
    /// pressure instead of the open segment (the threaded-logging variant)
    pub threaded_logging: bool,
}

/// Memtable backing structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemTableKind {
    /// Ordered map; drains without a sort pass
    BTree,

    /// Hash map; sorts once on drain
    Hash,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("./vaultdisk.img"),
            blocks_per_segment: 1024,
            nr_segment: 64,
            nr_disk_level: 3,
            level_growth_ratio: 4,
            level0_files: 4,
            max_level_files: 16,
            file_capacity: 4096,
            memtable_capacity: 1024,
            memtable_kind: MemTableKind::BTree,
            pool_size: 2,
            flush_workers: 1,
            cache_capacity: 4096,
            gc_free_threshold: 32, // half the default segment count
            threaded_logging: false,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check internal consistency before the engine uses the config
    pub fn validate(&self) -> Result<()> {
        if self.nr_segment == 0 || self.blocks_per_segment == 0 {
            return Err(VaultError::Config(
                "segment geometry must be non-zero".to_string(),
            ));
        }
        if self.nr_disk_level < 1 {
            return Err(VaultError::Config(
                "at least one disk level is required".to_string(),
            ));
        }
        if self.level_growth_ratio < 2 {
            return Err(VaultError::Config(
                "level growth ratio must be at least 2".to_string(),
            ));
        }
        if self.file_capacity == 0 {
            return Err(VaultError::Config(
                "file capacity must be non-zero".to_string(),
            ));
        }
        if self.memtable_capacity as u64 > self.file_capacity {
            // a minor compaction drains the whole memtable into one file
            return Err(VaultError::Config(format!(
                "memtable capacity {} exceeds file capacity {}",
                self.memtable_capacity, self.file_capacity
            )));
        }
        if self.pool_size < 2 {
            return Err(VaultError::Config(
                "segment buffer pool needs at least two slots".to_string(),
            ));
        }
        if self.flush_workers == 0 {
            return Err(VaultError::Config(
                "at least one flush worker is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the backing device path
    pub fn device_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.device_path = path.into();
        self
    }

    /// Set blocks per segment
    pub fn blocks_per_segment(mut self, blocks: u64) -> Self {
        self.config.blocks_per_segment = blocks;
        self
    }

    /// Set the total segment count
    pub fn nr_segment(mut self, count: u64) -> Self {
        self.config.nr_segment = count;
        self
    }

    /// Set the number of disk levels
    pub fn nr_disk_level(mut self, levels: u32) -> Self {
        self.config.nr_disk_level = levels;
        self
    }

    /// Set the inter-level growth ratio
    pub fn level_growth_ratio(mut self, ratio: u32) -> Self {
        self.config.level_growth_ratio = ratio;
        self
    }

    /// Set the level-0 file capacity
    pub fn level0_files(mut self, files: u32) -> Self {
        self.config.level0_files = files;
        self
    }

    /// Set the deepest level's file capacity
    pub fn max_level_files(mut self, files: u64) -> Self {
        self.config.max_level_files = files;
        self
    }

    /// Set entries per BIT file
    pub fn file_capacity(mut self, entries: u64) -> Self {
        self.config.file_capacity = entries;
        self
    }

    /// Set the memtable entry capacity
    pub fn memtable_capacity(mut self, entries: usize) -> Self {
        self.config.memtable_capacity = entries;
        self
    }

    /// Select the memtable implementation
    pub fn memtable_kind(mut self, kind: MemTableKind) -> Self {
        self.config.memtable_kind = kind;
        self
    }

    /// Set the segment buffer pool size
    pub fn pool_size(mut self, slots: usize) -> Self {
        self.config.pool_size = slots;
        self
    }

    /// Set the flush worker count
    pub fn flush_workers(mut self, workers: usize) -> Self {
        self.config.flush_workers = workers;
        self
    }

    /// Set the record cache capacity (0 disables)
    pub fn cache_capacity(mut self, entries: usize) -> Self {
        self.config.cache_capacity = entries;
        self
    }

    /// Set the free-segment threshold below which foreground GC runs
    pub fn gc_free_threshold(mut self, segments: u64) -> Self {
        self.config.gc_free_threshold = segments;
        self
    }

    /// Enable or disable the threaded-logging write variant
    pub fn threaded_logging(mut self, enabled: bool) -> Self {
        self.config.threaded_logging = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
