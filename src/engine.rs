//! Engine Module
//!
//! The core storage engine that coordinates all components.
//!
//! ## Responsibilities
//! - Mount or (destructively) format the device metadata
//! - Route logical writes through the segment buffer and the index
//! - Serve logical reads from unflushed slots or by decrypting the device
//! - Apply foreground GC backpressure on the write path
//!
//! Every component receives its collaborators explicitly at construction;
//! nothing is reached through ambient globals.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Engine                            │
//! │   write(lba, payload)            read(lba)               │
//! └───────────┬──────────────────────────┬───────────────────┘
//!             │                          │
//!             ▼                          ▼
//!     ┌──────────────┐           ┌──────────────┐
//!     │SegmentBuffer │──put─────▶│   LsmTree    │
//!     │ (slots+pipe) │           │ (BIT levels) │
//!     └──────┬───────┘           └──────┬───────┘
//!            │ alloc/GC                 │ catalogue
//!            ▼                          ▼
//!     ┌──────────────┐           ┌──────────────┐
//!     │  Allocator   │──────────▶│   Metadata   │
//!     └──────────────┘           └──────────────┘
//! ```

use std::sync::Arc;

use bytes::Bytes;

use crate::config::Config;
use crate::crypto::Cipher;
use crate::device::{BlockDevice, BLOCK_SIZE};
use crate::error::{Result, VaultError};
use crate::index::tree::LsmTree;
use crate::meta::{Metadata, Superblock};
use crate::segment::{SegmentAllocator, SegmentBuffer};

/// The transparently encrypted block-storage engine
pub struct Engine {
    config: Config,
    device: Arc<BlockDevice>,
    cipher: Arc<dyn Cipher>,
    meta: Arc<Metadata>,
    allocator: Arc<SegmentAllocator>,
    tree: Arc<LsmTree>,
    segbuf: Arc<SegmentBuffer>,
    nr_logical_block: u64,
}

impl Engine {
    /// Open (mount or format) a device and bring up every component
    pub fn open(config: Config, cipher: Arc<dyn Cipher>) -> Result<Self> {
        config.validate()?;

        // geometry from the config sizes a fresh device; a valid existing
        // superblock overrides it below
        let wanted = Superblock::compute(&config)?;
        let device = Arc::new(BlockDevice::open(&config.device_path, wanted.total_blocks())?);

        let (meta, formatted) = Metadata::open(device.clone(), &config)?;
        let meta = Arc::new(meta);
        let nr_logical_block = meta.superblock.nr_block();

        let allocator = Arc::new(SegmentAllocator::new(
            device.clone(),
            cipher.clone(),
            meta.clone(),
            &config,
        )?);
        let tree = Arc::new(LsmTree::open(
            device.clone(),
            cipher.clone(),
            meta.clone(),
            &config,
        )?);
        let segbuf = Arc::new(SegmentBuffer::new(
            device.clone(),
            cipher.clone(),
            meta.clone(),
            tree.clone(),
            allocator.clone(),
            &config,
        )?);

        tracing::info!(
            device = %config.device_path.display(),
            formatted,
            segments = meta.superblock.nr_segment,
            blocks_per_segment = meta.superblock.blocks_per_segment,
            levels = meta.superblock.nr_disk_level,
            "engine opened"
        );

        Ok(Self {
            config,
            device,
            cipher,
            meta,
            allocator,
            tree,
            segbuf,
            nr_logical_block,
        })
    }

    /// Write one logical block. `payload` must be exactly one block.
    ///
    /// Runs foreground GC inline afterwards whenever the free-segment
    /// count sits below the threshold — deliberate blocking backpressure.
    pub fn write(&self, lba: u64, payload: &[u8]) -> Result<()> {
        if lba >= self.nr_logical_block {
            return Err(VaultError::OutOfRange);
        }
        if payload.len() != BLOCK_SIZE {
            return Err(VaultError::OutOfRange);
        }

        let threaded = self.config.threaded_logging && self.allocator.should_gc();
        self.segbuf.write_with(lba, payload, threaded)?;

        if self.allocator.should_gc() {
            self.allocator.foreground_gc(&self.segbuf, &self.tree)?;
        }
        Ok(())
    }

    /// Read one logical block; `None` if it was never written.
    ///
    /// Data not yet durable is served from the staging slots; otherwise
    /// ciphertext is read from the device and opened with the record's
    /// key/iv/mac.
    pub fn read(&self, lba: u64) -> Result<Option<Bytes>> {
        if lba >= self.nr_logical_block {
            return Err(VaultError::OutOfRange);
        }

        let Some(record) = self.tree.get(lba)? else {
            return Ok(None);
        };

        if let Some(cached) = self.segbuf.query(record.pba) {
            return Ok(Some(cached));
        }

        let ciphertext = self
            .device
            .read_block(self.meta.superblock.data_region_start + record.pba)?;
        let plaintext =
            self.cipher
                .decrypt(&ciphertext, &record.key, &record.iv, record.pba, &record.mac)?;
        Ok(Some(Bytes::from(plaintext)))
    }

    /// Push every staged block to the device and fsync
    pub fn flush(&self) -> Result<()> {
        self.segbuf.flush_all()
    }

    /// Flush data, persist the index, stop the workers
    pub fn shutdown(&self) -> Result<()> {
        self.segbuf.shutdown()?;
        self.tree.flush()?;
        self.device.flush()?;
        tracing::info!("engine shut down");
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Logical address space in blocks
    pub fn nr_logical_block(&self) -> u64 {
        self.nr_logical_block
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    pub fn allocator(&self) -> &SegmentAllocator {
        &self.allocator
    }

    pub fn tree(&self) -> &LsmTree {
        &self.tree
    }

    pub fn segment_buffer(&self) -> &SegmentBuffer {
        &self.segbuf
    }
}
