//! # VaultDisk
//!
//! A single-device, log-structured, transparently encrypted block-storage
//! engine:
//! - Segment-based space allocation with inline foreground GC
//! - Write staging that batches, authenticates-and-encrypts, and flushes
//!   full segments asynchronously
//! - A leveled index (LSM tree over encrypted multiway search-tree files)
//!   mapping logical addresses to ciphertext location + crypto material
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Engine (write/read)                     │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │  Segment    │          │  LSM Tree   │
//!   │  Buffer     │─records─▶│ (BIT files) │
//!   └──────┬──────┘          └──────┬──────┘
//!          │ alloc / foreground GC  │ memtable + cache + levels
//!          ▼                        ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │  Allocator  │          │  Catalogue  │
//!   └──────┬──────┘          └──────┬──────┘
//!          └───────────┬────────────┘
//!                      ▼
//!          ┌──────────────────────┐
//!          │ Metadata (superblock,│
//!          │ validity, DST, RIT)  │
//!          └──────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod crypto;
pub mod device;
pub mod meta;
pub mod segment;
pub mod index;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, VaultError};
pub use config::{Config, MemTableKind};
pub use crypto::{Cipher, RingCipher};
pub use device::BLOCK_SIZE;
pub use engine::Engine;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of VaultDisk
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
