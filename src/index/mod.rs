//! Index Module
//!
//! The durable, leveled index mapping logical block addresses to physical
//! location plus cryptographic material: an LSM tree whose on-disk runs are
//! encrypted multiway search-tree files (Block Index Tables).
//!
//! ## Search path
//! cache -> memtable -> level 0 (version-filtered scan) -> levels 1..N
//! (binary search over sorted, non-overlapping files)
//!
//! ## Write path
//! memtable + cache; a full memtable flushes into a level-0 file (minor
//! compaction); a full level merges downward (major compaction).

pub mod bit;
pub mod cache;
pub mod compaction;
pub mod level;
pub mod memtable;
pub mod tree;

use serde::{Deserialize, Serialize};

use crate::crypto::{Iv, Key, Mac};

pub use cache::LruCache;
pub use level::{Level, LsmFile};
pub use memtable::{BTreeMemTable, HashMemTable, MemTable};
pub use tree::LsmTree;

/// Index value: where a logical block's ciphertext lives and how to open it.
/// Owned by whichever container currently holds it; copied, never aliased.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Physical block address (relative to the data region)
    pub pba: u64,
    pub key: Key,
    pub iv: Iv,
    pub mac: Mac,
}

/// Unit of index insertion and iteration
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub lba: u64,
    pub record: Record,
}
