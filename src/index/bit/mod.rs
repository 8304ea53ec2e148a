//! Block Index Table (BIT)
//!
//! The immutable encrypted multiway search-tree file format backing one
//! sorted run of the LSM tree.
//!
//! ## Node Slot Format
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Node slot (512 bytes)                                    │
//! │ ┌──────────────────────────────────┬───────────────────┐ │
//! │ │ AES-GCM ciphertext (496)         │ mac (16)          │ │
//! │ └──────────────────────────────────┴───────────────────┘ │
//! │ plaintext = bincode node, zero-padded to 496 bytes       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every node is independently authenticated-encrypted with key/iv material
//! carried by whichever pointer references it (a parent's child pointer, a
//! leaf's next-leaf pointer, or the file handle's root pointer). Leaves are
//! chained left-to-right so forward iteration never re-descends from the
//! root.

mod builder;
mod file;
mod iterator;

use serde::{Deserialize, Serialize};

pub use builder::BitBuilder;
pub use file::BitFile;
pub use iterator::BitFileIter;

use crate::crypto::{Cipher, Iv, Key, MAC_SIZE};
use crate::device::{BlockDevice, BLOCK_SIZE};
use crate::error::{Result, VaultError};
use crate::index::Record;

// =============================================================================
// Shared Constants (used by builder, file, iterator)
// =============================================================================

/// Children per inner node
pub const BIT_FANOUT: usize = 8;

/// On-disk size of one node slot
pub const BIT_NODE_SIZE: usize = 512;

/// Plaintext bytes per node slot (the rest is the mac)
pub const BIT_NODE_PAYLOAD: usize = BIT_NODE_SIZE - MAC_SIZE;

/// Builder staging buffer: nodes are flushed to the device in batches,
/// not one by one
pub const BUILDER_BUFFER_SIZE: usize = 64 * 1024;

// =============================================================================
// Node Types
// =============================================================================

/// Location + crypto material of one encrypted node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodePointer {
    /// Absolute device byte offset of the node slot
    pub pos: u64,
    pub key: Key,
    pub iv: Iv,
}

/// Leaf payload: one index entry plus the chain link to the next leaf
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BitLeaf {
    pub key: u64,
    pub record: Record,
    pub next: NodePointer,
}

/// One tree node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BitNode {
    Leaf(BitLeaf),
    /// (child key upper bound, child pointer), ascending
    Inner(Vec<(u64, NodePointer)>),
}

// =============================================================================
// Tree Geometry
// =============================================================================

/// Height of a tree holding `capacity` entries at the fixed fan-out
pub fn tree_height(capacity: u64) -> usize {
    let mut height = 1;
    let mut size = 1u64;
    if capacity == 0 {
        return 0;
    }
    while size < capacity {
        height += 1;
        size *= BIT_FANOUT as u64;
    }
    height
}

/// Worst-case node count of a file holding `capacity` entries
pub fn max_nodes(capacity: u64) -> u64 {
    if capacity == 0 {
        return 0;
    }
    let mut len = 0u64;
    let mut size = 1u64;
    while size < capacity {
        len += size;
        size *= BIT_FANOUT as u64;
    }
    len + capacity
}

/// Device blocks reserved per file slot in the index region
pub fn file_region_blocks(capacity: u64) -> u64 {
    let bytes = max_nodes(capacity) * BIT_NODE_SIZE as u64;
    (bytes + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64
}

// =============================================================================
// Node Sealing
// =============================================================================

/// Serialize, pad and authenticated-encrypt a node into its 512-byte slot
pub(crate) fn seal_node(
    cipher: &dyn Cipher,
    node: &BitNode,
    key: &Key,
    iv: &Iv,
) -> Result<Vec<u8>> {
    let encoded = bincode::serialize(node)?;
    if encoded.len() > BIT_NODE_PAYLOAD {
        return Err(VaultError::InvalidState(format!(
            "node serialized to {} bytes, slot payload is {}",
            encoded.len(),
            BIT_NODE_PAYLOAD
        )));
    }

    let mut payload = vec![0u8; BIT_NODE_PAYLOAD];
    payload[..encoded.len()].copy_from_slice(&encoded);

    let (ciphertext, mac) = cipher.encrypt(&payload, key, iv, 0)?;

    let mut slot = ciphertext;
    slot.extend_from_slice(&mac);
    Ok(slot)
}

/// Decrypt, verify and deserialize a node slot
pub(crate) fn open_node(cipher: &dyn Cipher, slot: &[u8], key: &Key, iv: &Iv) -> Result<BitNode> {
    if slot.len() != BIT_NODE_SIZE {
        return Err(VaultError::InvalidState(format!(
            "node slot of {} bytes",
            slot.len()
        )));
    }

    let mut mac = [0u8; MAC_SIZE];
    mac.copy_from_slice(&slot[BIT_NODE_PAYLOAD..]);

    let payload = cipher.decrypt(&slot[..BIT_NODE_PAYLOAD], key, iv, 0, &mac)?;
    let node = bincode::deserialize(&payload)?;
    Ok(node)
}

/// Read and open the node a pointer refers to
pub(crate) fn read_node(
    device: &BlockDevice,
    cipher: &dyn Cipher,
    pointer: &NodePointer,
) -> Result<BitNode> {
    let mut slot = vec![0u8; BIT_NODE_SIZE];
    device.read_at(pointer.pos, &mut slot)?;
    open_node(cipher, &slot, &pointer.key, &pointer.iv)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{random_iv, random_key, RingCipher};

    fn record(pba: u64) -> Record {
        Record {
            pba,
            key: random_key(),
            iv: random_iv(),
            mac: [7u8; MAC_SIZE],
        }
    }

    #[test]
    fn test_geometry() {
        assert_eq!(tree_height(1), 1);
        assert_eq!(tree_height(8), 2);
        assert_eq!(tree_height(9), 3);
        assert_eq!(tree_height(64), 3);

        // 64 leaves + 8 + 1
        assert_eq!(max_nodes(64), 73);
        assert!(file_region_blocks(64) >= 73 * BIT_NODE_SIZE as u64 / BLOCK_SIZE as u64);
    }

    #[test]
    fn test_node_slot_sizes_fit() {
        // the widest inner node must fit the slot payload
        let pointer = NodePointer {
            pos: u64::MAX,
            key: random_key(),
            iv: random_iv(),
        };
        let inner = BitNode::Inner(vec![(u64::MAX, pointer); BIT_FANOUT]);
        assert!(bincode::serialized_size(&inner).unwrap() as usize <= BIT_NODE_PAYLOAD);

        let leaf = BitNode::Leaf(BitLeaf {
            key: u64::MAX,
            record: record(u64::MAX),
            next: NodePointer {
                pos: u64::MAX,
                key: random_key(),
                iv: random_iv(),
            },
        });
        assert!(bincode::serialized_size(&leaf).unwrap() as usize <= BIT_NODE_PAYLOAD);
    }

    #[test]
    fn test_seal_open_round_trip() {
        let cipher = RingCipher::new();
        let key = random_key();
        let iv = random_iv();

        let node = BitNode::Leaf(BitLeaf {
            key: 42,
            record: record(9),
            next: NodePointer {
                pos: 1024,
                key: random_key(),
                iv: random_iv(),
            },
        });

        let slot = seal_node(&cipher, &node, &key, &iv).unwrap();
        assert_eq!(slot.len(), BIT_NODE_SIZE);

        let opened = open_node(&cipher, &slot, &key, &iv).unwrap();
        assert_eq!(opened, node);
    }

    #[test]
    fn test_tampered_slot_fails_auth() {
        let cipher = RingCipher::new();
        let key = random_key();
        let iv = random_iv();

        let node = BitNode::Inner(vec![(
            5,
            NodePointer {
                pos: 0,
                key: random_key(),
                iv: random_iv(),
            },
        )]);

        let mut slot = seal_node(&cipher, &node, &key, &iv).unwrap();
        slot[100] ^= 0x01;

        assert!(matches!(
            open_node(&cipher, &slot, &key, &iv),
            Err(crate::error::VaultError::AuthFailure)
        ));
    }
}
