//! Block Device
//!
//! File-backed block device with positional reads/writes.
//!
//! ## Responsibilities
//! - Block-granular and byte-granular positional I/O (no shared cursor)
//! - Explicit durability via `flush` (fsync)
//! - Exclusive-use guard: a `<path>.lock` sentinel file; a second open of
//!   the same device fails with `Busy`

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{Result, VaultError};

/// Block size for both metadata and data regions (bytes)
pub const BLOCK_SIZE: usize = 4096;

/// A file-backed block device
pub struct BlockDevice {
    file: File,
    nr_blocks: u64,
    lock_path: PathBuf,
}

impl BlockDevice {
    /// Open (or create) a device of at least `nr_blocks` blocks.
    ///
    /// Takes the exclusive-use lock; returns `Busy` if another instance
    /// holds it. An existing backing file is never shrunk.
    pub fn open(path: &Path, nr_blocks: u64) -> Result<Self> {
        let lock_path = Self::lock_path_for(path);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(VaultError::Busy);
            }
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                // do not leave the lock behind if the device itself failed
                let _ = std::fs::remove_file(&lock_path);
                VaultError::Io(e)
            })?;

        let wanted = nr_blocks * BLOCK_SIZE as u64;
        if file.metadata()?.len() < wanted {
            file.set_len(wanted)?;
        }

        Ok(Self {
            file,
            nr_blocks,
            lock_path,
        })
    }

    /// Total number of blocks
    pub fn nr_blocks(&self) -> u64 {
        self.nr_blocks
    }

    /// Read one block
    pub fn read_block(&self, block: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.read_block_into(block, &mut buf)?;
        Ok(buf)
    }

    /// Read one block into a caller-provided buffer
    pub fn read_block_into(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        if block >= self.nr_blocks || buf.len() != BLOCK_SIZE {
            return Err(VaultError::OutOfRange);
        }
        self.file.read_exact_at(buf, block * BLOCK_SIZE as u64)?;
        Ok(())
    }

    /// Write one block
    pub fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        if block >= self.nr_blocks || data.len() != BLOCK_SIZE {
            return Err(VaultError::OutOfRange);
        }
        self.file.write_all_at(data, block * BLOCK_SIZE as u64)?;
        Ok(())
    }

    /// Write a contiguous run of blocks starting at `block`.
    /// `data` must be a whole number of blocks.
    pub fn write_blocks(&self, block: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
            return Err(VaultError::OutOfRange);
        }
        let count = (data.len() / BLOCK_SIZE) as u64;
        if block + count > self.nr_blocks {
            return Err(VaultError::OutOfRange);
        }
        self.file.write_all_at(data, block * BLOCK_SIZE as u64)?;
        Ok(())
    }

    /// Read at an arbitrary byte position (index-node I/O)
    pub fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        if pos + buf.len() as u64 > self.nr_blocks * BLOCK_SIZE as u64 {
            return Err(VaultError::OutOfRange);
        }
        self.file.read_exact_at(buf, pos)?;
        Ok(())
    }

    /// Write at an arbitrary byte position (index-node I/O)
    pub fn write_at(&self, pos: u64, data: &[u8]) -> Result<()> {
        if pos + data.len() as u64 > self.nr_blocks * BLOCK_SIZE as u64 {
            return Err(VaultError::OutOfRange);
        }
        self.file.write_all_at(data, pos)?;
        Ok(())
    }

    /// Force all written data to stable storage
    pub fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn lock_path_for(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        path.with_file_name(name)
    }
}

impl Drop for BlockDevice {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_device(blocks: u64) -> (TempDir, BlockDevice) {
        let dir = TempDir::new().unwrap();
        let dev = BlockDevice::open(&dir.path().join("dev.img"), blocks).unwrap();
        (dir, dev)
    }

    #[test]
    fn test_block_round_trip() {
        let (_dir, dev) = temp_device(8);

        let data = vec![0xA5u8; BLOCK_SIZE];
        dev.write_block(3, &data).unwrap();
        dev.flush().unwrap();

        assert_eq!(dev.read_block(3).unwrap(), data);
    }

    #[test]
    fn test_out_of_range_block() {
        let (_dir, dev) = temp_device(4);

        assert!(matches!(
            dev.read_block(4),
            Err(VaultError::OutOfRange)
        ));
        assert!(matches!(
            dev.write_block(7, &vec![0u8; BLOCK_SIZE]),
            Err(VaultError::OutOfRange)
        ));
    }

    #[test]
    fn test_exclusive_use() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev.img");

        let first = BlockDevice::open(&path, 4).unwrap();
        assert!(matches!(BlockDevice::open(&path, 4), Err(VaultError::Busy)));

        drop(first);
        // lock released on drop
        BlockDevice::open(&path, 4).unwrap();
    }

    #[test]
    fn test_multi_block_write() {
        let (_dir, dev) = temp_device(8);

        let data = vec![0x11u8; BLOCK_SIZE * 3];
        dev.write_blocks(2, &data).unwrap();

        for block in 2..5 {
            assert_eq!(dev.read_block(block).unwrap(), vec![0x11u8; BLOCK_SIZE]);
        }
    }
}
