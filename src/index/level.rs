//! LSM Levels
//!
//! One sorted-run container per disk level. Level 0 holds unordered,
//! possibly-overlapping files and searches all of them, keeping the hit
//! from the highest file version. Levels >= 1 keep files sorted by first
//! key with non-overlapping ranges and binary-search for the owning file.

use crate::error::{Result, VaultError};
use crate::index::{Entry, Record};
use crate::meta::FileStat;

/// One immutable sorted run, whatever its on-disk format
pub trait LsmFile: Send + Sync {
    fn id(&self) -> u64;
    fn level(&self) -> u32;
    fn version(&self) -> u64;
    fn first_key(&self) -> u64;
    fn last_key(&self) -> u64;

    /// Exact-key lookup; `NotFound` on a miss
    fn search(&self, key: u64) -> Result<Record>;

    /// Forward iteration over every entry in key order
    fn iter(&self) -> Result<Box<dyn Iterator<Item = Result<Entry>> + Send>>;

    /// Handle stats for the catalogue
    fn stat(&self) -> FileStat;
}

/// Ordered set of files forming one level
pub struct Level {
    level: u32,
    /// Soft bound: at this many files the level wants compaction
    capacity: u64,
    /// Hard bound: headroom for files built while a compaction is consuming
    /// their sources
    max_size: u64,
    /// Level 0: insertion order. Levels >= 1: sorted by first key.
    files: Vec<Box<dyn LsmFile>>,
}

impl Level {
    pub fn new(level: u32, capacity: u64, max_size: u64) -> Self {
        Self {
            level,
            capacity,
            max_size,
            files: Vec::new(),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Past the soft capacity: compaction must demote before adding more
    pub fn is_full(&self) -> bool {
        self.files.len() as u64 >= self.capacity
    }

    /// Insert a file; sorted position for levels >= 1
    pub fn add_file(&mut self, file: Box<dyn LsmFile>) -> Result<()> {
        if self.files.len() as u64 >= self.max_size {
            return Err(VaultError::OutOfSpace);
        }

        if self.level == 0 {
            self.files.push(file);
            return Ok(());
        }

        let pos = self
            .files
            .partition_point(|f| {
                (f.first_key(), f.last_key()) < (file.first_key(), file.last_key())
            });
        self.files.insert(pos, file);
        Ok(())
    }

    /// Remove and return a file by id
    pub fn remove_file(&mut self, id: u64) -> Result<Box<dyn LsmFile>> {
        match self.files.iter().position(|f| f.id() == id) {
            Some(pos) => Ok(self.files.remove(pos)),
            None => Err(VaultError::NotFound),
        }
    }

    /// Point lookup within this level
    pub fn search(&self, key: u64) -> Result<Record> {
        if self.level == 0 {
            return self.search_level0(key);
        }

        let pos = self.files.binary_search_by(|f| {
            if key < f.first_key() {
                std::cmp::Ordering::Greater
            } else if key > f.last_key() {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        });
        match pos {
            Ok(index) => self.files[index].search(key),
            Err(_) => Err(VaultError::NotFound),
        }
    }

    /// Level 0 may hold several versions of a key across overlapping
    /// files; the highest file version wins.
    fn search_level0(&self, key: u64) -> Result<Record> {
        let mut best: Option<(u64, Record)> = None;
        for file in &self.files {
            if key < file.first_key() || key > file.last_key() {
                continue;
            }
            match file.search(key) {
                Ok(record) => {
                    if best.as_ref().map_or(true, |(v, _)| file.version() >= *v) {
                        best = Some((file.version(), record));
                    }
                }
                Err(VaultError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        match best {
            Some((_, record)) => Ok(record),
            None => Err(VaultError::NotFound),
        }
    }

    /// Files a major compaction demotes out of this level: all of level 0,
    /// otherwise the single oldest-built file.
    pub fn pick_demoted(&self) -> Vec<u64> {
        if self.level == 0 {
            return self.files.iter().map(|f| f.id()).collect();
        }
        self.files
            .iter()
            .min_by_key(|f| f.version())
            .map(|f| vec![f.id()])
            .unwrap_or_default()
    }

    /// Ids of files whose key range intersects `[lo, hi]`
    pub fn find_overlapping(&self, lo: u64, hi: u64) -> Vec<u64> {
        self.files
            .iter()
            .filter(|f| f.first_key() <= hi && f.last_key() >= lo)
            .map(|f| f.id())
            .collect()
    }

    pub fn file(&self, id: u64) -> Option<&dyn LsmFile> {
        self.files.iter().find(|f| f.id() == id).map(|f| f.as_ref())
    }

    pub fn files(&self) -> impl Iterator<Item = &dyn LsmFile> {
        self.files.iter().map(|f| f.as_ref())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{IV_SIZE, KEY_SIZE, MAC_SIZE};

    /// In-memory stand-in for a sorted run
    struct FakeFile {
        id: u64,
        version: u64,
        entries: Vec<(u64, u64)>, // (key, pba)
    }

    impl FakeFile {
        fn boxed(id: u64, version: u64, entries: Vec<(u64, u64)>) -> Box<dyn LsmFile> {
            Box::new(Self { id, version, entries })
        }

        fn record(pba: u64) -> Record {
            Record {
                pba,
                key: [0u8; KEY_SIZE],
                iv: [0u8; IV_SIZE],
                mac: [0u8; MAC_SIZE],
            }
        }
    }

    impl LsmFile for FakeFile {
        fn id(&self) -> u64 {
            self.id
        }
        fn level(&self) -> u32 {
            0
        }
        fn version(&self) -> u64 {
            self.version
        }
        fn first_key(&self) -> u64 {
            self.entries.first().map(|e| e.0).unwrap_or(0)
        }
        fn last_key(&self) -> u64 {
            self.entries.last().map(|e| e.0).unwrap_or(0)
        }
        fn search(&self, key: u64) -> Result<Record> {
            self.entries
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, pba)| Self::record(*pba))
                .ok_or(VaultError::NotFound)
        }
        fn iter(&self) -> Result<Box<dyn Iterator<Item = Result<Entry>> + Send>> {
            let entries: Vec<_> = self
                .entries
                .iter()
                .map(|(k, pba)| {
                    Ok(Entry {
                        lba: *k,
                        record: Self::record(*pba),
                    })
                })
                .collect();
            Ok(Box::new(entries.into_iter()))
        }
        fn stat(&self) -> FileStat {
            FileStat {
                id: self.id,
                level: 0,
                version: self.version,
                first_key: self.first_key(),
                last_key: self.last_key(),
                root_pos: 0,
                root_key: [0u8; KEY_SIZE],
                root_iv: [0u8; IV_SIZE],
            }
        }
    }

    #[test]
    fn test_level0_highest_version_wins() {
        let mut level = Level::new(0, 4, 12);
        level
            .add_file(FakeFile::boxed(1, 1, vec![(5, 100), (9, 101)]))
            .unwrap();
        level
            .add_file(FakeFile::boxed(2, 2, vec![(5, 200), (7, 201)]))
            .unwrap();

        assert_eq!(level.search(5).unwrap().pba, 200);
        assert_eq!(level.search(9).unwrap().pba, 101);
        assert!(matches!(level.search(6), Err(VaultError::NotFound)));
    }

    #[test]
    fn test_sorted_level_binary_search() {
        let mut level = Level::new(1, 4, 12);
        // inserted out of order; stored sorted by first key
        level
            .add_file(FakeFile::boxed(3, 3, vec![(50, 1), (60, 2)]))
            .unwrap();
        level
            .add_file(FakeFile::boxed(1, 1, vec![(10, 3), (20, 4)]))
            .unwrap();
        level
            .add_file(FakeFile::boxed(2, 2, vec![(30, 5), (40, 6)]))
            .unwrap();

        let firsts: Vec<_> = level.files().map(|f| f.first_key()).collect();
        assert_eq!(firsts, vec![10, 30, 50]);

        assert_eq!(level.search(40).unwrap().pba, 6);
        assert!(matches!(level.search(25), Err(VaultError::NotFound)));
    }

    #[test]
    fn test_pick_demoted() {
        let mut level0 = Level::new(0, 2, 8);
        level0.add_file(FakeFile::boxed(1, 1, vec![(1, 0)])).unwrap();
        level0.add_file(FakeFile::boxed(2, 2, vec![(2, 0)])).unwrap();
        assert_eq!(level0.pick_demoted(), vec![1, 2]);

        let mut level1 = Level::new(1, 2, 8);
        level1.add_file(FakeFile::boxed(7, 9, vec![(1, 0)])).unwrap();
        level1.add_file(FakeFile::boxed(8, 4, vec![(5, 0)])).unwrap();
        // oldest-built file (lowest version) is demoted
        assert_eq!(level1.pick_demoted(), vec![8]);
    }

    #[test]
    fn test_find_overlapping() {
        let mut level = Level::new(1, 4, 12);
        level.add_file(FakeFile::boxed(1, 1, vec![(10, 0), (20, 0)])).unwrap();
        level.add_file(FakeFile::boxed(2, 2, vec![(30, 0), (40, 0)])).unwrap();
        level.add_file(FakeFile::boxed(3, 3, vec![(50, 0), (60, 0)])).unwrap();

        assert_eq!(level.find_overlapping(15, 35), vec![1, 2]);
        assert_eq!(level.find_overlapping(41, 49), Vec::<u64>::new());
        assert_eq!(level.find_overlapping(0, 100), vec![1, 2, 3]);
    }

    #[test]
    fn test_hard_bound() {
        let mut level = Level::new(1, 1, 2);
        level.add_file(FakeFile::boxed(1, 1, vec![(1, 0)])).unwrap();
        assert!(level.is_full());

        // headroom past the soft capacity
        level.add_file(FakeFile::boxed(2, 2, vec![(5, 0)])).unwrap();
        assert!(matches!(
            level.add_file(FakeFile::boxed(3, 3, vec![(9, 0)])),
            Err(VaultError::OutOfSpace)
        ));
    }

    #[test]
    fn test_remove_file() {
        let mut level = Level::new(0, 4, 12);
        level.add_file(FakeFile::boxed(1, 1, vec![(1, 0)])).unwrap();

        assert_eq!(level.remove_file(1).unwrap().id(), 1);
        assert!(matches!(level.remove_file(1), Err(VaultError::NotFound)));
    }
}
