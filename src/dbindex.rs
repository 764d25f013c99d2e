//! File-mapped, open-addressed hash index mapping `fingerprint -> byte offset`,
//! backing [crate::database::Database].
//!
//! Grounded on `sling/db/db.h`'s `DatabaseIndex`: linear probing, tombstones
//! that are skipped on lookup but reused on insert, and a resize that doubles
//! capacity and drops tombstones. The file itself is mapped with `memmap2` so
//! that reads never go through a syscall once the checkpoint thread has
//! flushed it.

use std::{
    convert::TryInto,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use memmap2::MmapMut;

use crate::{err_at, Error, Result};

pub const MAGIC: u32 = 0x4658_4449; // "IDXF"
const HEADER_LEN: usize = 48;
const ENTRY_LEN: usize = 16;

/// Reserved sentinel: an empty slot.
pub const EMPTY: u64 = 0;
/// Reserved sentinel: a deleted (tombstoned) slot.
pub const DELETED: u64 = u64::MAX;
/// Reserved sentinel: "no value" / "not found".
pub const NVAL: u64 = u64::MAX;
/// Reserved sentinel: "start a fresh probe" cursor for [DatabaseIndex::get].
pub const NPOS: u64 = u64::MAX;

const DEFAULT_FILL_FACTOR: f64 = 0.6;
const DEFAULT_CAPACITY: u64 = 1024;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct Header {
    magic: u32,
    version: u32,
    /// Byte offset of the entry table, i.e. always `HEADER_LEN`; kept as an
    /// on-disk field for parity with the format this mirrors.
    offset: u64,
    epoch: u64,
    size: u64,
    capacity: u64,
    deletions: u64,
}

impl Header {
    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.epoch.to_le_bytes());
        buf[24..32].copy_from_slice(&self.size.to_le_bytes());
        buf[32..40].copy_from_slice(&self.capacity.to_le_bytes());
        buf[40..48].copy_from_slice(&self.deletions.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Header> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return err_at!(InvalidFormat, msg: "bad database index magic 0x{:08x}", magic);
        }
        Ok(Header {
            magic,
            version: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            epoch: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            size: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            capacity: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            deletions: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
        })
    }
}

pub struct DatabaseIndex {
    path: PathBuf,
    mmap: MmapMut,
    header: Header,
}

impl DatabaseIndex {
    /// Create a new, empty index file with the given initial capacity
    /// (rounded up to a power of two).
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<DatabaseIndex> {
        let capacity = capacity.max(DEFAULT_CAPACITY).next_power_of_two();
        let header = Header {
            magic: MAGIC,
            version: 1,
            offset: HEADER_LEN as u64,
            epoch: 0,
            size: 0,
            capacity,
            deletions: 0,
        };
        let path = path.as_ref().to_path_buf();
        write_fresh_file(&path, &header, &vec![(EMPTY, 0); capacity as usize])?;
        Self::open(path)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<DatabaseIndex> {
        let path = path.as_ref().to_path_buf();
        let file = err_at!(IOError, OpenOptions::new().read(true).write(true).open(&path))?;
        let mmap = err_at!(IOError, unsafe { MmapMut::map_mut(&file) })?;
        let header = Header::decode(&mmap[..HEADER_LEN])?;
        Ok(DatabaseIndex { path, mmap, header })
    }

    pub fn epoch(&self) -> u64 {
        self.header.epoch
    }

    pub fn size(&self) -> u64 {
        self.header.size
    }

    pub fn capacity(&self) -> u64 {
        self.header.capacity
    }

    pub fn deletions(&self) -> u64 {
        self.header.deletions
    }

    fn mask(&self) -> u64 {
        self.header.capacity - 1
    }

    fn entry_offset(&self, slot: u64) -> usize {
        HEADER_LEN + (slot as usize) * ENTRY_LEN
    }

    fn read_entry(&self, slot: u64) -> (u64, u64) {
        let off = self.entry_offset(slot);
        let hash = u64::from_le_bytes(self.mmap[off..off + 8].try_into().unwrap());
        let value = u64::from_le_bytes(self.mmap[off + 8..off + 16].try_into().unwrap());
        (hash, value)
    }

    fn write_entry(&mut self, slot: u64, hash: u64, value: u64) {
        let off = self.entry_offset(slot);
        self.mmap[off..off + 8].copy_from_slice(&hash.to_le_bytes());
        self.mmap[off + 8..off + 16].copy_from_slice(&value.to_le_bytes());
    }

    fn write_header(&mut self) {
        let mut buf = [0u8; HEADER_LEN];
        self.header.encode(&mut buf);
        self.mmap[..HEADER_LEN].copy_from_slice(&buf);
    }

    /// Whether the next insert would push the table past its load factor.
    pub fn overflow(&self) -> bool {
        let limit = (self.header.capacity as f64 * DEFAULT_FILL_FACTOR) as u64;
        self.header.size + self.header.deletions >= limit
    }

    /// Insert `(fp, value)`, resizing first if the table has reached its load
    /// factor. Returns the slot the entry landed in.
    pub fn add(&mut self, fp: u64, value: u64) -> Result<u64> {
        if self.overflow() {
            self.resize()?;
        }

        let mask = self.mask();
        let mut slot = fp & mask;
        let mut reuse: Option<u64> = None;
        loop {
            let (hash, _) = self.read_entry(slot);
            match hash {
                EMPTY => {
                    let target = reuse.unwrap_or(slot);
                    if reuse.is_some() {
                        // deletion accounting: a tombstone was reused, not a
                        // fresh slot, so `deletions` shrinks.
                        self.header.deletions -= 1;
                    }
                    self.write_entry(target, fp, value);
                    self.header.size += 1;
                    self.header.epoch += 1;
                    self.write_header();
                    return Ok(target);
                }
                DELETED => {
                    if reuse.is_none() {
                        reuse = Some(slot);
                    }
                }
                _ => (),
            }
            slot = (slot + 1) & mask;
        }
    }

    /// Probe for `fp`, starting after `pos` (or from scratch when `pos ==
    /// NPOS`). Returns `(value, slot)` for the first match found, or `None`
    /// once the probe hits an empty slot.
    pub fn get(&self, fp: u64, pos: u64) -> Option<(u64, u64)> {
        let mask = self.mask();
        let mut slot = if pos == NPOS { fp & mask } else { (pos + 1) & mask };
        loop {
            let (hash, value) = self.read_entry(slot);
            if hash == EMPTY {
                return None;
            }
            if hash == fp {
                return Some((value, slot));
            }
            slot = (slot + 1) & mask;
            if pos != NPOS && slot == (fp & mask) {
                // wrapped all the way around without a fresh empty; bail.
                return None;
            }
        }
    }

    pub fn update(&mut self, fp: u64, value: u64, slot: u64) -> Result<bool> {
        let (hash, _) = self.read_entry(slot);
        if hash != fp {
            return Ok(false);
        }
        self.write_entry(slot, fp, value);
        self.header.epoch += 1;
        self.write_header();
        Ok(true)
    }

    /// Tombstone the slot holding `fp`, returning its prior value.
    pub fn delete(&mut self, fp: u64, slot: u64) -> Result<Option<u64>> {
        let (hash, value) = self.read_entry(slot);
        if hash != fp {
            return Ok(None);
        }
        self.write_entry(slot, DELETED, 0);
        self.header.size -= 1;
        self.header.deletions += 1;
        self.header.epoch += 1;
        self.write_header();
        Ok(Some(value))
    }

    /// Double capacity, rehash all live entries, drop tombstones, swap the
    /// mapped file in place.
    fn resize(&mut self) -> Result<()> {
        let new_capacity = self.header.capacity * 2;
        let mut new_entries = vec![(EMPTY, 0u64); new_capacity as usize];
        let new_mask = new_capacity - 1;

        for slot in 0..self.header.capacity {
            let (hash, value) = self.read_entry(slot);
            if hash == EMPTY || hash == DELETED {
                continue;
            }
            let mut probe = hash & new_mask;
            while new_entries[probe as usize].0 != EMPTY {
                probe = (probe + 1) & new_mask;
            }
            new_entries[probe as usize] = (hash, value);
        }

        let new_header = Header {
            magic: MAGIC,
            version: self.header.version,
            offset: HEADER_LEN as u64,
            epoch: self.header.epoch + 1,
            size: self.header.size,
            capacity: new_capacity,
            deletions: 0,
        };

        let tmp_path = self.path.with_extension("idx.tmp");
        write_fresh_file(&tmp_path, &new_header, &new_entries)?;
        err_at!(IOError, fs::rename(&tmp_path, &self.path))?;

        let file = err_at!(IOError, OpenOptions::new().read(true).write(true).open(&self.path))?;
        self.mmap = err_at!(IOError, unsafe { MmapMut::map_mut(&file) })?;
        self.header = new_header;
        Ok(())
    }

    /// Flush mapped memory to disk. Cheap no-op if nothing changed since the
    /// last flush.
    pub fn flush(&mut self) -> Result<()> {
        err_at!(IOError, self.mmap.flush())
    }
}

fn write_fresh_file(path: &Path, header: &Header, entries: &[(u64, u64)]) -> Result<()> {
    let mut buf = vec![0u8; HEADER_LEN + entries.len() * ENTRY_LEN];
    header.encode(&mut buf[..HEADER_LEN]);
    for (i, (hash, value)) in entries.iter().enumerate() {
        let off = HEADER_LEN + i * ENTRY_LEN;
        buf[off..off + 8].copy_from_slice(&hash.to_le_bytes());
        buf[off + 8..off + 16].copy_from_slice(&value.to_le_bytes());
    }
    let mut file = err_at!(
        IOError,
        OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)
    )?;
    err_at!(IOError, file.write_all(&buf))?;
    err_at!(IOError, file.sync_all())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_add_get_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx");
        let mut idx = DatabaseIndex::create(&path, 16).unwrap();

        let slot = idx.add(777, 4242).unwrap();
        let (value, found_slot) = idx.get(777, NPOS).unwrap();
        assert_eq!(value, 4242);
        assert_eq!(found_slot, slot);
    }

    #[test]
    fn test_delete_then_get_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx");
        let mut idx = DatabaseIndex::create(&path, 16).unwrap();

        let slot = idx.add(10, 100).unwrap();
        idx.delete(10, slot).unwrap();
        assert!(idx.get(10, NPOS).is_none());
    }

    #[test]
    fn test_tombstone_reused_on_insert() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx");
        let mut idx = DatabaseIndex::create(&path, 16).unwrap();

        let slot = idx.add(5, 50).unwrap();
        idx.delete(5, slot).unwrap();
        assert_eq!(idx.deletions(), 1);
        idx.add(21, 210).unwrap();
        assert_eq!(idx.deletions(), 0);
    }

    #[test]
    fn test_resize_preserves_all_live_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx");
        let mut idx = DatabaseIndex::create(&path, 8).unwrap();

        for i in 0..50u64 {
            idx.add(i * 2 + 3, i * 1000).unwrap();
        }
        for i in 0..50u64 {
            let fp = i * 2 + 3;
            let (value, _) = idx.get(fp, NPOS).unwrap_or_else(|| panic!("missing {}", fp));
            assert_eq!(value, i * 1000);
        }
    }

    #[test]
    fn test_epoch_increases_on_mutation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx");
        let mut idx = DatabaseIndex::create(&path, 16).unwrap();
        let e0 = idx.epoch();
        idx.add(1234, 1).unwrap();
        assert!(idx.epoch() > e0);
    }
}
