//! Fingerprint lookup over an indexed [crate::record::reader::RecordReader],
//! walking the embedded 3-level (root, directory, leaf) B-tree built by
//! [crate::record::writer::RecordWriter::close].

use std::collections::HashMap;

use crate::{fingerprint::fingerprint, record::file::Record, record::reader::RecordReader, Result};

struct CachedPage {
    entries: Vec<(u64, u64)>,
    epoch: u64,
}

pub struct RecordIndex {
    reader: RecordReader,
    root_position: u64,
    cache_size: usize,
    epoch: u64,
    cache: HashMap<u64, CachedPage>,
}

impl RecordIndex {
    pub fn new(reader: RecordReader, cache_size: usize) -> RecordIndex {
        let root_position = reader.info().index_root;
        RecordIndex {
            reader,
            root_position,
            cache_size: cache_size.max(1),
            epoch: 0,
            cache: HashMap::new(),
        }
    }

    pub fn reader(&mut self) -> &mut RecordReader {
        &mut self.reader
    }

    /// Look up `key` by its precomputed fingerprint.
    pub fn lookup_fp(&mut self, key: &[u8], fp: u64) -> Result<Option<Record>> {
        if !self.reader.info().is_indexed() {
            return self.scan(key);
        }

        let root = self.get_page(self.root_position)?;
        let dir_pos = match find_last_le(&root, fp) {
            Some((_, pos)) => pos,
            None => return Ok(None),
        };
        let directory = self.get_page(dir_pos)?;
        let leaf_pos = match find_last_le(&directory, fp) {
            Some((_, pos)) => pos,
            None => return Ok(None),
        };
        let leaf = self.get_page(leaf_pos)?;

        let mut idx = match find_first_ge(&leaf, fp) {
            Some(i) => i,
            None => return Ok(None),
        };
        while idx < leaf.len() && leaf[idx].0 == fp {
            let (_, pos) = leaf[idx];
            self.reader.seek(pos)?;
            if let Some(rec) = self.reader.read()? {
                if rec.key == key {
                    return Ok(Some(rec));
                }
            }
            idx += 1;
        }
        Ok(None)
    }

    /// Look up `key`, computing its fingerprint.
    pub fn lookup(&mut self, key: &[u8]) -> Result<Option<Record>> {
        let fp = fingerprint(key);
        self.lookup_fp(key, fp)
    }

    fn scan(&mut self, key: &[u8]) -> Result<Option<Record>> {
        self.reader.rewind()?;
        while let Some(rec) = self.reader.read()? {
            if rec.key == key {
                return Ok(Some(rec));
            }
        }
        Ok(None)
    }

    fn get_page(&mut self, pos: u64) -> Result<Vec<(u64, u64)>> {
        self.epoch += 1;
        if let Some(page) = self.cache.get_mut(&pos) {
            page.epoch = self.epoch;
            return Ok(page.entries.clone());
        }

        let entries = self.reader.read_index_page(pos)?;

        if self.cache.len() >= self.cache_size {
            if let Some(&lru_pos) = self
                .cache
                .iter()
                .min_by_key(|(_, page)| page.epoch)
                .map(|(pos, _)| pos)
            {
                self.cache.remove(&lru_pos);
            }
        }
        self.cache.insert(
            pos,
            CachedPage {
                entries: entries.clone(),
                epoch: self.epoch,
            },
        );
        Ok(entries)
    }
}

/// Last entry with `fingerprint ≤ fp`, for descending into a child page whose
/// summary fingerprint bounds a range from below.
fn find_last_le(entries: &[(u64, u64)], fp: u64) -> Option<(u64, u64)> {
    let idx = entries.partition_point(|e| e.0 <= fp);
    if idx == 0 {
        None
    } else {
        Some(entries[idx - 1])
    }
}

/// First entry with `fingerprint ≥ fp`, the start of a leaf's run of ties.
fn find_first_ge(entries: &[(u64, u64)], fp: u64) -> Option<usize> {
    let idx = entries.partition_point(|e| e.0 < fp);
    if idx < entries.len() {
        Some(idx)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{file::Config, writer::RecordWriter};
    use tempfile::tempdir;

    #[test]
    fn test_lookup_finds_every_written_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.rec");

        let config = Config::default().set_indexed(true).set_index_page_size(4);
        let mut w = RecordWriter::create(&path, config).unwrap();
        for i in 0..37u32 {
            w.append(format!("key-{}", i).as_bytes(), format!("val-{}", i).as_bytes())
                .unwrap();
        }
        w.close().unwrap();

        let reader = RecordReader::open(&path).unwrap();
        let mut index = RecordIndex::new(reader, 4);
        for i in 0..37u32 {
            let key = format!("key-{}", i);
            let rec = index.lookup(key.as_bytes()).unwrap();
            assert!(rec.is_some(), "missing {}", key);
            assert_eq!(rec.unwrap().value, format!("val-{}", i).into_bytes());
        }
    }

    #[test]
    fn test_lookup_missing_key_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.rec");

        let config = Config::default().set_indexed(true);
        let mut w = RecordWriter::create(&path, config).unwrap();
        w.append(b"present", b"1").unwrap();
        w.close().unwrap();

        let reader = RecordReader::open(&path).unwrap();
        let mut index = RecordIndex::new(reader, 16);
        assert!(index.lookup(b"absent").unwrap().is_none());
    }
}
