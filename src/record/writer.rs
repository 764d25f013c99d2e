//! Append-only writer for the [crate::record] file format.
//!
//! Builds an in-memory fingerprint index as records are appended and, on
//! [RecordWriter::close], flushes a 3-level index (root, directory, leaf) and
//! rewrites the file header so the file becomes indexed.

use std::{
    convert::TryFrom,
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::{
    err_at,
    fingerprint::fingerprint,
    record::{
        file::{Config, Record},
        header::{
            self, write_header, Compression, FileHeader, Header, RecordType, MAX_HEADER_LEN,
            MAX_SKIP_LEN,
        },
    },
    util::iobuf::IOBuffer,
    Error, Result,
};

/// Threshold above which the fingerprint index is sorted in parallel.
const PARALLEL_SORT_THRESHOLD: usize = 100_000;

pub struct RecordWriter {
    file: fs::File,
    position: u64,
    info: FileHeader,
    config: Config,
    output: IOBuffer,
    index: Vec<(u64, u64)>,
}

impl RecordWriter {
    /// Create a new record file at `path`, truncating any existing file.
    pub fn create<P: AsRef<Path>>(path: P, config: Config) -> Result<RecordWriter> {
        let mut file = err_at!(
            IOError,
            fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path.as_ref())
        )?;

        let info = FileHeader::new(config.chunk_size, config.compression);
        let hdrlen = info.hdrlen as u64;
        err_at!(IOError, file.write_all(&info.encode()))?;
        err_at!(IOError, file.seek(SeekFrom::Start(hdrlen)))?;

        Ok(RecordWriter {
            file,
            position: hdrlen,
            info,
            config,
            output: IOBuffer::with_capacity(Config::DEFAULT_BUFFER_SIZE),
            index: Vec::new(),
        })
    }

    /// Reopen an existing, unindexed record file for further appends,
    /// positioning past the last record currently on disk. Used by a live
    /// [crate::database::Database] shard, which keeps its own external index
    /// and never asks a data file to build its embedded one.
    pub fn open_append<P: AsRef<Path>>(path: P) -> Result<RecordWriter> {
        let mut file = err_at!(
            IOError,
            fs::OpenOptions::new().read(true).write(true).open(path.as_ref())
        )?;

        let mut hdr_buf = [0u8; FileHeader::ENCODED_LEN];
        err_at!(IOError, file.read_exact(&mut hdr_buf))?;
        let info = FileHeader::decode(&hdr_buf)?;
        if info.is_indexed() {
            return err_at!(
                InvalidInput, msg: "cannot append to an already-indexed record file"
            );
        }

        let size = err_at!(IOError, file.metadata())?.len();
        err_at!(IOError, file.seek(SeekFrom::Start(size)))?;

        Ok(RecordWriter {
            file,
            position: size,
            info,
            config: Config::default(),
            output: IOBuffer::with_capacity(Config::DEFAULT_BUFFER_SIZE),
            index: Vec::new(),
        })
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    pub fn info(&self) -> &FileHeader {
        &self.info
    }

    /// Append a plain key/value record, returning its byte offset.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<u64> {
        self.write_record(RecordType::Data, key, 0, value)
    }

    /// Append a versioned key/value record, returning its byte offset.
    pub fn append_versioned(&mut self, key: &[u8], version: u64, value: &[u8]) -> Result<u64> {
        self.write_record(RecordType::VData, key, version, value)
    }

    pub fn append_record(&mut self, record: &Record) -> Result<u64> {
        if record.version == 0 {
            self.write_record(RecordType::Data, &record.key, 0, &record.value)
        } else {
            self.write_record(RecordType::VData, &record.key, record.version, &record.value)
        }
    }

    fn write_record(
        &mut self,
        record_type: RecordType,
        key: &[u8],
        version: u64,
        value: &[u8],
    ) -> Result<u64> {
        let value_enc = self.compress(value)?;
        let position = self.write_raw(record_type, key, version, &value_enc)?;
        if record_type != RecordType::Index {
            self.index.push((fingerprint(key), position));
        }
        Ok(position)
    }

    fn compress(&self, value: &[u8]) -> Result<Vec<u8>> {
        match self.config.compression {
            Compression::None => Ok(value.to_vec()),
            Compression::Snappy => {
                let mut encoder = snap::raw::Encoder::new();
                err_at!(Fatal, encoder.compress_vec(value))
            }
        }
    }

    /// Write a record with `value` bytes exactly as given, no compression.
    /// Used both by `write_record` (post-compression) and by index page writes.
    fn write_raw(
        &mut self,
        record_type: RecordType,
        key: &[u8],
        version: u64,
        value: &[u8],
    ) -> Result<u64> {
        let key_size = key.len() as u64;
        let record_size = key_size + value.len() as u64;
        let header = Header {
            record_type: Some(record_type),
            record_size,
            key_size,
            version,
        };
        let mut hdr_buf = Vec::with_capacity(MAX_HEADER_LEN);
        write_header(&header, &mut hdr_buf)?;

        let maxsize = (MAX_HEADER_LEN as u64) + record_size;
        if (self.output.remaining() as u64) < maxsize {
            self.flush()?;
        }
        self.maybe_insert_filler(maxsize)?;

        let position = self.position;
        let total = hdr_buf.len() as u64 + record_size;
        self.output.ensure(total as usize);
        self.output.append(&hdr_buf);
        self.output.append(key);
        self.output.append(value);
        self.position += total;

        Ok(position)
    }

    /// Insert a FILLER record if writing `maxsize` more bytes (plus slack for
    /// the filler's own header) would cross a chunk boundary.
    fn maybe_insert_filler(&mut self, maxsize: u64) -> Result<()> {
        let chunk_size = self.info.chunk_size;
        if chunk_size == 0 {
            return Ok(());
        }
        let within = self.position % chunk_size;
        if within == 0 {
            return Ok(());
        }
        let remaining_in_chunk = chunk_size - within;
        if maxsize + (MAX_SKIP_LEN as u64) <= remaining_in_chunk {
            return Ok(());
        }

        let filler_header = Header {
            record_type: Some(RecordType::Filler),
            record_size: remaining_in_chunk,
            key_size: 0,
            version: 0,
        };
        let mut hdr_buf = Vec::with_capacity(MAX_SKIP_LEN);
        write_header(&filler_header, &mut hdr_buf)?;
        if hdr_buf.len() as u64 > remaining_in_chunk {
            return err_at!(
                Fatal, msg: "chunk remainder {} too small for filler header {}",
                remaining_in_chunk, hdr_buf.len()
            );
        }
        let pad = (remaining_in_chunk - hdr_buf.len() as u64) as usize;

        self.output.ensure(remaining_in_chunk as usize);
        self.output.append(&hdr_buf);
        self.output.append(&vec![0u8; pad]);
        self.position += remaining_in_chunk;
        Ok(())
    }

    /// Flush the output buffer to disk without building the index or updating
    /// the header.
    pub fn flush(&mut self) -> Result<()> {
        if !self.output.is_empty() {
            err_at!(IOError, self.file.write_all(self.output.data()))?;
            self.output.clear();
        }
        Ok(())
    }

    /// Flush outstanding writes, build the fingerprint index (if configured),
    /// and rewrite the file header. Consumes the writer.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;

        if self.config.indexed {
            self.write_index()?;
            self.flush()?;
        }

        err_at!(IOError, self.file.seek(SeekFrom::Start(0)))?;
        err_at!(IOError, self.file.write_all(&self.info.encode()))?;
        err_at!(IOError, self.file.sync_all())?;
        Ok(())
    }

    /// Build the embedded 3-level index: leaves over the sorted fingerprint
    /// entries, a directory over the leaves' summaries, and a root over the
    /// directory's summaries. The root level is always written with its page
    /// size widened to `directory.len()`, the same unconditional single-page
    /// fold the original `WriteIndexLevel(root, nullptr, root.size())` does,
    /// so a directory bigger than `index_page_size` still yields exactly one
    /// root page instead of several with only the first one reachable.
    fn write_index(&mut self) -> Result<()> {
        let mut entries = std::mem::take(&mut self.index);
        if entries.len() >= PARALLEL_SORT_THRESHOLD {
            use rayon::slice::ParallelSliceMut;
            entries.par_sort_by_key(|e| e.0);
        } else {
            entries.sort_by_key(|e| e.0);
        }

        let index_start = self.position;
        let page_size = usize::try_from(self.config.index_page_size.max(1)).unwrap();

        let leaves = self.write_index_pages(&entries, page_size)?;
        let directory = self.write_index_pages(&leaves, page_size)?;
        let root_summaries = self.write_index_pages(&directory, directory.len().max(1))?;

        let root = match root_summaries.first() {
            Some((_, pos)) => *pos,
            None => index_start,
        };

        self.info.set_indexed(root, index_start, self.config.index_page_size, 3);
        Ok(())
    }

    /// Write `entries` as a sequence of INDEX-typed pages of `page_size`
    /// entries each. Returns one summary `(first_fingerprint, page_offset)`
    /// per page written, for the parent level to index.
    fn write_index_pages(
        &mut self,
        entries: &[(u64, u64)],
        page_size: usize,
    ) -> Result<Vec<(u64, u64)>> {
        if entries.is_empty() {
            return Ok(vec![]);
        }
        let mut summaries = Vec::with_capacity((entries.len() / page_size.max(1)) + 1);
        for chunk in entries.chunks(page_size) {
            let payload = encode_index_page(chunk);
            let pos = self.write_raw(RecordType::Index, &[], 0, &payload)?;
            summaries.push((chunk[0].0, pos));
        }
        Ok(summaries)
    }
}

/// Encode a list of `(fingerprint, offset)` pairs as an INDEX record payload:
/// a varint count followed by fixed 16-byte `(u64 LE, u64 LE)` entries.
pub fn encode_index_page(entries: &[(u64, u64)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * 16 + 10);
    header::write_varint(entries.len() as u64, &mut buf);
    for (fp, pos) in entries {
        buf.extend_from_slice(&fp.to_le_bytes());
        buf.extend_from_slice(&pos.to_le_bytes());
    }
    buf
}

/// Decode an INDEX record payload produced by [encode_index_page].
pub fn decode_index_page(data: &[u8]) -> Result<Vec<(u64, u64)>> {
    let (count, mut pos) = header::read_varint(data)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if data.len() < pos + 16 {
            return err_at!(InvalidFormat, msg: "truncated index page");
        }
        let fp = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
        let off = u64::from_le_bytes(data[pos + 8..pos + 16].try_into().unwrap());
        entries.push((fp, off));
        pos += 16;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_tell_advance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.rec");
        let mut w = RecordWriter::create(&path, Config::default()).unwrap();
        let p0 = w.append(b"alice", b"1").unwrap();
        let p1 = w.append(b"bob", b"2").unwrap();
        assert!(p1 > p0);
        w.close().unwrap();
        let size = fs::metadata(&path).unwrap().len();
        assert!(size > FileHeader::ENCODED_LEN as u64);
    }

    #[test]
    fn test_close_without_index_leaves_unindexed_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.rec");
        let mut w = RecordWriter::create(&path, Config::default()).unwrap();
        w.append(b"k", b"v").unwrap();
        w.close().unwrap();

        let buf = fs::read(&path).unwrap();
        let header = FileHeader::decode(&buf).unwrap();
        assert!(!header.is_indexed());
    }

    #[test]
    fn test_close_with_index_flips_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.rec");
        let config = Config::default().set_indexed(true);
        let mut w = RecordWriter::create(&path, config).unwrap();
        for i in 0..50u32 {
            w.append(format!("key{}", i).as_bytes(), b"value").unwrap();
        }
        w.close().unwrap();

        let buf = fs::read(&path).unwrap();
        let header = FileHeader::decode(&buf).unwrap();
        assert!(header.is_indexed());
        assert_eq!(header.index_depth, 3);
    }

    /// A tiny `index_page_size` makes the directory level itself span several
    /// pages; the root must still fold down to exactly one page so every
    /// directory page stays reachable (the bug this guards against: picking
    /// `root_summaries.first()` silently dropped every sibling root page once
    /// there was more than one).
    #[test]
    fn test_write_index_folds_directory_down_to_single_root_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.rec");
        let config = Config::default().set_indexed(true).set_index_page_size(2);
        let mut w = RecordWriter::create(&path, config).unwrap();
        for i in 0..200u32 {
            w.append(format!("key-{:04}", i).as_bytes(), b"value").unwrap();
        }
        w.close().unwrap();

        let buf = fs::read(&path).unwrap();
        let header = FileHeader::decode(&buf).unwrap();
        assert!(header.is_indexed());
        assert_eq!(header.index_depth, 3);

        let reader = RecordReader::open(&path).unwrap();
        let mut index = crate::record::index::RecordIndex::new(reader, 8);
        for i in 0..200u32 {
            let key = format!("key-{:04}", i);
            assert!(index.lookup(key.as_bytes()).unwrap().is_some(), "missing {}", key);
        }
    }

    #[test]
    fn test_index_page_codec_roundtrip() {
        let entries = vec![(10u64, 100u64), (20, 200), (30, 300)];
        let payload = encode_index_page(&entries);
        let got = decode_index_page(&payload).unwrap();
        assert_eq!(got, entries);
    }

    #[test]
    fn test_snappy_compressed_record_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.rec");
        let config = Config::default().set_compression(Compression::Snappy);
        let mut w = RecordWriter::create(&path, config).unwrap();
        let value = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".repeat(4);
        w.append(b"k", &value).unwrap();
        w.close().unwrap();

        let mut r = crate::record::reader::RecordReader::open(&path).unwrap();
        assert_eq!(r.info().compression, Compression::Snappy);
        let rec = r.read().unwrap().unwrap();
        assert_eq!(rec.value, value);
    }

    /// A chunk small enough to force a mid-record boundary must land a
    /// FILLER at the end of each chunk rather than split a record across it.
    #[test]
    fn test_small_chunk_size_inserts_filler_at_boundary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.rec");
        let config = Config::default().set_chunk_size(64).set_compression(Compression::None);
        let mut w = RecordWriter::create(&path, config).unwrap();
        for i in 0..20u32 {
            w.append(format!("k{:02}", i).as_bytes(), b"0123456789").unwrap();
        }
        w.close().unwrap();

        let mut r = crate::record::reader::RecordReader::open(&path).unwrap();
        let mut seen = 0;
        while let Some(rec) = r.read().unwrap() {
            seen += 1;
            assert_eq!(rec.value, b"0123456789");
        }
        assert_eq!(seen, 20);

        // No record's header+body should straddle a chunk boundary: scanning
        // the raw file, every chunk-sized window's tail is either a record
        // that fits cleanly or padding inserted by `maybe_insert_filler`.
        let buf = fs::read(&path).unwrap();
        assert!(buf.len() as u64 > FileHeader::ENCODED_LEN as u64 + 64);
    }
}
