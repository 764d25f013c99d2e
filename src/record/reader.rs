//! Sequential and positional reader for the [crate::record] file format.

use std::{
    fs,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use crate::{
    err_at,
    record::{
        file::Record,
        header::{self, read_header, Compression, FileHeader, RecordType, MAX_HEADER_LEN},
    },
    util::iobuf::IOBuffer,
    Error, Result,
};

pub struct RecordReader {
    file: fs::File,
    position: u64,
    size: u64,
    /// Sequential scans stop here: the start of the index region for an
    /// indexed file, or the file size otherwise.
    data_limit: u64,
    info: FileHeader,
    input: IOBuffer,
    readahead: bool,
}

impl RecordReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<RecordReader> {
        let mut file = err_at!(IOError, fs::OpenOptions::new().read(true).open(path.as_ref()))?;
        let size = err_at!(IOError, file.metadata())?.len();

        let mut hdr_buf = [0u8; FileHeader::ENCODED_LEN];
        err_at!(IOError, file.read_exact(&mut hdr_buf))?;
        let info = FileHeader::decode(&hdr_buf)?;

        let data_limit = if info.is_indexed() {
            info.index_start
        } else {
            size
        };

        let hdrlen = info.hdrlen as u64;
        err_at!(IOError, file.seek(SeekFrom::Start(hdrlen)))?;

        Ok(RecordReader {
            file,
            position: hdrlen,
            size,
            data_limit,
            info,
            input: IOBuffer::new(),
            readahead: true,
        })
    }

    pub fn info(&self) -> &FileHeader {
        &self.info
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Re-read the file's current length and, for an unindexed file, widen
    /// `data_limit` to match. Used by a live [crate::database::Database] shard
    /// whose data file keeps growing underneath a long-lived reader.
    pub fn refresh(&mut self) -> Result<()> {
        let size = err_at!(IOError, self.file.metadata())?.len();
        self.size = size;
        if !self.info.is_indexed() {
            self.data_limit = size;
        }
        Ok(())
    }

    /// True once the sequential cursor has passed the last data record.
    pub fn done(&self) -> bool {
        self.position >= self.data_limit
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.seek(self.info.hdrlen as u64)
    }

    /// Seek to an absolute file position. Position `0` means "first record".
    ///
    /// Always clears the buffer and disables readahead, trading the cheap
    /// in-buffer-rewind optimization for simplicity.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        let pos = if pos == 0 { self.info.hdrlen as u64 } else { pos };
        err_at!(IOError, self.file.seek(SeekFrom::Start(pos)))?;
        self.input.clear();
        self.position = pos;
        self.readahead = false;
        Ok(())
    }

    fn fill(&mut self, want: usize) -> Result<()> {
        self.input.flush();
        while self.input.available() < want {
            let to_read = if self.readahead {
                self.input.remaining().max(want - self.input.available())
            } else {
                want - self.input.available()
            };
            let n = self.input.read_from(&mut self.file, to_read)?;
            if n == 0 {
                return err_at!(Fatal, msg: "record truncated at {}", self.position);
            }
        }
        Ok(())
    }

    /// Read the next record, advancing past any FILLER records. Returns
    /// `Ok(None)` once [RecordReader::done] would be true.
    pub fn read(&mut self) -> Result<Option<Record>> {
        self.read_impl(false)
    }

    /// Like [RecordReader::read] but skips decoding/decompressing the value;
    /// the returned record's `value` is empty. Used by index builders that
    /// only need the key and position.
    pub fn read_key(&mut self) -> Result<Option<Record>> {
        self.read_impl(true)
    }

    fn read_impl(&mut self, key_only: bool) -> Result<Option<Record>> {
        loop {
            if self.position >= self.data_limit {
                return Ok(None);
            }

            self.fill(MAX_HEADER_LEN.min((self.data_limit - self.position) as usize).max(1))?;
            let (header, hdr_len) = loop {
                match read_header(self.input.peek(self.input.available()).unwrap_or(&[])) {
                    Ok(res) => break res,
                    Err(_) if self.input.available() < MAX_HEADER_LEN => {
                        let want = self.input.available() + 1;
                        self.fill(want)?;
                    }
                    Err(err) => return Err(err),
                }
            };

            let record_position = self.position;
            let (_, _) = self.input.consume(hdr_len)?;
            self.position += hdr_len as u64;

            let record_type = header.record_type.unwrap();
            if record_type == RecordType::Filler {
                let skip = header.record_size - hdr_len as u64;
                self.skip_bytes(skip as usize)?;
                self.position += skip;
                continue;
            }

            if header.key_size > header.record_size {
                return err_at!(
                    InvalidFormat, msg: "corrupt record header at {}: key_size {} > record_size {}",
                    record_position, header.key_size, header.record_size
                );
            }
            let key_size = header.key_size as usize;
            let value_size = (header.record_size - header.key_size) as usize;

            self.fill(key_size + value_size)?;
            let (ks, ke) = self.input.consume(key_size)?;
            let key = self.input_slice(ks, ke).to_vec();

            let value = if key_only {
                self.skip_consumed(value_size)?;
                Vec::new()
            } else {
                let (vs, ve) = self.input.consume(value_size)?;
                let raw = self.input_slice(vs, ve).to_vec();
                self.decompress(&raw)?
            };

            self.position += (key_size + value_size) as u64;

            return Ok(Some(Record {
                key,
                version: header.version,
                value,
                position: Some(record_position),
            }));
        }
    }

    fn input_slice(&self, s: usize, e: usize) -> &[u8] {
        // `consume` already advanced `begin`; the bytes are in [s, e) of the
        // underlying storage, still valid until the next fill/flush/clear.
        self.input.raw(s, e)
    }

    fn skip_consumed(&mut self, n: usize) -> Result<()> {
        self.input.consume(n)?;
        Ok(())
    }

    fn skip_bytes(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        self.fill(n)?;
        self.input.consume(n)?;
        Ok(())
    }

    fn decompress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        match self.info.compression {
            Compression::None => Ok(raw.to_vec()),
            Compression::Snappy => {
                let mut decoder = snap::raw::Decoder::new();
                err_at!(Fatal, decoder.decompress_vec(raw))
            }
        }
    }

    /// Read a raw INDEX page payload at `position` (absolute file offset).
    /// Used by [crate::record::index::RecordIndex].
    pub fn read_index_page(&mut self, position: u64) -> Result<Vec<(u64, u64)>> {
        self.seek(position)?;
        self.fill(MAX_HEADER_LEN)?;
        let (header, hdr_len) = read_header(self.input.peek(self.input.available()).unwrap())?;
        if header.record_type != Some(RecordType::Index) {
            return err_at!(InvalidFormat, msg: "expected index page at {}", position);
        }
        self.input.consume(hdr_len)?;
        if header.key_size > header.record_size {
            return err_at!(
                InvalidFormat, msg: "corrupt index page header at {}: key_size {} > record_size {}",
                position, header.key_size, header.record_size
            );
        }
        let key_size = header.key_size as usize;
        let value_size = (header.record_size - header.key_size) as usize;
        self.fill(key_size + value_size)?;
        self.input.consume(key_size)?;
        let (vs, ve) = self.input.consume(value_size)?;
        let payload = self.input_slice(vs, ve).to_vec();
        header::read_varint(&payload)?; // validates the count prefix
        crate::record::writer::decode_index_page(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{file::Config, writer::RecordWriter};
    use tempfile::tempdir;

    #[test]
    fn test_read_back_written_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.rec");

        let mut w = RecordWriter::create(&path, Config::default()).unwrap();
        w.append(b"alice", b"1").unwrap();
        w.append(b"bob", b"2").unwrap();
        w.close().unwrap();

        let mut r = RecordReader::open(&path).unwrap();
        let rec1 = r.read().unwrap().unwrap();
        assert_eq!(rec1.key, b"alice");
        assert_eq!(rec1.value, b"1");
        let rec2 = r.read().unwrap().unwrap();
        assert_eq!(rec2.key, b"bob");
        assert_eq!(rec2.value, b"2");
        assert!(r.read().unwrap().is_none());
        assert!(r.done());
    }

    #[test]
    fn test_read_key_only_skips_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.rec");

        let mut w = RecordWriter::create(&path, Config::default()).unwrap();
        w.append(b"k1", b"some longer value here").unwrap();
        w.append(b"k2", b"another value").unwrap();
        w.close().unwrap();

        let mut r = RecordReader::open(&path).unwrap();
        let rec = r.read_key().unwrap().unwrap();
        assert_eq!(rec.key, b"k1");
        assert!(rec.value.is_empty());
        let rec2 = r.read().unwrap().unwrap();
        assert_eq!(rec2.key, b"k2");
        assert_eq!(rec2.value, b"another value");
    }

    #[test]
    fn test_versioned_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.rec");

        let mut w = RecordWriter::create(&path, Config::default()).unwrap();
        w.append_versioned(b"k", 42, b"v").unwrap();
        w.close().unwrap();

        let mut r = RecordReader::open(&path).unwrap();
        let rec = r.read().unwrap().unwrap();
        assert_eq!(rec.version, 42);
    }

    #[test]
    fn test_seek_to_zero_is_first_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.rec");

        let mut w = RecordWriter::create(&path, Config::default()).unwrap();
        w.append(b"a", b"1").unwrap();
        w.append(b"b", b"2").unwrap();
        w.close().unwrap();

        let mut r = RecordReader::open(&path).unwrap();
        r.read().unwrap();
        r.seek(0).unwrap();
        let rec = r.read().unwrap().unwrap();
        assert_eq!(rec.key, b"a");
    }

    #[test]
    fn test_corrupt_header_key_size_exceeds_record_size_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.rec");

        let info = FileHeader::new(crate::record::file::Config::DEFAULT_CHUNK_SIZE, Compression::None);
        let mut buf = info.encode().to_vec();

        let bad = header::Header {
            record_type: Some(RecordType::Data),
            record_size: 4,
            key_size: 10,
            version: 0,
        };
        header::write_header(&bad, &mut buf).unwrap();
        buf.extend_from_slice(&[0u8; 4]);

        fs::write(&path, &buf).unwrap();

        let mut r = RecordReader::open(&path).unwrap();
        assert!(r.read().is_err());
    }
}
