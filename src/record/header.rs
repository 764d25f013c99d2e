//! Record and file header codecs for the [crate::record] file format.
//!
//! A record file starts with a fixed-layout [FileHeader] followed by a sequence
//! of records, each prefixed by a varint-encoded [Header].

use std::convert::TryFrom;

use crate::{err_at, Error, Result};

/// Upper bound on an encoded record header: type byte + 3 varints.
pub const MAX_HEADER_LEN: usize = 31;

/// Smallest filler record: type byte + record_size varint.
pub const MAX_SKIP_LEN: usize = 12;

/// v1 magic, `"RECF"` read little-endian.
pub const MAGIC1: u32 = 0x4653_4552;
/// v2 magic, `"RECD"` read little-endian. Required for indexed files.
pub const MAGIC2: u32 = 0x4443_4552;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
    Data = 1,
    Filler = 2,
    Index = 3,
    VData = 4,
}

impl TryFrom<u8> for RecordType {
    type Error = Error;

    fn try_from(b: u8) -> Result<RecordType> {
        match b {
            1 => Ok(RecordType::Data),
            2 => Ok(RecordType::Filler),
            3 => Ok(RecordType::Index),
            4 => Ok(RecordType::VData),
            b => err_at!(InvalidFormat, msg: "unknown record type {}", b),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None = 0,
    Snappy = 1,
}

impl TryFrom<u8> for Compression {
    type Error = Error;

    fn try_from(b: u8) -> Result<Compression> {
        match b {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Snappy),
            b => err_at!(InvalidFormat, msg: "unknown compression type {}", b),
        }
    }
}

/// Per-record header, as decoded from (or destined for) the varint wire form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub record_type: Option<RecordType>,
    pub record_size: u64,
    pub key_size: u64,
    pub version: u64,
}

/// Write a `u64` as unsigned LEB128, returning the number of bytes written.
pub fn write_varint(mut val: u64, out: &mut Vec<u8>) -> usize {
    let mut n = 0;
    loop {
        let mut byte = (val & 0x7f) as u8;
        val >>= 7;
        if val != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        n += 1;
        if val == 0 {
            break;
        }
    }
    n
}

/// Read a varint-encoded `u64` from `data`. Returns `(value, bytes consumed)`.
pub fn read_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut val: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return err_at!(InvalidFormat, msg: "varint too long");
        }
        val |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((val, i + 1));
        }
        shift += 7;
    }
    err_at!(InvalidFormat, msg: "truncated varint")
}

/// Parse a record header from `data`. Returns `(header, bytes consumed)`.
///
/// Mirrors `RecordFile::ReadHeader`: type byte, `record_size` varint, `key_size`
/// varint (omitted for FILLER), `version` varint (only present for VDATA).
pub fn read_header(data: &[u8]) -> Result<(Header, usize)> {
    if data.is_empty() {
        return err_at!(InvalidFormat, msg: "empty record header");
    }
    let record_type = RecordType::try_from(data[0])?;
    let mut pos = 1;

    let (record_size, n) = read_varint(&data[pos..])?;
    pos += n;

    let key_size = if record_type == RecordType::Filler {
        0
    } else {
        let (key_size, n) = read_varint(&data[pos..])?;
        pos += n;
        key_size
    };

    let version = if record_type == RecordType::VData {
        let (version, n) = read_varint(&data[pos..])?;
        pos += n;
        version
    } else {
        0
    };

    Ok((
        Header {
            record_type: Some(record_type),
            record_size,
            key_size,
            version,
        },
        pos,
    ))
}

/// Encode a record header into `out`, returning the number of bytes appended.
pub fn write_header(header: &Header, out: &mut Vec<u8>) -> Result<usize> {
    let record_type = match header.record_type {
        Some(t) => t,
        None => return err_at!(InvalidInput, msg: "header missing record_type"),
    };
    let start = out.len();
    out.push(record_type as u8);
    write_varint(header.record_size, out);
    if record_type != RecordType::Filler {
        write_varint(header.key_size, out);
    }
    if record_type == RecordType::VData {
        write_varint(header.version, out);
    }
    Ok(out.len() - start)
}

/// Fixed-layout file header. `hdrlen` is the actual on-disk size of this
/// header, always `≤ 40` bytes, so that future fields can be appended without
/// breaking old readers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub hdrlen: u8,
    pub compression: Compression,
    pub flags: u16,
    pub chunk_size: u64,
    pub index_root: u64,
    pub index_start: u64,
    pub index_page_size: u32,
    pub index_depth: u32,
}

impl FileHeader {
    pub const ENCODED_LEN: usize = 40;
    pub const INDEXED_FLAG: u16 = 0x0001;

    pub fn new(chunk_size: u64, compression: Compression) -> FileHeader {
        FileHeader {
            magic: MAGIC1,
            hdrlen: Self::ENCODED_LEN as u8,
            compression,
            flags: 0,
            chunk_size,
            index_root: 0,
            index_start: 0,
            index_page_size: 0,
            index_depth: 0,
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.flags & Self::INDEXED_FLAG != 0
    }

    pub fn set_indexed(&mut self, root: u64, start: u64, page_size: u32, depth: u32) {
        self.magic = MAGIC2;
        self.flags |= Self::INDEXED_FLAG;
        self.index_root = root;
        self.index_start = start;
        self.index_page_size = page_size;
        self.index_depth = depth;
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4] = self.hdrlen;
        buf[5] = self.compression as u8;
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.index_root.to_le_bytes());
        buf[24..32].copy_from_slice(&self.index_start.to_le_bytes());
        buf[32..36].copy_from_slice(&self.index_page_size.to_le_bytes());
        buf[36..40].copy_from_slice(&self.index_depth.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<FileHeader> {
        if buf.len() < Self::ENCODED_LEN {
            return err_at!(InvalidFormat, msg: "short file header: {} bytes", buf.len());
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC1 && magic != MAGIC2 {
            return err_at!(InvalidFormat, msg: "bad magic 0x{:08x}", magic);
        }
        let compression = Compression::try_from(buf[5])?;
        Ok(FileHeader {
            magic,
            hdrlen: buf[4],
            compression,
            flags: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            chunk_size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            index_root: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            index_start: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            index_page_size: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            index_depth: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        for val in [0u64, 1, 127, 128, 16384, u64::MAX] {
            let mut buf = vec![];
            write_varint(val, &mut buf);
            let (got, n) = read_varint(&buf).unwrap();
            assert_eq!(got, val);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn test_data_header_roundtrip() {
        let header = Header {
            record_type: Some(RecordType::Data),
            record_size: 1234,
            key_size: 16,
            version: 0,
        };
        let mut buf = vec![];
        write_header(&header, &mut buf).unwrap();
        let (got, n) = read_header(&buf).unwrap();
        assert_eq!(got, header);
        assert_eq!(n, buf.len());
        assert!(buf.len() <= MAX_HEADER_LEN);
    }

    #[test]
    fn test_filler_header_omits_key_size() {
        let header = Header {
            record_type: Some(RecordType::Filler),
            record_size: 7,
            key_size: 0,
            version: 0,
        };
        let mut buf = vec![];
        write_header(&header, &mut buf).unwrap();
        assert!(buf.len() >= 2);
        let (got, _) = read_header(&buf).unwrap();
        assert_eq!(got.record_type, Some(RecordType::Filler));
        assert_eq!(got.record_size, 7);
    }

    #[test]
    fn test_vdata_header_has_version() {
        let header = Header {
            record_type: Some(RecordType::VData),
            record_size: 99,
            key_size: 3,
            version: 42,
        };
        let mut buf = vec![];
        write_header(&header, &mut buf).unwrap();
        let (got, _) = read_header(&buf).unwrap();
        assert_eq!(got.version, 42);
    }

    #[test]
    fn test_file_header_roundtrip() {
        let mut header = FileHeader::new(64 * 1024 * 1024, Compression::Snappy);
        header.set_indexed(1000, 900, 1024, 3);
        let buf = header.encode();
        let got = FileHeader::decode(&buf).unwrap();
        assert_eq!(got, header);
        assert!(got.is_indexed());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = [0u8; FileHeader::ENCODED_LEN];
        buf[0..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        assert!(FileHeader::decode(&buf).is_err());
    }
}
