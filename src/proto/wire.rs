//! Wire codec for the binary protocol: verbs, per-verb bodies, and the put
//! mode/result enums shared with [crate::database].
//!
//! Grounded on `sling/db/dbprotocol.h`'s `DBVerb`/`DBMode`/`DBResult`/
//! `DBHeader` and the record/recinfo wire layouts documented there.

use std::convert::TryFrom;

use crate::{
    database::{Mode as DbMode, PutStatus},
    err_at,
    record::file::Record,
    Error, Result,
};

/// Fixed packet header: 4-byte verb + 4-byte body size, little-endian.
pub const HEADER_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Use = 0,
    Get = 1,
    Put = 2,
    Delete = 3,
    Next = 4,
    Bulk = 5,
    Epoch = 6,
    Head = 7,
    Next2 = 8,

    Ok = 128,
    Error = 129,
    Record = 130,
    Result = 131,
    Done = 132,
    RecId = 133,
    RecInfo = 134,
}

impl TryFrom<u32> for Verb {
    type Error = Error;

    fn try_from(v: u32) -> Result<Verb> {
        use Verb::*;
        match v {
            0 => Ok(Use),
            1 => Ok(Get),
            2 => Ok(Put),
            3 => Ok(Delete),
            4 => Ok(Next),
            5 => Ok(Bulk),
            6 => Ok(Epoch),
            7 => Ok(Head),
            8 => Ok(Next2),
            128 => Ok(Ok),
            129 => Ok(Error),
            130 => Ok(Record),
            131 => Ok(Result),
            132 => Ok(Done),
            133 => Ok(RecId),
            134 => Ok(RecInfo),
            v => err_at!(InvalidFormat, msg: "unknown protocol verb {}", v),
        }
    }
}

/// Put mode, as sent on the wire for a [Verb::Put] request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Overwrite = 0,
    Add = 1,
    Ordered = 2,
    Newer = 3,
}

impl TryFrom<u32> for Mode {
    type Error = Error;

    fn try_from(v: u32) -> Result<Mode> {
        match v {
            0 => Ok(Mode::Overwrite),
            1 => Ok(Mode::Add),
            2 => Ok(Mode::Ordered),
            3 => Ok(Mode::Newer),
            v => err_at!(InvalidFormat, msg: "unknown put mode {}", v),
        }
    }
}

impl From<Mode> for DbMode {
    fn from(m: Mode) -> DbMode {
        match m {
            Mode::Overwrite => DbMode::Overwrite,
            Mode::Add => DbMode::Add,
            Mode::Ordered => DbMode::Ordered,
            Mode::Newer => DbMode::Newer,
        }
    }
}

/// Put outcome, as sent on the wire in a [Verb::Result] reply. `Fault` has no
/// [PutStatus] counterpart: it is reserved for a write that failed for
/// reasons unrelated to versioning (disk full, index overflow).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultCode {
    New = 0,
    Updated = 1,
    Unchanged = 2,
    Exists = 3,
    Stale = 4,
    Fault = 5,
}

impl From<PutStatus> for ResultCode {
    fn from(s: PutStatus) -> ResultCode {
        match s {
            PutStatus::New => ResultCode::New,
            PutStatus::Updated => ResultCode::Updated,
            PutStatus::Unchanged => ResultCode::Unchanged,
            PutStatus::Exists => ResultCode::Exists,
            PutStatus::Stale => ResultCode::Stale,
        }
    }
}

/// `{verb:u32, size:u32}`, little-endian.
#[derive(Clone, Copy, Debug)]
pub struct PacketHeader {
    pub verb: Verb,
    pub size: u32,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&(self.verb as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<PacketHeader> {
        if buf.len() < HEADER_LEN {
            return err_at!(InvalidFormat, msg: "short packet header: {} bytes", buf.len());
        }
        let verb = Verb::try_from(u32::from_le_bytes(buf[0..4].try_into().unwrap()))?;
        let size = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        Ok(PacketHeader { verb, size })
    }
}

/// Reply to a [Verb::Head] request: version and value size, `vsize == 0`
/// meaning "not found".
#[derive(Clone, Copy, Debug)]
pub struct RecInfo {
    pub version: u64,
    pub vsize: u32,
}

impl RecInfo {
    pub const ENCODED_LEN: usize = 12;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.vsize.to_le_bytes());
    }

    pub fn decode(data: &[u8]) -> Result<(RecInfo, usize)> {
        if data.len() < Self::ENCODED_LEN {
            return err_at!(InvalidFormat, msg: "short recinfo: {} bytes", data.len());
        }
        let version = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let vsize = u32::from_le_bytes(data[8..12].try_into().unwrap());
        Ok((RecInfo { version, vsize }, Self::ENCODED_LEN))
    }
}

/// Encode a bare key: `ksize:u32` (key length only, no version bit) + bytes.
/// Used by [Verb::Get]/[Verb::Head]/[Verb::Delete] request bodies.
pub fn encode_key(key: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(key);
}

pub fn decode_key(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    if data.len() < 4 {
        return err_at!(InvalidFormat, msg: "short key: {} bytes", data.len());
    }
    let ksize = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
    if data.len() < 4 + ksize {
        return err_at!(InvalidFormat, msg: "truncated key body");
    }
    Ok((data[4..4 + ksize].to_vec(), 4 + ksize))
}

/// Encode a record: `ksize` (key length shifted left one bit, low bit set iff
/// `version != 0`) + key + optional version + `vsize` + value.
pub fn encode_record(record: &Record, out: &mut Vec<u8>) {
    let has_version = record.version != 0;
    let ksize = ((record.key.len() as u32) << 1) | (has_version as u32);
    out.extend_from_slice(&ksize.to_le_bytes());
    out.extend_from_slice(&record.key);
    if has_version {
        out.extend_from_slice(&record.version.to_le_bytes());
    }
    out.extend_from_slice(&(record.value.len() as u32).to_le_bytes());
    out.extend_from_slice(&record.value);
}

pub fn decode_record(data: &[u8]) -> Result<(Record, usize)> {
    if data.len() < 4 {
        return err_at!(InvalidFormat, msg: "short record: {} bytes", data.len());
    }
    let raw_ksize = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let has_version = raw_ksize & 1 != 0;
    let ksize = (raw_ksize >> 1) as usize;
    let mut pos = 4;

    if data.len() < pos + ksize {
        return err_at!(InvalidFormat, msg: "truncated record key");
    }
    let key = data[pos..pos + ksize].to_vec();
    pos += ksize;

    let version = if has_version {
        if data.len() < pos + 8 {
            return err_at!(InvalidFormat, msg: "truncated record version");
        }
        let v = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
        pos += 8;
        v
    } else {
        0
    };

    if data.len() < pos + 4 {
        return err_at!(InvalidFormat, msg: "truncated record vsize");
    }
    let vsize = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;

    if data.len() < pos + vsize {
        return err_at!(InvalidFormat, msg: "truncated record value");
    }
    let value = data[pos..pos + vsize].to_vec();
    pos += vsize;

    Ok((
        Record {
            key,
            version,
            value,
            position: None,
        },
        pos,
    ))
}

/// Request body for [Verb::Next2]: `flags:u8, recid:u64, num:u32, {limit:u64}`.
/// `limit` is present only when bit 1 of `flags` is set.
#[derive(Clone, Copy, Debug)]
pub struct Next2Request {
    pub include_deletions: bool,
    pub honor_limit: bool,
    pub exclude_value: bool,
    pub recid: u64,
    pub num: u32,
    pub limit: u64,
}

impl Next2Request {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut flags = 0u8;
        if self.include_deletions {
            flags |= 0x1;
        }
        if self.honor_limit {
            flags |= 0x2;
        }
        if self.exclude_value {
            flags |= 0x4;
        }
        out.push(flags);
        out.extend_from_slice(&self.recid.to_le_bytes());
        out.extend_from_slice(&self.num.to_le_bytes());
        if self.honor_limit {
            out.extend_from_slice(&self.limit.to_le_bytes());
        }
    }

    pub fn decode(data: &[u8]) -> Result<Next2Request> {
        if data.len() < 13 {
            return err_at!(InvalidFormat, msg: "short NEXT2 body: {} bytes", data.len());
        }
        let flags = data[0];
        let recid = u64::from_le_bytes(data[1..9].try_into().unwrap());
        let num = u32::from_le_bytes(data[9..13].try_into().unwrap());
        let honor_limit = flags & 0x2 != 0;
        let limit = if honor_limit {
            if data.len() < 21 {
                return err_at!(InvalidFormat, msg: "NEXT2 missing limit field");
            }
            u64::from_le_bytes(data[13..21].try_into().unwrap())
        } else {
            0
        };
        Ok(Next2Request {
            include_deletions: flags & 0x1 != 0,
            honor_limit,
            exclude_value: flags & 0x4 != 0,
            recid,
            num,
            limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_roundtrip() {
        let hdr = PacketHeader {
            verb: Verb::Put,
            size: 4096,
        };
        let buf = hdr.encode();
        let got = PacketHeader::decode(&buf).unwrap();
        assert_eq!(got.verb, Verb::Put);
        assert_eq!(got.size, 4096);
    }

    #[test]
    fn test_key_roundtrip() {
        let mut buf = vec![];
        encode_key(b"hello", &mut buf);
        let (key, n) = decode_key(&buf).unwrap();
        assert_eq!(key, b"hello");
        assert_eq!(n, buf.len());
    }

    #[test]
    fn test_record_roundtrip_with_version() {
        let rec = Record::with_version(b"k".to_vec(), 7, b"value".to_vec());
        let mut buf = vec![];
        encode_record(&rec, &mut buf);
        let (got, n) = decode_record(&buf).unwrap();
        assert_eq!(got.key, rec.key);
        assert_eq!(got.version, 7);
        assert_eq!(got.value, rec.value);
        assert_eq!(n, buf.len());
    }

    #[test]
    fn test_record_roundtrip_without_version() {
        let rec = Record::new(b"k".to_vec(), b"v".to_vec());
        let mut buf = vec![];
        encode_record(&rec, &mut buf);
        let (got, _) = decode_record(&buf).unwrap();
        assert_eq!(got.version, 0);
    }

    #[test]
    fn test_recinfo_roundtrip() {
        let info = RecInfo {
            version: 99,
            vsize: 1024,
        };
        let mut buf = vec![];
        info.encode(&mut buf);
        let (got, n) = RecInfo::decode(&buf).unwrap();
        assert_eq!(got.version, 99);
        assert_eq!(got.vsize, 1024);
        assert_eq!(n, RecInfo::ENCODED_LEN);
    }

    #[test]
    fn test_mode_maps_to_database_mode() {
        assert_eq!(DbMode::from(Mode::Newer), DbMode::Newer);
    }

    #[test]
    fn test_next2_roundtrip_with_limit() {
        let req = Next2Request {
            include_deletions: true,
            honor_limit: true,
            exclude_value: false,
            recid: 1000,
            num: 50,
            limit: 5000,
        };
        let mut buf = vec![];
        req.encode(&mut buf);
        let got = Next2Request::decode(&buf).unwrap();
        assert!(got.include_deletions);
        assert!(got.honor_limit);
        assert_eq!(got.limit, 5000);
    }

    #[test]
    fn test_next2_roundtrip_without_limit() {
        let req = Next2Request {
            include_deletions: false,
            honor_limit: false,
            exclude_value: true,
            recid: 0,
            num: 10,
            limit: 0,
        };
        let mut buf = vec![];
        req.encode(&mut buf);
        let got = Next2Request::decode(&buf).unwrap();
        assert!(!got.honor_limit);
        assert!(got.exclude_value);
    }
}
