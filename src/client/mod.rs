//! Client library for the binary protocol.
//!
//! Grounded on `sling/db/dbclient.h`'s `DBClient`: connect with
//! `[<host>[:<port>]/]<database>`, then `Use`/`Get`/`Put`/`Delete`/`Next`/
//! `Epoch` go through [Client::transact], which reconnects and retries once
//! on a broken connection.

use std::{net::TcpStream, time::Duration};

use crate::{
    err_at,
    net::connection::Connection,
    proto::{
        upgrade,
        wire::{decode_key, decode_record, encode_key, encode_record, Mode, RecInfo, ResultCode, Verb},
    },
    record::file::Record,
    Error, Result,
};

const DEFAULT_HOST: &str = "localhost:7070";

/// Split `[<host>[:<port>]/]<database>` into `(hostport, dbname)`.
fn parse_spec(spec: &str) -> (String, Option<String>) {
    match spec.split_once('/') {
        Some((hostport, dbname)) => {
            let hostport = if hostport.is_empty() {
                DEFAULT_HOST.to_string()
            } else {
                hostport.to_string()
            };
            (hostport, Some(dbname.to_string()))
        }
        None => (DEFAULT_HOST.to_string(), Some(spec.to_string())),
    }
}

/// Outcome of a [Client::put]/[Client::add] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PutOutcome {
    pub result: ResultCode,
    pub version: u64,
}

pub struct Client {
    hostport: String,
    dbname: Option<String>,
    conn: Connection,
}

impl Client {
    /// Connect to `spec` (`[<host>[:<port>]/]<database>`), perform the
    /// `Upgrade` handshake, and `USE` the database if one was named.
    pub fn connect(spec: &str) -> Result<Client> {
        let (hostport, dbname) = parse_spec(spec);
        let conn = Self::dial(&hostport, dbname.as_deref())?;
        Ok(Client { hostport, dbname, conn })
    }

    fn dial(hostport: &str, dbname: Option<&str>) -> Result<Connection> {
        let stream = err_at!(IOError, TcpStream::connect(hostport))?;
        let path = match dbname {
            Some(name) => format!("/{}", name),
            None => "/".to_string(),
        };
        upgrade::write_request(&stream, &path)?;
        upgrade::read_response(&stream)?;
        Connection::new(stream)
    }

    fn reconnect(&mut self) -> Result<()> {
        self.conn = Self::dial(&self.hostport, self.dbname.as_deref())?;
        Ok(())
    }

    /// Set a socket-level timeout for subsequent requests (connect itself is
    /// not bounded; DNS resolution in this client is always blocking).
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.conn.set_read_timeout(timeout)
    }

    fn is_broken(err: &Error) -> bool {
        matches!(err, Error::Disconnected(..) | Error::Timeout(..) | Error::IOError(..))
    }

    /// Run `f` once; on a broken connection, reconnect to the same
    /// `(host, db)` and run it exactly once more.
    fn transact<T>(&mut self, f: impl Fn(&mut Connection) -> Result<T>) -> Result<T> {
        match f(&mut self.conn) {
            Ok(val) => Ok(val),
            Err(err) if Self::is_broken(&err) => {
                self.reconnect()?;
                f(&mut self.conn)
            }
            Err(err) => Err(err),
        }
    }

    pub fn use_db(&mut self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.transact(|conn| {
            conn.write_packet(Verb::Use, name.as_bytes())?;
            let (verb, _) = conn.read_packet()?;
            expect(verb, Verb::Ok)
        })?;
        self.dbname = Some(name);
        Ok(())
    }

    pub fn bulk(&mut self, enable: bool) -> Result<()> {
        self.transact(|conn| {
            conn.write_packet(Verb::Bulk, &[enable as u8])?;
            let (verb, _) = conn.read_packet()?;
            expect(verb, Verb::Ok)
        })
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Record>> {
        let key = key.to_vec();
        self.transact(|conn| {
            let mut body = Vec::new();
            encode_key(&key, &mut body);
            conn.write_packet(Verb::Get, &body)?;
            let (verb, body) = conn.read_packet()?;
            match verb {
                Verb::Record => Ok(Some(decode_record(&body)?.0)),
                Verb::Done => Ok(None),
                Verb::Error => err_at!(Fatal, msg: "{}", String::from_utf8_lossy(&body)),
                v => err_at!(InvalidFormat, msg: "unexpected reply verb {:?} to GET", v),
            }
        })
    }

    pub fn head(&mut self, key: &[u8]) -> Result<Option<(u64, u32)>> {
        let key = key.to_vec();
        self.transact(|conn| {
            let mut body = Vec::new();
            encode_key(&key, &mut body);
            conn.write_packet(Verb::Head, &body)?;
            let (verb, body) = conn.read_packet()?;
            expect(verb, Verb::RecInfo)?;
            let (info, _) = RecInfo::decode(&body)?;
            if info.vsize == 0 && info.version == 0 {
                Ok(None)
            } else {
                Ok(Some((info.version, info.vsize)))
            }
        })
    }

    pub fn put(&mut self, key: &[u8], version: u64, value: &[u8], mode: Mode) -> Result<PutOutcome> {
        let record = Record {
            key: key.to_vec(),
            version,
            value: value.to_vec(),
            position: None,
        };
        self.transact(|conn| {
            let mut body = Vec::new();
            body.extend_from_slice(&(mode as u32).to_le_bytes());
            encode_record(&record, &mut body);
            conn.write_packet(Verb::Put, &body)?;

            let (verb, body) = conn.read_packet()?;
            expect(verb, Verb::Result)?;
            if body.len() < 12 {
                return err_at!(InvalidFormat, msg: "short RESULT body: {} bytes", body.len());
            }
            let code_raw = u32::from_le_bytes(body[0..4].try_into().unwrap());
            let version = u64::from_le_bytes(body[4..12].try_into().unwrap());
            Ok(PutOutcome {
                result: result_code(code_raw)?,
                version,
            })
        })
    }

    /// Shorthand for [Client::put] with [Mode::Add].
    pub fn add(&mut self, key: &[u8], version: u64, value: &[u8]) -> Result<PutOutcome> {
        self.put(key, version, value, Mode::Add)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let key = key.to_vec();
        self.transact(|conn| {
            let mut body = Vec::new();
            encode_key(&key, &mut body);
            conn.write_packet(Verb::Delete, &body)?;
            let (verb, body) = conn.read_packet()?;
            expect(verb, Verb::Ok)?;
            Ok(body.first().copied().unwrap_or(0) != 0)
        })
    }

    /// Fetch up to `num` records starting at `recid` (0 to start from the
    /// beginning), returning the records and the recid to resume from.
    pub fn next(&mut self, recid: u64, num: u32) -> Result<(Vec<Record>, u64)> {
        self.transact(|conn| {
            let mut body = Vec::new();
            body.extend_from_slice(&recid.to_le_bytes());
            body.extend_from_slice(&num.to_le_bytes());
            conn.write_packet(Verb::Next, &body)?;

            let mut records = Vec::new();
            let mut next_recid = recid;
            loop {
                let (verb, body) = conn.read_packet()?;
                match verb {
                    Verb::Record => records.push(decode_record(&body)?.0),
                    Verb::RecId => {
                        if body.len() >= 8 {
                            next_recid = u64::from_le_bytes(body[0..8].try_into().unwrap());
                        }
                    }
                    Verb::Done => break,
                    Verb::Error => return err_at!(Fatal, msg: "{}", String::from_utf8_lossy(&body)),
                    v => return err_at!(InvalidFormat, msg: "unexpected reply verb {:?} to NEXT", v),
                }
            }
            Ok((records, next_recid))
        })
    }

    pub fn epoch(&mut self) -> Result<u64> {
        self.transact(|conn| {
            conn.write_packet(Verb::Epoch, &[])?;
            let (verb, body) = conn.read_packet()?;
            expect(verb, Verb::RecId)?;
            if body.len() < 8 {
                return err_at!(InvalidFormat, msg: "short epoch reply");
            }
            Ok(u64::from_le_bytes(body[0..8].try_into().unwrap()))
        })
    }
}

fn expect(got: Verb, want: Verb) -> Result<()> {
    if got == want {
        Ok(())
    } else if got == Verb::Error {
        err_at!(Fatal, msg: "server returned an error")
    } else {
        err_at!(InvalidFormat, msg: "expected {:?} reply, got {:?}", want, got)
    }
}

fn result_code(raw: u32) -> Result<ResultCode> {
    match raw {
        0 => Ok(ResultCode::New),
        1 => Ok(ResultCode::Updated),
        2 => Ok(ResultCode::Unchanged),
        3 => Ok(ResultCode::Exists),
        4 => Ok(ResultCode::Stale),
        5 => Ok(ResultCode::Fault),
        v => err_at!(InvalidFormat, msg: "unknown result code {}", v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spec_with_host_and_db() {
        let (host, db) = parse_spec("db1.example.com:7070/orders");
        assert_eq!(host, "db1.example.com:7070");
        assert_eq!(db.as_deref(), Some("orders"));
    }

    #[test]
    fn test_parse_spec_db_only() {
        let (host, db) = parse_spec("orders");
        assert_eq!(host, DEFAULT_HOST);
        assert_eq!(db.as_deref(), Some("orders"));
    }

    #[test]
    fn test_parse_spec_host_only_no_db() {
        let (host, db) = parse_spec("myhost:7070/");
        assert_eq!(host, "myhost:7070");
        assert_eq!(db.as_deref(), Some(""));
    }
}
