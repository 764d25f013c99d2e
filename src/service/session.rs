//! Per-connection binary-protocol verb dispatch.
//!
//! Grounded on `dbserver.h`'s `DBSession`: one session per connection, an
//! active `mount` selected by `USE`, and a `Process` loop translating framed
//! requests into `Database` calls while holding the mount's mutex for the
//! duration of each verb.

use std::{convert::TryFrom, sync::Arc, time::Duration};

use crate::{
    database::{Cursor, Mode as DbMode},
    err_at,
    net::connection::Connection,
    proto::wire::{decode_key, decode_record, encode_record, Mode, Next2Request, RecInfo, ResultCode, Verb},
    record::file::Record,
    service::mount::{Mount, MountTable},
    Error, Result,
};

/// DB sessions get a long idle timeout (24h) instead of the server default,
/// matching `dbserver.h`'s `DBSession::IdleTimeout`.
pub const DB_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Pack a cross-shard [Cursor] into the single `recid: u64` the wire protocol
/// carries. The original single-shard format used `recid` as a bare file
/// offset; this reserves its top 16 bits for the shard index, a necessary
/// generalization once a database has more than one shard.
pub(crate) fn encode_recid(cursor: &Cursor) -> u64 {
    ((cursor.shard as u64) << 48) | (cursor.position & 0x0000_ffff_ffff_ffff)
}

pub(crate) fn decode_recid(recid: u64) -> Cursor {
    Cursor {
        shard: (recid >> 48) as usize,
        position: recid & 0x0000_ffff_ffff_ffff,
    }
}

fn scan(
    db: &mut crate::database::Database,
    cursor: &mut Cursor,
    num: usize,
    include_deletions: bool,
    honor_limit: bool,
    limit: u64,
) -> Result<Vec<Record>> {
    let mut out = Vec::with_capacity(num);
    while out.len() < num {
        if honor_limit && encode_recid(cursor) >= limit {
            break;
        }
        let batch = db.next(cursor, 1, include_deletions)?;
        if batch.is_empty() {
            break;
        }
        out.extend(batch);
    }
    Ok(out)
}

pub struct Session {
    mounts: Arc<MountTable>,
    mount: Option<Arc<Mount>>,
}

impl Session {
    pub fn new(mounts: Arc<MountTable>) -> Session {
        Session { mounts, mount: None }
    }

    /// Drive the binary protocol loop until the peer disconnects.
    pub fn serve(&mut self, conn: &mut Connection) -> Result<()> {
        conn.set_read_timeout(Some(DB_SESSION_IDLE_TIMEOUT))?;
        loop {
            let (verb, body) = match conn.read_packet() {
                Ok(pair) => pair,
                Err(Error::Disconnected(..)) => return Ok(()),
                Err(err) => return Err(err),
            };
            if let Err(err) = self.dispatch(conn, verb, &body) {
                conn.write_packet(Verb::Error, err.to_string().as_bytes())?;
            }
        }
    }

    fn active(&self) -> Result<Arc<Mount>> {
        match &self.mount {
            Some(mount) => Ok(Arc::clone(mount)),
            None => err_at!(APIMisuse, msg: "no database selected; send USE first"),
        }
    }

    fn dispatch(&mut self, conn: &mut Connection, verb: Verb, body: &[u8]) -> Result<()> {
        match verb {
            Verb::Use => self.use_db(conn, body),
            Verb::Bulk => self.bulk(conn, body),
            Verb::Get => self.get(conn, body),
            Verb::Head => self.head(conn, body),
            Verb::Put => self.put(conn, body),
            Verb::Delete => self.delete(conn, body),
            Verb::Next => self.next(conn, body),
            Verb::Next2 => self.next2(conn, body),
            Verb::Epoch => self.epoch(conn),
            v => err_at!(InvalidInput, msg: "{:?} is not a request verb", v),
        }
    }

    fn use_db(&mut self, conn: &mut Connection, body: &[u8]) -> Result<()> {
        let name = String::from_utf8_lossy(body).to_string();
        self.select(&name)?;
        conn.write_packet(Verb::Ok, &[])
    }

    /// Select the active mount without sending a reply; used for the
    /// database named in the `Upgrade` request's path, before any framed
    /// packet has been exchanged.
    pub fn select(&mut self, name: &str) -> Result<()> {
        let mount = match self.mounts.get(name) {
            Some(mount) => mount,
            None => return err_at!(NotMounted, msg: "database {:?} is not mounted", name),
        };
        self.mount = Some(mount);
        Ok(())
    }

    fn bulk(&mut self, conn: &mut Connection, body: &[u8]) -> Result<()> {
        let mount = self.active()?;
        let enable = body.first().copied().unwrap_or(0) != 0;
        mount.lock().set_bulk(enable);
        conn.write_packet(Verb::Ok, &[])
    }

    fn get(&mut self, conn: &mut Connection, body: &[u8]) -> Result<()> {
        let mount = self.active()?;
        let (key, _) = decode_key(body)?;
        match mount.lock().get(&key)? {
            Some(rec) => {
                let mut out = Vec::new();
                encode_record(&rec, &mut out);
                conn.write_packet(Verb::Record, &out)
            }
            None => conn.write_packet(Verb::Done, &[]),
        }
    }

    fn head(&mut self, conn: &mut Connection, body: &[u8]) -> Result<()> {
        let mount = self.active()?;
        let (key, _) = decode_key(body)?;
        let info = match mount.lock().head(&key)? {
            Some((version, vsize)) => RecInfo {
                version,
                vsize: vsize as u32,
            },
            None => RecInfo { version: 0, vsize: 0 },
        };
        let mut out = Vec::new();
        info.encode(&mut out);
        conn.write_packet(Verb::RecInfo, &out)
    }

    fn put(&mut self, conn: &mut Connection, body: &[u8]) -> Result<()> {
        let mount = self.active()?;
        if body.len() < 4 {
            return err_at!(InvalidFormat, msg: "short PUT body: {} bytes", body.len());
        }
        let mode = Mode::try_from(u32::from_le_bytes(body[0..4].try_into().unwrap()))?;
        let (rec, _) = decode_record(&body[4..])?;

        let result = mount.lock().put(&rec.key, rec.version, &rec.value, DbMode::from(mode))?;

        let mut out = Vec::new();
        out.extend_from_slice(&(ResultCode::from(result.status) as u32).to_le_bytes());
        out.extend_from_slice(&result.version.to_le_bytes());
        conn.write_packet(Verb::Result, &out)
    }

    fn delete(&mut self, conn: &mut Connection, body: &[u8]) -> Result<()> {
        let mount = self.active()?;
        let (key, _) = decode_key(body)?;
        let found = mount.lock().delete(&key)?;
        conn.write_packet(Verb::Ok, &[found as u8])
    }

    /// Legacy NEXT: always excludes tombstones and honors no `limit`.
    fn next(&mut self, conn: &mut Connection, body: &[u8]) -> Result<()> {
        if body.len() < 12 {
            return err_at!(InvalidFormat, msg: "short NEXT body: {} bytes", body.len());
        }
        let recid = u64::from_le_bytes(body[0..8].try_into().unwrap());
        let num = u32::from_le_bytes(body[8..12].try_into().unwrap()) as usize;
        self.scan_and_reply(conn, recid, num, false, false, 0, false)
    }

    fn next2(&mut self, conn: &mut Connection, body: &[u8]) -> Result<()> {
        let req = Next2Request::decode(body)?;
        self.scan_and_reply(
            conn,
            req.recid,
            req.num as usize,
            req.include_deletions,
            req.honor_limit,
            req.limit,
            req.exclude_value,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_and_reply(
        &mut self,
        conn: &mut Connection,
        recid: u64,
        num: usize,
        include_deletions: bool,
        honor_limit: bool,
        limit: u64,
        exclude_value: bool,
    ) -> Result<()> {
        let mount = self.active()?;
        let mut cursor = decode_recid(recid);
        let records = {
            let mut db = mount.lock();
            scan(&mut db, &mut cursor, num, include_deletions, honor_limit, limit)?
        };

        for mut rec in records {
            if exclude_value {
                rec.value.clear();
            }
            let mut out = Vec::new();
            encode_record(&rec, &mut out);
            conn.write_packet(Verb::Record, &out)?;
        }
        conn.write_packet(Verb::RecId, &encode_recid(&cursor).to_le_bytes())?;
        conn.write_packet(Verb::Done, &[])
    }

    fn epoch(&mut self, conn: &mut Connection) -> Result<()> {
        let mount = self.active()?;
        let epoch = mount.lock().epoch();
        conn.write_packet(Verb::RecId, &epoch.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recid_roundtrip_across_shards() {
        let cursor = Cursor {
            shard: 3,
            position: 123_456,
        };
        let recid = encode_recid(&cursor);
        let got = decode_recid(recid);
        assert_eq!(got, cursor);
    }
}
