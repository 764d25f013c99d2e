//! Multi-tenant database service: mount table, background checkpoint
//! thread, per-connection session dispatch, and the admin HTTP surface.
//!
//! Grounded on `sling/db/dbserver.h`'s `DBService`.

pub mod http;
pub mod mount;
pub mod session;

use std::{
    path::{Path, PathBuf},
    sync::{mpsc::RecvTimeoutError, Arc},
    time::{Duration, Instant},
};

use log::{error, warn};

use crate::{
    database::{Config as DbConfig, Database},
    net::connection::Connection,
    proto::upgrade,
    util::thread::Thread,
    Result,
};

pub use mount::{Mount, MountTable};
pub use session::Session;

/// How often the checkpoint thread wakes up to check every mount's
/// `should_checkpoint` predicate. Independent of the 60s/10s flush
/// thresholds themselves.
const CHECKPOINT_TICK: Duration = Duration::from_secs(1);

/// `POST /create?name=…`: lay down a brand new, empty database.
pub(crate) fn create_mount(mounts: &MountTable, dbdir: &Path, name: &str, num_shards: usize) -> Result<()> {
    let config = DbConfig::new(dbdir, name).set_num_shards(num_shards.max(1));
    let db = Database::create(config)?;
    mounts.insert(name, db)?;
    Ok(())
}

/// `POST /mount?name=…[&recover=1]`: attach an existing database's files.
/// `Database::open` always replays any tail the last checkpoint missed, so
/// `recover` is accepted for API parity but does not change behavior.
pub(crate) fn open_mount(mounts: &MountTable, dbdir: &Path, name: &str, _recover: bool) -> Result<()> {
    let config = DbConfig::new(dbdir, name);
    let db = Database::open(config)?;
    mounts.insert(name, db)?;
    Ok(())
}

/// `POST /unmount?name=…`: checkpoint and drop the mount.
pub(crate) fn close_mount(mounts: &MountTable, name: &str) -> Result<()> {
    let mount = mounts.remove(name)?;
    mount.lock().checkpoint()?;
    Ok(())
}

pub struct Service {
    mounts: Arc<MountTable>,
    dbdir: PathBuf,
    checkpoint: Option<Thread<(), ()>>,
}

impl Service {
    pub fn new<P: AsRef<Path>>(dbdir: P) -> Service {
        Service {
            mounts: Arc::new(MountTable::new()),
            dbdir: dbdir.as_ref().to_path_buf(),
            checkpoint: None,
        }
    }

    pub fn mounts(&self) -> Arc<MountTable> {
        Arc::clone(&self.mounts)
    }

    pub fn dbdir(&self) -> &Path {
        &self.dbdir
    }

    /// Spawn the background thread that flushes dirty mounts. Dropping the
    /// returned `Service` (or calling [Service::stop_checkpoint_thread])
    /// joins it.
    pub fn start_checkpoint_thread(&mut self) {
        let mounts = Arc::clone(&self.mounts);
        let thread = Thread::new("checkpoint", move |rx| {
            move || loop {
                match rx.recv_timeout(CHECKPOINT_TICK) {
                    Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        let now = Instant::now();
                        mounts.for_each(|mount| {
                            let mut db = mount.lock();
                            if db.should_checkpoint(now) {
                                if let Err(err) = db.checkpoint() {
                                    error!("checkpoint failed for {:?}: {}", mount.name(), err);
                                }
                            }
                        });
                    }
                }
            }
        });
        self.checkpoint = Some(thread);
    }

    pub fn stop_checkpoint_thread(&mut self) -> Result<()> {
        if let Some(thread) = self.checkpoint.take() {
            thread.join()?;
        }
        Ok(())
    }

    pub fn create(&self, name: &str, num_shards: usize) -> Result<()> {
        create_mount(&self.mounts, &self.dbdir, name, num_shards)
    }

    pub fn mount(&self, name: &str, recover: bool) -> Result<()> {
        open_mount(&self.mounts, &self.dbdir, name, recover)
    }

    pub fn unmount(&self, name: &str) -> Result<()> {
        close_mount(&self.mounts, name)
    }

    /// Flush every mounted database; called on graceful shutdown.
    pub fn flush_all(&self) {
        self.mounts.for_each(|mount| {
            let mut db = mount.lock();
            if let Err(err) = db.checkpoint() {
                error!("flush failed for {:?}: {}", mount.name(), err);
            }
        });
    }
}

/// [crate::net::server::Handler] that sniffs each connection's first request:
/// an `Upgrade: slingdb` handshake continues into the binary [Session]
/// protocol, anything else is routed to [http::handle] as an admin or
/// data-plane HTTP request.
pub struct SessionHandler {
    mounts: Arc<MountTable>,
    dbdir: PathBuf,
}

impl SessionHandler {
    pub fn new(mounts: Arc<MountTable>, dbdir: PathBuf) -> SessionHandler {
        SessionHandler { mounts, dbdir }
    }
}

impl crate::net::server::Handler for SessionHandler {
    fn handle(&self, mut conn: Connection) -> Result<()> {
        let req = match http::Request::read(&mut conn) {
            Ok(req) => req,
            Err(err) => {
                warn!("failed to parse request from {}: {}", conn.peer(), err);
                return upgrade::write_error(&mut conn, 400, "Bad Request");
            }
        };

        if !req.is_upgrade() {
            return http::handle(&self.mounts, &self.dbdir, &mut conn, &req);
        }

        upgrade::write_response(&mut conn)?;

        let mut session = Session::new(Arc::clone(&self.mounts));
        let dbname = req.path.trim_start_matches('/');
        if !dbname.is_empty() {
            session.select(dbname)?;
        }
        session.serve(&mut conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_then_mount_roundtrip() {
        let dir = tempdir().unwrap();
        let service = Service::new(dir.path());
        service.create("orders", 1).unwrap();
        assert!(service.mounts().get("orders").is_some());

        service.unmount("orders").unwrap();
        assert!(service.mounts().get("orders").is_none());

        service.mount("orders", false).unwrap();
        assert!(service.mounts().get("orders").is_some());
    }
}
