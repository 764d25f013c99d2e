//! Blocking-socket TCP server with a fixed worker pool.
//!
//! `dbserver.h`'s `SocketServer` is built on an epoll reactor driving a
//! per-connection `IDLE → RECEIVE → PROCESS → SEND` state machine. This
//! redesigns that around blocking sockets: each worker thread owns one
//! connection at a time end to end, and a read timeout bounds how long a
//! dead client can occupy a worker — see the Design Notes for the tradeoff.

use std::{
    net::{TcpListener, TcpStream},
    sync::Arc,
    time::Duration,
};

use log::{info, warn};

use crate::{err_at, net::connection::Connection, util::thread::Pool, Result};

/// Handles one connection end to end: the `Upgrade` handshake plus the
/// framed-packet loop until the client disconnects.
pub trait Handler: Send + Sync {
    fn handle(&self, conn: Connection) -> Result<()>;
}

pub struct Server {
    listener: TcpListener,
    pool: Pool<Connection, ()>,
    read_timeout: Duration,
}

impl Server {
    /// Bind `addr` and spawn `workers` worker threads, each backed by
    /// `handler`.
    pub fn bind<H>(addr: &str, handler: Arc<H>, workers: usize, read_timeout: Duration) -> Result<Server>
    where
        H: Handler + 'static,
    {
        let listener = err_at!(IOError, TcpListener::bind(addr))?;
        let mut pool = Pool::new("slingdb-worker");
        pool.set_pool_size(workers.max(1));
        pool.spawn(move |rx| {
            let handler = Arc::clone(&handler);
            move || {
                for (conn, _reply) in rx.iter() {
                    if let Err(err) = handler.handle(conn) {
                        warn!("connection error: {}", err);
                    }
                }
            }
        });

        Ok(Server {
            listener,
            pool,
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        err_at!(IOError, self.listener.local_addr())
    }

    /// Accept connections forever, handing each to the worker pool. Returns
    /// only on a fatal accept error.
    pub fn serve(self) -> Result<()> {
        info!("listening on {:?}", self.listener.local_addr());
        for stream in self.listener.incoming() {
            let stream: TcpStream = match stream {
                Ok(s) => s,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    continue;
                }
            };
            if let Err(err) = self.dispatch(stream) {
                warn!("dispatch failed: {}", err);
            }
        }
        self.pool.close_wait().map(|_| ())
    }

    fn dispatch(&self, stream: TcpStream) -> Result<()> {
        let conn = Connection::new(stream)?;
        conn.set_read_timeout(Some(self.read_timeout))?;
        self.pool.post(conn)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use tempfile::tempdir;

    use crate::{
        client::Client,
        net::Server,
        proto::wire::Mode,
        service::{Service, SessionHandler},
    };

    /// Bind a real [Server] over loopback TCP, backed by a fresh [Service]
    /// with one mounted database named `orders`.
    fn spawn_server(dbdir: &std::path::Path) -> (std::net::SocketAddr, Service) {
        let mut service = Service::new(dbdir);
        service.create("orders", 1).unwrap();
        service.start_checkpoint_thread();

        let handler = Arc::new(SessionHandler::new(service.mounts(), service.dbdir().to_path_buf()));
        let server = Server::bind("127.0.0.1:0", handler, 4, Duration::from_secs(5)).unwrap();
        let addr = server.local_addr().unwrap();

        thread::spawn(move || {
            server.serve().ok();
        });

        (addr, service)
    }

    #[test]
    fn test_put_get_delete_over_the_wire() {
        let dir = tempdir().unwrap();
        let (addr, _service) = spawn_server(dir.path());

        let mut client = Client::connect(&format!("{}/orders", addr)).unwrap();

        let outcome = client.put(b"k1", 0, b"v1", Mode::Overwrite).unwrap();
        assert_eq!(outcome.version, 0);

        let rec = client.get(b"k1").unwrap().unwrap();
        assert_eq!(rec.value, b"v1");

        assert!(client.delete(b"k1").unwrap());
        assert!(client.get(b"k1").unwrap().is_none());
    }

    /// Durability across a restart: data written before a checkpoint-and-remount
    /// of the same `dbdir` is still visible afterward. This is the part of a
    /// kill/restart scenario that can be exercised without actually terminating
    /// the test process; the transparent-reconnect half of that scenario is
    /// covered by `Client::transact`'s retry-once logic in `client/mod.rs`.
    #[test]
    fn test_data_survives_checkpoint_and_remount() {
        let dir = tempdir().unwrap();
        let (addr, service) = spawn_server(dir.path());

        let mut client = Client::connect(&format!("{}/orders", addr)).unwrap();
        client.put(b"k1", 0, b"before-restart", Mode::Overwrite).unwrap();

        service.unmount("orders").unwrap();
        service.mount("orders", true).unwrap();

        // A fresh session picks up the remounted `Database`, recovered from disk,
        // rather than the in-memory instance the first client already held.
        let mut reconnected = Client::connect(&format!("{}/orders", addr)).unwrap();
        let rec = reconnected.get(b"k1").unwrap().unwrap();
        assert_eq!(rec.value, b"before-restart");
    }
}
