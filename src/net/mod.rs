//! TCP transport: a single framed [connection::Connection] and the
//! [server::Server] that accepts and dispatches them to a worker pool.

pub mod connection;
pub mod server;

pub use connection::Connection;
pub use server::{Handler, Server};
