//! SLINGDB: a durable, append-only, content-addressable keyed record store,
//! with a fingerprint-indexed lookup layer and a compact binary network
//! protocol for multi-tenant access.
//!
//! The core is three tightly coupled layers:
//! - [record]: the on-disk, chunk-aligned record file format (`RecordWriter`/
//!   `RecordReader`/`RecordIndex`), independent of any network concern.
//! - [dbindex] + [database]: a file-mapped fingerprint hash table
//!   (`DatabaseIndex`) over one or more appended record shards, giving a
//!   live, mutable key/value [database::Database].
//! - [proto] + [net] + [service]: the binary wire protocol, the blocking-
//!   socket worker-pool server, and the multi-tenant mount table that
//!   exposes `Database` instances over the network.
//!
//! [client] is the corresponding client library.

pub mod client;
pub mod database;
pub mod dbindex;
pub mod error;
pub mod fingerprint;
pub mod hash;
pub mod net;
pub mod proto;
pub mod record;
pub mod service;
pub mod util;

pub use crate::error::{Error, Result};
