//! Append-only, chunk-aligned record file format with an embedded fingerprint
//! index: [header] the wire codec, [file] shared config/record types,
//! [writer] and [reader] for building and scanning a single file, [index] to
//! look records up by key once a file is closed and indexed, and [shards] for
//! a fixed sharded read-only view across several indexed files.

pub mod file;
pub mod header;
pub mod index;
pub mod reader;
pub mod shards;
pub mod writer;

pub use file::{Config, Record};
pub use header::{Compression, RecordType};
pub use index::RecordIndex;
pub use reader::RecordReader;
pub use shards::RecordDatabase;
pub use writer::RecordWriter;
