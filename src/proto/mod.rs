//! The SLINGDB binary protocol: a fixed 8-byte packet header (`verb`, body
//! `size`) followed by a verb-specific body, exchanged after an HTTP
//! `Upgrade` handshake switches a connection out of plain HTTP.

pub mod upgrade;
pub mod wire;

pub use wire::{Mode, Next2Request, PacketHeader, RecInfo, ResultCode, Verb};
