//! A single accepted TCP connection, framed with the binary protocol once the
//! HTTP `Upgrade` handshake has completed.

use std::{
    io::{Read, Write},
    net::TcpStream,
    time::Duration,
};

use crate::{
    err_at,
    proto::wire::{PacketHeader, Verb},
    Error, Result,
};

pub struct Connection {
    stream: TcpStream,
    peer: String,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Result<Connection> {
        let peer = err_at!(IOError, stream.peer_addr())
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "?".to_string());
        Ok(Connection { stream, peer })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Blocking reads past this timeout fail with [Error::Timeout], so a
    /// worker thread can never be wedged indefinitely by a dead client.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        err_at!(IOError, self.stream.set_read_timeout(timeout))
    }

    pub fn try_clone(&self) -> Result<TcpStream> {
        err_at!(IOError, self.stream.try_clone())
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Read one framed packet: an 8-byte header followed by `size` body
    /// bytes.
    pub fn read_packet(&mut self) -> Result<(Verb, Vec<u8>)> {
        let mut hdr_buf = [0u8; crate::proto::wire::HEADER_LEN];
        match self.stream.read_exact(&mut hdr_buf) {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return err_at!(Timeout, msg: "read timed out on {}", self.peer)
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return err_at!(Disconnected, msg: "{} closed the connection", self.peer)
            }
            Err(e) => return err_at!(IOError, Err(e)),
        }
        let header = PacketHeader::decode(&hdr_buf)?;

        let mut body = vec![0u8; header.size as usize];
        err_at!(IOError, self.stream.read_exact(&mut body))?;
        Ok((header.verb, body))
    }

    /// Write one framed packet.
    pub fn write_packet(&mut self, verb: Verb, body: &[u8]) -> Result<()> {
        let header = PacketHeader {
            verb,
            size: body.len() as u32,
        };
        err_at!(IOError, self.stream.write_all(&header.encode()))?;
        err_at!(IOError, self.stream.write_all(body))?;
        Ok(())
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}
