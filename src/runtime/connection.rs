//! Connection registry for accepted TCP connections.
//!
//! A connection is `Open` while it sits in the registry. Removing it is the
//! `Closed` transition: the value is consumed by [`Connection::close`] and
//! its handle released, so a closed connection can't be polled again.

use crate::runtime::poller::Source;
use mio::net::TcpStream;
use mio::Token;
use slab::Slab;
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    fd: RawFd,
}

impl Connection {
    /// Wrap an accepted, non-blocking stream.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let fd = stream.as_raw_fd();
        Self { stream, peer, fd }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// OS handle id of the socket.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Read once into `buf`. `Ok(0)` means the peer closed its side.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    /// Send all of `data`, or fail.
    ///
    /// The stream is non-blocking, so a full socket buffer surfaces as
    /// `WouldBlock` instead of a partial send.
    pub fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }

    /// Shut down both directions and release the handle.
    ///
    /// The handle is released even if shutdown fails; the shutdown error is
    /// returned for logging.
    pub fn close(self) -> io::Result<()> {
        let result = match self.stream.shutdown(Shutdown::Both) {
            // Peer already gone
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        };
        drop(self.stream);
        result
    }
}

/// Live connections in acceptance order.
///
/// Slab keys double as poller tokens. A handle appears at most once.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    /// Tokens in acceptance order.
    order: Vec<Token>,
    fds: HashSet<RawFd>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Slab::new(),
            order: Vec::new(),
            fds: HashSet::new(),
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Hands the connection back if its handle is already registered.
    pub fn insert(&mut self, conn: Connection) -> Result<Token, Connection> {
        if !self.fds.insert(conn.fd()) {
            return Err(conn);
        }
        let token = Token(self.connections.insert(conn));
        self.order.push(token);
        Ok(token)
    }

    pub fn get(&self, token: Token) -> Option<&Connection> {
        self.connections.get(token.0)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.get_mut(token.0)
    }

    /// Remove a connection without closing it.
    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        let conn = self.connections.try_remove(token.0)?;
        self.fds.remove(&conn.fd());
        self.order.retain(|t| *t != token);
        Some(conn)
    }

    /// Evict and close a connection.
    ///
    /// Returns `None` if the token is not live, otherwise the shutdown
    /// result. The connection is gone from the registry either way.
    pub fn close(&mut self, token: Token) -> Option<io::Result<()>> {
        self.remove(token).map(Connection::close)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains(token.0)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Poller sources for every live connection, in acceptance order.
    pub fn sources(&self) -> Vec<Source> {
        self.order
            .iter()
            .map(|token| Source::new(self.connections[token.0].fd(), *token))
            .collect()
    }

    /// Poller source for one live connection.
    pub fn source(&self, token: Token) -> Option<Source> {
        self.get(token).map(|conn| Source::new(conn.fd(), token))
    }

    /// Tokens in acceptance order.
    #[cfg(test)]
    pub fn tokens(&self) -> &[Token] {
        &self.order
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
