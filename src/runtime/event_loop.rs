//! Single-threaded ping/pong event loop.
//!
//! Readiness-based model: every tick polls, then performs non-blocking
//! accept/recv/send syscalls on whatever was reported ready.
//!
//! One tick runs four phases in order:
//! 1. accept at most one pending connection
//! 2. read once from every readable connection
//! 3. validate each payload, closing connections that sent anything but
//!    the request token
//! 4. send the reply to every validated connection that is writable
//!
//! Per-connection failures close that connection and nothing else. Each
//! phase builds a fresh collection for the next one instead of mutating the
//! collection it iterates.

use crate::config::Config;
use crate::protocols::ping::{decode, PingProtocol, Request};
use crate::runtime::poller::{BatchPoller, Poller, Source};
use crate::runtime::{Connection, ConnectionRegistry};
use mio::net::TcpListener;
use mio::Token;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

#[derive(Debug, Clone, Copy)]
enum Readiness {
    Readable,
    Writable,
}

pub struct EventLoop<P: Poller> {
    listener: TcpListener,
    /// Watches only the listener.
    listener_poller: BatchPoller,
    poller: P,
    registry: ConnectionRegistry,
    protocol: PingProtocol,
    /// Receive buffer; its length caps a single receive.
    buffer: Vec<u8>,
    timeout: Duration,
}

impl<P: Poller> EventLoop<P> {
    pub fn new(listener: TcpListener, poller: P, config: &Config) -> io::Result<Self> {
        let mut listener_poller = BatchPoller::new(1)?;
        listener_poller.register(&[Source::new(listener.as_raw_fd(), LISTENER_TOKEN)])?;

        Ok(Self {
            listener,
            listener_poller,
            poller,
            registry: ConnectionRegistry::new(),
            protocol: PingProtocol::new(config.request.as_str(), config.reply.as_bytes()),
            buffer: vec![0; config.buffer_size],
            timeout: config.poll_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg(test)]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn poller(&self) -> &P {
        &self.poller
    }

    /// Tick forever.
    ///
    /// Only returns if a poll call itself fails.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.tick()?;
        }
    }

    /// Run one full pass: accept, read, validate, write.
    pub fn tick(&mut self) -> io::Result<()> {
        self.accept()?;

        if self.registry.is_empty() {
            return Ok(());
        }

        let received = self.read()?;
        let eligible = self.validate(received);

        if eligible.is_empty() {
            return Ok(());
        }

        self.write(&eligible)
    }

    fn accept(&mut self) -> io::Result<()> {
        if self.listener_poller.poll_readable(self.timeout)?.is_empty() {
            return Ok(());
        }

        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                error!(error = %e, "Accept error");
                return Ok(());
            }
        };

        let conn = Connection::new(stream, peer);
        let fd = conn.fd();
        let token = match self.registry.insert(conn) {
            Ok(token) => token,
            Err(conn) => {
                warn!(fd, "{}: Handle already registered, dropping connection", peer);
                if let Err(e) = conn.close() {
                    debug!(fd, error = %e, "Shutdown failed");
                }
                return Ok(());
            }
        };

        if self.poller.keeps_registrations() {
            if let Some(source) = self.registry.source(token) {
                if let Err(e) = self.poller.register(&[source]) {
                    warn!(fd, error = %e, "{}: Failed to register connection", peer);
                    if let Some(Err(e)) = self.registry.close(token) {
                        debug!(token = token.0, error = %e, "Shutdown failed");
                    }
                    return Ok(());
                }
            }
        }

        info!(fd, connections = self.registry.len(), "{}: Accepted connection", peer);
        Ok(())
    }

    fn read(&mut self) -> io::Result<Vec<(Token, String)>> {
        let sources = self.registry.sources();
        let readable = self.poll_set(&sources, Readiness::Readable)?;

        let mut received = Vec::with_capacity(readable.len());
        for token in readable {
            let Some(conn) = self.registry.get_mut(token) else {
                continue;
            };
            let peer = conn.peer();

            match conn.recv(&mut self.buffer) {
                Ok(n) => received.push((token, decode(&self.buffer[..n]))),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    info!("{}: An error has occurred: {}", peer, e);
                    self.close(token);
                }
            }
        }

        Ok(received)
    }

    fn validate(&mut self, received: Vec<(Token, String)>) -> Vec<Token> {
        let mut eligible = Vec::with_capacity(received.len());

        for (token, payload) in received {
            let Some(peer) = self.registry.get(token).map(Connection::peer) else {
                continue;
            };
            info!("{}: Received message: {}", peer, payload);

            match self.protocol.check(&payload) {
                Request::Ping => eligible.push(token),
                Request::Invalid => {
                    info!("{}: Invalid message. Closing connection.", peer);
                    self.close(token);
                }
            }
        }

        eligible
    }

    fn write(&mut self, eligible: &[Token]) -> io::Result<()> {
        let sources: Vec<Source> = eligible
            .iter()
            .filter_map(|token| self.registry.source(*token))
            .collect();
        let writable = self.poll_set(&sources, Readiness::Writable)?;

        for token in writable {
            let Some(conn) = self.registry.get_mut(token) else {
                continue;
            };
            let peer = conn.peer();

            info!("{}: Sending back {}", peer, self.protocol.reply_text());
            if let Err(e) = conn.send(self.protocol.reply()) {
                info!("{}: An error has occurred: {}", peer, e);
                self.close(token);
            }
        }

        Ok(())
    }

    /// Poll `sources` for one kind of readiness.
    ///
    /// Tick-scoped backends get the sources registered around the query.
    /// Persistent backends already watch every connection, so their result
    /// is narrowed to `sources`.
    fn poll_set(&mut self, sources: &[Source], readiness: Readiness) -> io::Result<Vec<Token>> {
        let scoped = !self.poller.keeps_registrations();

        if scoped {
            self.poller.register(sources)?;
        }
        let result = match readiness {
            Readiness::Readable => self.poller.poll_readable(self.timeout),
            Readiness::Writable => self.poller.poll_writable(self.timeout),
        };
        if scoped {
            self.poller.unregister(sources)?;
        }

        let ready = result?;
        if scoped {
            return Ok(ready);
        }

        let wanted: HashSet<Token> = sources.iter().map(|s| s.token).collect();
        Ok(ready.into_iter().filter(|t| wanted.contains(t)).collect())
    }

    /// Close and evict a connection.
    ///
    /// Unregistering, shutdown and eviction are each attempted regardless of
    /// earlier failures.
    fn close(&mut self, token: Token) {
        if !self.registry.contains(token) {
            return;
        }

        if self.poller.keeps_registrations() {
            if let Some(source) = self.registry.source(token) {
                if let Err(e) = self.poller.unregister(&[source]) {
                    warn!(fd = source.fd, error = %e, "Failed to unregister connection");
                }
            }
        }

        match self.registry.close(token) {
            Some(Err(e)) => debug!(token = token.0, error = %e, "Shutdown failed"),
            Some(Ok(())) => {}
            None => return,
        }
        debug!(token = token.0, connections = self.registry.len(), "Connection closed");
    }
}

/// Create the non-blocking listening socket.
pub fn bind(config: &Config) -> io::Result<TcpListener> {
    let addr = config.listen;
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;

    Ok(TcpListener::from_std(socket.into()))
}
