//! Linux `epoll` event-table backend.
//!
//! Registrations are persistent: a connection is added once on accept and
//! removed once on close, so registration cost is paid once per connection
//! rather than once per tick. The table is level-triggered, which keeps the
//! "currently readable / currently writable" meaning of each query.
//!
//! Every handle is registered with the superset interest
//! `EPOLLIN | EPOLLOUT | EPOLLPRI`. A query is one `epoll_wait` over the
//! whole table; the returned bitmasks are then filtered for read or write
//! readiness and mapped back to tokens.

use super::{timeout_ms, Poller, Source};
use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLLPRI, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL,
};
use mio::Token;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

const INTEREST: u32 = (EPOLLIN | EPOLLOUT | EPOLLPRI) as u32;
const READ_READY: u32 = (EPOLLIN | EPOLLPRI | EPOLLERR | EPOLLHUP) as u32;
const WRITE_READY: u32 = EPOLLOUT as u32;

pub struct EpollPoller {
    /// Closed on drop.
    epoll: OwnedFd,
    /// Reusable buffer for `epoll_wait`, sized to the table on each query.
    events: Vec<epoll_event>,
    /// Handle -> token, for translating results.
    tokens: HashMap<RawFd, Token>,
    /// Token -> handle.
    handles: HashMap<Token, RawFd>,
}

impl EpollPoller {
    /// Create the event table.
    ///
    /// Failure here is how backend selection learns the platform can't
    /// provide one.
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, result checked below.
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            // SAFETY: fd is a freshly created descriptor owned by nobody else.
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            events: Vec::new(),
            tokens: HashMap::new(),
            handles: HashMap::new(),
        })
    }

    /// Token a handle was registered under.
    #[cfg(test)]
    pub fn token_of(&self, fd: RawFd) -> Option<Token> {
        self.tokens.get(&fd).copied()
    }

    /// Handle registered under a token.
    #[cfg(test)]
    pub fn handle_of(&self, token: Token) -> Option<RawFd> {
        self.handles.get(&token).copied()
    }

    fn poll(&mut self, timeout: Duration, ready_mask: u32) -> io::Result<Vec<Token>> {
        let capacity = self.tokens.len().max(1);
        self.events.clear();
        self.events.resize(capacity, epoll_event { events: 0, u64: 0 });

        // SAFETY: events holds `capacity` initialized entries for the kernel
        // to overwrite.
        let n = unsafe {
            epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                capacity.min(libc::c_int::MAX as usize) as libc::c_int,
                timeout_ms(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        self.events.truncate(n as usize);

        let mut ready = Vec::with_capacity(self.events.len());
        for event in &self.events {
            let (bits, fd) = (event.events, event.u64 as RawFd);
            if bits & ready_mask == 0 {
                continue;
            }
            // A handle missing from the map was unregistered; drop it.
            if let Some(token) = self.tokens.get(&fd) {
                ready.push(*token);
            }
        }
        Ok(ready)
    }
}

impl Poller for EpollPoller {
    fn register(&mut self, sources: &[Source]) -> io::Result<()> {
        for source in sources {
            if self.tokens.contains_key(&source.fd) || self.handles.contains_key(&source.token) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("fd {} is already registered", source.fd),
                ));
            }

            let mut event = epoll_event {
                events: INTEREST,
                u64: source.fd as u64,
            };
            // SAFETY: event is a valid, initialized epoll_event on the stack.
            let rc = unsafe {
                epoll_ctl(
                    self.epoll.as_raw_fd(),
                    EPOLL_CTL_ADD,
                    source.fd,
                    &mut event,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }

            self.tokens.insert(source.fd, source.token);
            self.handles.insert(source.token, source.fd);
        }
        Ok(())
    }

    fn unregister(&mut self, sources: &[Source]) -> io::Result<()> {
        for source in sources {
            let Some(token) = self.tokens.remove(&source.fd) else {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("fd {} is not registered", source.fd),
                ));
            };
            self.handles.remove(&token);

            // SAFETY: EPOLL_CTL_DEL ignores the event argument.
            let rc = unsafe {
                epoll_ctl(
                    self.epoll.as_raw_fd(),
                    EPOLL_CTL_DEL,
                    source.fd,
                    std::ptr::null_mut(),
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn poll_readable(&mut self, timeout: Duration) -> io::Result<Vec<Token>> {
        self.poll(timeout, READ_READY)
    }

    fn poll_writable(&mut self, timeout: Duration) -> io::Result<Vec<Token>> {
        self.poll(timeout, WRITE_READY)
    }

    fn len(&self) -> usize {
        self.tokens.len()
    }

    fn keeps_registrations(&self) -> bool {
        true
    }
}
