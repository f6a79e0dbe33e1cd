//! Batched `poll(2)` backend.
//!
//! Models a readiness primitive with a hard ceiling on handles per call.
//! The watch set is a flat list rebuilt by the caller every tick; polling
//! walks it in consecutive chunks of at most `batch_size` handles and
//! concatenates the ready subsets.
//!
//! ## Latency tradeoff
//!
//! Every chunk is polled with the full timeout, one after another. With N
//! chunks a single query can wait up to N x timeout. That is the price of
//! staying under the ceiling, and it is accepted: a zero timeout (the
//! default) makes every chunk a non-blocking check anyway.
//!
//! A chunk whose `poll(2)` is interrupted (`EINTR`) reports nothing for that
//! query; the remaining chunks are still polled and reported.

use super::{timeout_ms, Poller, Source};
use mio::Token;
use std::collections::HashSet;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLPRI;
const WRITE_EVENTS: libc::c_short = libc::POLLOUT;

/// Errors and hangups surface through the next receive.
const READ_READY: libc::c_short = READ_EVENTS | libc::POLLERR | libc::POLLHUP;
const WRITE_READY: libc::c_short = WRITE_EVENTS;

pub struct BatchPoller {
    batch_size: usize,
    sources: Vec<Source>,
    fds: HashSet<RawFd>,
    /// Scratch readiness set, refilled for every chunk.
    pollfds: Vec<libc::pollfd>,
}

impl BatchPoller {
    /// Create a poller that never passes more than `batch_size` handles to
    /// a single `poll(2)` call.
    pub fn new(batch_size: usize) -> io::Result<Self> {
        if batch_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "batch size must be greater than zero",
            ));
        }

        Ok(Self {
            batch_size,
            sources: Vec::new(),
            fds: HashSet::new(),
            pollfds: Vec::with_capacity(batch_size.min(1024)),
        })
    }

    /// Number of primitive calls one query costs.
    #[cfg(test)]
    pub fn batches(&self) -> usize {
        self.sources.len().div_ceil(self.batch_size)
    }

    fn poll_batches(
        &mut self,
        timeout: Duration,
        events: libc::c_short,
        ready_mask: libc::c_short,
    ) -> io::Result<Vec<Token>> {
        let timeout = timeout_ms(timeout);
        let mut ready = Vec::new();

        for batch in self.sources.chunks(self.batch_size) {
            self.pollfds.clear();
            self.pollfds.extend(batch.iter().map(|source| libc::pollfd {
                fd: source.fd,
                events,
                revents: 0,
            }));

            // SAFETY: pollfds holds exactly `len` initialized entries and
            // outlives the call.
            let n = unsafe {
                libc::poll(
                    self.pollfds.as_mut_ptr(),
                    self.pollfds.len() as libc::nfds_t,
                    timeout,
                )
            };

            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                continue;
            }

            ready.extend(
                self.pollfds
                    .iter()
                    .zip(batch)
                    .filter(|(pollfd, _)| pollfd.revents & ready_mask != 0)
                    .map(|(_, source)| source.token),
            );
        }

        Ok(ready)
    }
}

impl Poller for BatchPoller {
    fn register(&mut self, sources: &[Source]) -> io::Result<()> {
        for source in sources {
            if !self.fds.insert(source.fd) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("fd {} is already registered", source.fd),
                ));
            }
            self.sources.push(*source);
        }
        Ok(())
    }

    fn unregister(&mut self, sources: &[Source]) -> io::Result<()> {
        if let Some(missing) = sources.iter().find(|s| !self.fds.contains(&s.fd)) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("fd {} is not registered", missing.fd),
            ));
        }

        let removed: HashSet<RawFd> = sources.iter().map(|s| s.fd).collect();
        for fd in &removed {
            self.fds.remove(fd);
        }
        self.sources.retain(|s| !removed.contains(&s.fd));
        Ok(())
    }

    fn poll_readable(&mut self, timeout: Duration) -> io::Result<Vec<Token>> {
        self.poll_batches(timeout, READ_EVENTS, READ_READY)
    }

    fn poll_writable(&mut self, timeout: Duration) -> io::Result<Vec<Token>> {
        self.poll_batches(timeout, WRITE_EVENTS, WRITE_READY)
    }

    fn len(&self) -> usize {
        self.sources.len()
    }

    fn keeps_registrations(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    /// `count` socket pairs; the first of each pair is watched.
    fn pairs(count: usize) -> (Vec<(UnixStream, UnixStream)>, Vec<Source>) {
        let pairs: Vec<_> = (0..count).map(|_| UnixStream::pair().unwrap()).collect();
        let sources = pairs
            .iter()
            .enumerate()
            .map(|(i, (watched, _))| Source::new(watched.as_raw_fd(), Token(i)))
            .collect();
        (pairs, sources)
    }

    fn sorted(mut tokens: Vec<Token>) -> Vec<Token> {
        tokens.sort();
        tokens
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert_eq!(
            BatchPoller::new(0).err().unwrap().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_register_unregister_restores_len() {
        let (_pairs, sources) = pairs(5);
        let mut poller = BatchPoller::new(2).unwrap();

        poller.register(&sources[..1]).unwrap();
        assert_eq!(poller.len(), 1);

        poller.register(&sources[1..]).unwrap();
        assert_eq!(poller.len(), 5);
        assert_eq!(poller.batches(), 3);

        poller.unregister(&sources[1..]).unwrap();
        assert_eq!(poller.len(), 1);
        assert!(poller.poll_readable(Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn test_double_register_rejected() {
        let (_pairs, sources) = pairs(1);
        let mut poller = BatchPoller::new(4).unwrap();

        poller.register(&sources).unwrap();
        let err = poller.register(&sources).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(poller.len(), 1);
    }

    #[test]
    fn test_unregister_unknown_rejected() {
        let (_pairs, sources) = pairs(2);
        let mut poller = BatchPoller::new(4).unwrap();

        poller.register(&sources[..1]).unwrap();
        let err = poller.unregister(&sources).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        // Nothing was removed
        assert_eq!(poller.len(), 1);
    }

    #[test]
    fn test_poll_readable() {
        let (mut pairs, sources) = pairs(3);
        let mut poller = BatchPoller::new(4).unwrap();
        poller.register(&sources).unwrap();

        assert!(poller.poll_readable(Duration::ZERO).unwrap().is_empty());

        pairs[1].1.write_all(b"ping").unwrap();
        assert_eq!(poller.poll_readable(Duration::ZERO).unwrap(), vec![Token(1)]);
    }

    #[test]
    fn test_poll_writable() {
        let (_pairs, sources) = pairs(3);
        let mut poller = BatchPoller::new(2).unwrap();
        poller.register(&sources).unwrap();

        let writable = sorted(poller.poll_writable(Duration::ZERO).unwrap());
        assert_eq!(writable, vec![Token(0), Token(1), Token(2)]);
    }

    #[test]
    fn test_hangup_counts_as_readable() {
        let (mut pairs, sources) = pairs(2);
        let mut poller = BatchPoller::new(1).unwrap();
        poller.register(&sources).unwrap();

        let (_watched, peer) = pairs.remove(0);
        drop(peer);
        assert_eq!(poller.poll_readable(Duration::ZERO).unwrap(), vec![Token(0)]);
    }

    #[test]
    fn test_batches_match_single_call() {
        // 3 full batches of 4 plus a remainder of 2
        let (mut pairs, sources) = pairs(14);
        for i in [0, 3, 4, 7, 11, 12, 13] {
            pairs[i].1.write_all(b"x").unwrap();
        }

        let mut batched = BatchPoller::new(4).unwrap();
        let mut single = BatchPoller::new(sources.len()).unwrap();
        batched.register(&sources).unwrap();
        single.register(&sources).unwrap();
        assert_eq!(batched.batches(), 4);
        assert_eq!(single.batches(), 1);

        let expected = sorted(single.poll_readable(Duration::ZERO).unwrap());
        assert_eq!(expected.len(), 7);
        assert_eq!(sorted(batched.poll_readable(Duration::ZERO).unwrap()), expected);

        for batch_size in 1..=sources.len() {
            let mut poller = BatchPoller::new(batch_size).unwrap();
            poller.register(&sources).unwrap();
            assert_eq!(
                sorted(poller.poll_readable(Duration::ZERO).unwrap()),
                expected,
                "batch_size {batch_size}"
            );
            assert_eq!(
                sorted(poller.poll_writable(Duration::ZERO).unwrap()),
                sorted(single.poll_writable(Duration::ZERO).unwrap())
            );
        }
    }
}
