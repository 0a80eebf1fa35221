//! Completion event multiplexer.
//!
//! One level-triggered epoll set per endpoint. Listener sockets and
//! completion channels are registered under a [`Source`] packed into the
//! epoll data word; `wait` returns the sources that fired.

use crate::error::{EndpointError, EndpointResult};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::collections::HashSet;
use std::fmt;
use std::os::fd::AsFd;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const TAG_SHIFT: u32 = 56;
const TAG_LISTENER: u64 = 1;
const TAG_CONNECTION: u64 = 2;
const ID_MASK: u64 = (1 << TAG_SHIFT) - 1;
const MAX_EVENTS: usize = 64;

/// Identifies a connection within its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Identifies a listener within its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Something registered with the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// A rendezvous listener socket; readable means a peer is waiting.
    Listener(ListenerId),
    /// A connection's completion channel; readable means completions pending.
    Connection(ConnectionId),
}

impl Source {
    /// Pack into an epoll data word.
    pub fn token(self) -> u64 {
        match self {
            Source::Listener(ListenerId(id)) => (TAG_LISTENER << TAG_SHIFT) | (id & ID_MASK),
            Source::Connection(ConnectionId(id)) => (TAG_CONNECTION << TAG_SHIFT) | (id & ID_MASK),
        }
    }

    /// Unpack an epoll data word.
    pub fn from_token(token: u64) -> Option<Self> {
        let id = token & ID_MASK;
        match token >> TAG_SHIFT {
            TAG_LISTENER => Some(Source::Listener(ListenerId(id))),
            TAG_CONNECTION => Some(Source::Connection(ConnectionId(id))),
            _ => None,
        }
    }
}

/// Endpoint-wide readiness multiplexer.
pub struct Multiplexer {
    epoll: Epoll,
    registered: HashSet<Source>,
    events: Vec<EpollEvent>,
}

impl Multiplexer {
    /// Create an empty epoll set.
    pub fn new() -> EndpointResult<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|source| EndpointError::Multiplexer { source })?;
        Ok(Self {
            epoll,
            registered: HashSet::new(),
            events: vec![EpollEvent::empty(); MAX_EVENTS],
        })
    }

    /// Watch `fd` for readability under `source`.
    ///
    /// # Errors
    ///
    /// `EndpointError::Multiplexer` if the descriptor cannot be added.
    pub fn register<F: AsFd>(&mut self, fd: F, source: Source) -> EndpointResult<()> {
        self.epoll
            .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, source.token()))
            .map_err(|source| EndpointError::Multiplexer { source })?;
        self.registered.insert(source);
        debug!(?source, "Source registered");
        Ok(())
    }

    /// Stop watching `fd`.
    pub fn deregister<F: AsFd>(&mut self, fd: F, source: Source) -> EndpointResult<()> {
        self.registered.remove(&source);
        match self.epoll.delete(fd) {
            Ok(()) | Err(Errno::ENOENT) => {
                debug!(?source, "Source deregistered");
                Ok(())
            }
            Err(source) => Err(EndpointError::Multiplexer { source }),
        }
    }

    /// Whether `source` is currently registered.
    pub fn is_registered(&self, source: Source) -> bool {
        self.registered.contains(&source)
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.registered.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Wait for readiness.
    ///
    /// `None` blocks until something fires; `Some(d)` returns an empty list
    /// after `d`. Signal interruptions are retried with the remaining time.
    ///
    /// # Errors
    ///
    /// `EndpointError::Multiplexer` if epoll fails for any other reason.
    pub fn wait(&mut self, timeout: Option<Duration>) -> EndpointResult<Vec<Source>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let chunk = match deadline {
                None => EpollTimeout::NONE,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let ms = remaining
                        .as_nanos()
                        .div_ceil(1_000_000)
                        .min(u128::from(u16::MAX)) as u16;
                    EpollTimeout::from(ms)
                }
            };

            match self.epoll.wait(&mut self.events, chunk) {
                Ok(0) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Ok(Vec::new());
                    }
                }
                Ok(n) => {
                    let fired: Vec<Source> = self.events[..n]
                        .iter()
                        .filter_map(|ev| Source::from_token(ev.data()))
                        .collect();
                    trace!(count = fired.len(), "Sources fired");
                    return Ok(fired);
                }
                Err(Errno::EINTR) => continue,
                Err(source) => return Err(EndpointError::Multiplexer { source }),
            }
        }
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("registered", &self.registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::eventfd::{EfdFlags, EventFd};

    fn eventfd() -> EventFd {
        EventFd::from_flags(EfdFlags::EFD_NONBLOCK).unwrap()
    }

    #[test]
    fn tokens_roundtrip() {
        for source in [
            Source::Listener(ListenerId(0)),
            Source::Listener(ListenerId(42)),
            Source::Connection(ConnectionId(7)),
            Source::Connection(ConnectionId(ID_MASK)),
        ] {
            assert_eq!(Source::from_token(source.token()), Some(source));
        }
        assert_eq!(Source::from_token(0), None);
    }

    #[test]
    fn timeout_returns_empty() {
        let mut mux = Multiplexer::new().unwrap();
        let fd = eventfd();
        mux.register(&fd, Source::Connection(ConnectionId(1))).unwrap();

        let start = Instant::now();
        let fired = mux.wait(Some(Duration::from_millis(30))).unwrap();
        assert!(fired.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn pending_event_returns_immediately_and_stays_level() {
        let mut mux = Multiplexer::new().unwrap();
        let a = eventfd();
        let b = eventfd();
        mux.register(&a, Source::Connection(ConnectionId(1))).unwrap();
        mux.register(&b, Source::Listener(ListenerId(2))).unwrap();

        b.write(1).unwrap();
        for _ in 0..2 {
            let fired = mux.wait(None).unwrap();
            assert_eq!(fired, vec![Source::Listener(ListenerId(2))]);
        }

        b.read().unwrap();
        assert!(mux.wait(Some(Duration::ZERO)).unwrap().is_empty());
    }

    #[test]
    fn deregistered_source_is_silent() {
        let mut mux = Multiplexer::new().unwrap();
        let fd = eventfd();
        let source = Source::Connection(ConnectionId(3));
        mux.register(&fd, source).unwrap();
        assert!(mux.is_registered(source));

        mux.deregister(&fd, source).unwrap();
        assert!(mux.is_empty());
        fd.write(1).unwrap();
        assert!(mux.wait(Some(Duration::from_millis(5))).unwrap().is_empty());
    }

    #[test]
    fn duplicate_registration_is_multiplexer_error() {
        let mut mux = Multiplexer::new().unwrap();
        let fd = eventfd();
        mux.register(&fd, Source::Connection(ConnectionId(4))).unwrap();

        let err = mux
            .register(&fd, Source::Connection(ConnectionId(5)))
            .unwrap_err();
        assert!(
            matches!(err, EndpointError::Multiplexer { source: Errno::EEXIST }),
            "{err}"
        );
        assert!(!mux.is_registered(Source::Connection(ConnectionId(5))));
    }
}
