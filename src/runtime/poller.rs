//! Readiness multiplexer.
//!
//! Thin layer over `mio::Poll` (epoll on Linux, kqueue on macOS) that keeps
//! its own table of registered tokens, so a duplicate registration or a
//! deregistration of something never registered is caught as a fatal error
//! instead of being left to the OS.
//!
//! Readiness is copied out of `mio::Events` into an [`EventBatch`] so the
//! loop can register and deregister sources while walking the batch.

use crate::runtime::error::{Op, ServerError};
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};
use std::collections::HashSet;
use std::io;
use std::time::Duration;

/// Readiness reported for one token in one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
        }
    }
}

/// Ordered readiness produced by one poll. Reused across polls.
pub type EventBatch = Vec<Readiness>;

/// Result of one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The batch holds the ready tokens (possibly none on timeout).
    Ready,
    /// The wait was interrupted by a signal before anything was ready.
    Interrupted,
}

pub struct Poller {
    poll: Poll,
    events: Events,
    registered: HashSet<Token>,
}

impl Poller {
    /// Create a poller returning at most `capacity` events per wait.
    pub fn new(capacity: usize) -> Result<Self, ServerError> {
        let poll = Poll::new().map_err(|e| ServerError::io(Op::PollCreate, e))?;
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            registered: HashSet::new(),
        })
    }

    /// Registry for sources that register themselves (e.g. `mio::Waker`).
    ///
    /// Tokens used this way must be claimed with [`Poller::claim`].
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Record a token registered directly through [`Poller::registry`].
    pub fn claim(&mut self, token: Token) -> Result<(), ServerError> {
        if !self.registered.insert(token) {
            return Err(already_registered(token));
        }
        Ok(())
    }

    pub fn register<S>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), ServerError>
    where
        S: Source + ?Sized,
    {
        if self.registered.contains(&token) {
            return Err(already_registered(token));
        }
        self.poll
            .registry()
            .register(source, token, interest)
            .map_err(|e| ServerError::io(Op::Register, e))?;
        self.registered.insert(token);
        Ok(())
    }

    pub fn deregister<S>(&mut self, source: &mut S, token: Token) -> Result<(), ServerError>
    where
        S: Source + ?Sized,
    {
        if !self.registered.remove(&token) {
            return Err(ServerError::io(
                Op::Deregister,
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("token {} is not registered", token.0),
                ),
            ));
        }
        self.poll
            .registry()
            .deregister(source)
            .map_err(|e| ServerError::io(Op::Deregister, e))
    }

    #[allow(dead_code)]
    pub fn is_registered(&self, token: Token) -> bool {
        self.registered.contains(&token)
    }

    /// Number of live registrations.
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.registered.len()
    }

    /// Wait for readiness and copy it into `batch`.
    ///
    /// `None` waits forever. `batch` is cleared first in every case.
    pub fn poll(
        &mut self,
        batch: &mut EventBatch,
        timeout: Option<Duration>,
    ) -> Result<PollOutcome, ServerError> {
        batch.clear();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(PollOutcome::Interrupted);
            }
            Err(e) => return Err(ServerError::io(Op::PollWait, e)),
        }

        batch.extend(self.events.iter().map(Readiness::from_event));
        Ok(PollOutcome::Ready)
    }
}

fn already_registered(token: Token) -> ServerError {
    ServerError::io(
        Op::Register,
        io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("token {} is already registered", token.0),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use mio::Waker;
    use std::io::Write;

    fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_register_and_deregister() {
        let mut poller = Poller::new(8).unwrap();
        let mut l = listener();

        poller.register(&mut l, Token(1), Interest::READABLE).unwrap();
        assert!(poller.is_registered(Token(1)));
        assert_eq!(poller.len(), 1);

        poller.deregister(&mut l, Token(1)).unwrap();
        assert!(!poller.is_registered(Token(1)));
        assert_eq!(poller.len(), 0);
    }

    #[test]
    fn test_duplicate_registration_is_fatal() {
        let mut poller = Poller::new(8).unwrap();
        let mut a = listener();
        let mut b = listener();

        poller.register(&mut a, Token(1), Interest::READABLE).unwrap();
        let err = poller
            .register(&mut b, Token(1), Interest::READABLE)
            .unwrap_err();
        assert_eq!(err.op(), Op::Register);

        // The failed attempt left the earlier registration alone.
        assert!(poller.is_registered(Token(1)));
        assert_eq!(poller.len(), 1);
    }

    #[test]
    fn test_deregister_unknown_is_fatal() {
        let mut poller = Poller::new(8).unwrap();
        let mut l = listener();

        let err = poller.deregister(&mut l, Token(9)).unwrap_err();
        assert_eq!(err.op(), Op::Deregister);
    }

    #[test]
    fn test_poll_timeout_yields_empty_batch() {
        let mut poller = Poller::new(8).unwrap();
        let mut batch = vec![Readiness {
            token: Token(42),
            readable: true,
            writable: false,
            error: false,
        }];

        let outcome = poller
            .poll(&mut batch, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(outcome, PollOutcome::Ready);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_poll_reports_readiness() {
        let mut poller = Poller::new(8).unwrap();
        let mut l = listener();
        let addr = l.local_addr().unwrap();
        poller.register(&mut l, Token(0), Interest::READABLE).unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        let mut batch = EventBatch::new();
        let mut seen = false;
        for _ in 0..50 {
            poller
                .poll(&mut batch, Some(Duration::from_millis(100)))
                .unwrap();
            if batch.iter().any(|r| r.token == Token(0) && r.readable) {
                seen = true;
                break;
            }
        }
        assert!(seen);

        let (mut stream, _) = l.accept().unwrap();
        poller
            .register(
                &mut stream,
                Token(1),
                Interest::READABLE | Interest::WRITABLE,
            )
            .unwrap();
        poller
            .poll(&mut batch, Some(Duration::from_millis(500)))
            .unwrap();
        let conn = batch.iter().find(|r| r.token == Token(1)).unwrap();
        assert!(conn.writable);
    }

    #[test]
    fn test_waker_claim() {
        let mut poller = Poller::new(8).unwrap();
        let waker = Waker::new(poller.registry(), Token(7)).unwrap();
        poller.claim(Token(7)).unwrap();
        assert!(poller.claim(Token(7)).is_err());

        waker.wake().unwrap();
        let mut batch = EventBatch::new();
        poller
            .poll(&mut batch, Some(Duration::from_millis(500)))
            .unwrap();
        assert!(batch.iter().any(|r| r.token == Token(7)));
    }
}
