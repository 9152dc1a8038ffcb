//! Shutdown requests.
//!
//! The loop has one cancellation token with two inputs: process signals
//! (through the signal shim) and an in-process [`ShutdownHandle`]. Both are
//! registered with the poller, so either wakes a blocked poll, and both are
//! checked by the loop between polls.

use crate::runtime::error::{Op, ServerError};
use crate::runtime::poller::Poller;
use crate::runtime::signal;
use mio::{Interest, Token, Waker};
use signal_hook_mio::v1_0::Signals;
use std::io;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);
pub const WAKE_TOKEN: Token = Token(usize::MAX - 2);

/// Why the loop is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(c_int),
    Requested,
}

/// Stops a running server from another thread.
#[allow(dead_code)]
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

#[allow(dead_code)]
impl ShutdownHandle {
    /// Request shutdown and wake the loop if it is blocked in poll.
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::SeqCst);
        self.waker.wake()
    }
}

pub struct ShutdownToken {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
    signals: Option<Signals>,
}

impl ShutdownToken {
    pub fn new(poller: &mut Poller) -> Result<Self, ServerError> {
        let waker = Waker::new(poller.registry(), WAKE_TOKEN)
            .map_err(|e| ServerError::io(Op::Register, e))?;
        poller.claim(WAKE_TOKEN)?;

        Ok(Self {
            requested: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(waker),
            signals: None,
        })
    }

    /// Start treating `signals` as shutdown requests.
    pub fn watch_signals(
        &mut self,
        poller: &mut Poller,
        signals: &[c_int],
    ) -> Result<(), ServerError> {
        if let Some(mut previous) = self.signals.take() {
            poller.deregister(&mut previous, SIGNAL_TOKEN)?;
        }

        let mut source = signal::install(signals)?;
        poller.register(&mut source, SIGNAL_TOKEN, Interest::READABLE)?;
        self.signals = Some(source);
        Ok(())
    }

    #[allow(dead_code)]
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            requested: Arc::clone(&self.requested),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn owns(token: Token) -> bool {
        token == SIGNAL_TOKEN || token == WAKE_TOKEN
    }

    /// Return the pending shutdown request, if any.
    ///
    /// Drains every pending signal; the first one is reported.
    pub fn check(&mut self) -> Option<ShutdownReason> {
        if let Some(signals) = self.signals.as_mut() {
            let mut first = None;
            for sig in signals.pending() {
                first.get_or_insert(sig);
            }
            if let Some(sig) = first {
                return Some(ShutdownReason::Signal(sig));
            }
        }

        if self.requested.load(Ordering::SeqCst) {
            return Some(ShutdownReason::Requested);
        }

        None
    }
}
