//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS. Connections are registered for read and write readiness; mio
//! registrations are edge-triggered, so every readable event drains the
//! socket until it would block.
//!
//! ## Passes
//!
//! One event for one connection is one pass. The pass reads everything
//! available, then answers with one acknowledgment if it read anything.
//! The byte count lives on the stack of the pass and is never shared with
//! another connection or another event.
//!
//! ## Closing
//!
//! A connection is closed when its pass reads end-of-stream without any
//! data, when the peer resets, or when the event carries an error. Data
//! followed by end-of-stream is acknowledged first and closed at the end of
//! the same pass. Closing deregisters, then closes the descriptor; either
//! failing is fatal.

use crate::config::BUFFER_SIZE;
use crate::protocols::ack::{AckFrame, AckHandler};
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::error::{classify, IoClass, Op, ServerError};
use crate::runtime::listener::create_listener;
use crate::runtime::poller::{EventBatch, PollOutcome, Poller, Readiness};
use crate::runtime::shutdown::{ShutdownHandle, ShutdownReason, ShutdownToken};
use crate::runtime::signal;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::raw::c_int;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Event loop settings that are not fixed constants.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Maximum readiness events handled per poll.
    pub batch_size: usize,
    /// Acknowledgment frame sent after each pass with data.
    pub ack: AckFrame,
}

/// Counters kept by the loop and reported at shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub accepted: u64,
    pub closed: u64,
    pub resets: u64,
    pub acks_sent: u64,
    pub bytes_received: u64,
}

/// Result of one poll and the dispatch of its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Continue,
    Shutdown(ShutdownReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// End-of-stream from the peer.
    PeerClosed,
    /// Reset or abort from the peer.
    PeerReset,
    /// Error readiness on the socket.
    SocketError,
}

/// How draining a readable socket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    WouldBlock,
    PeerClosed,
    PeerReset,
}

/// How sending owed acknowledgments ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteEnd {
    /// Nothing left to send, or the socket is full; resume on write readiness.
    Idle,
    PeerReset,
}

/// Single-threaded ack server.
pub struct Server {
    poller: Poller,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionRegistry,
    shutdown: ShutdownToken,
    handler: AckHandler,
    batch: EventBatch,
    /// Scratch buffer shared by every receive.
    buf: Vec<u8>,
    stats: LoopStats,
}

impl Server {
    /// Set up the listener and register it. Received bytes go to `sink`.
    pub fn bind(
        addr: SocketAddr,
        backlog: i32,
        options: ServerOptions,
        sink: Box<dyn Write + Send>,
    ) -> Result<Self, ServerError> {
        let mut poller = Poller::new(options.batch_size)?;

        let mut listener = create_listener(addr, backlog)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::io(Op::Bind, e))?;
        poller.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let shutdown = ShutdownToken::new(&mut poller)?;

        info!(
            addr = %local_addr,
            backlog,
            batch_size = options.batch_size,
            ack = ?options.ack,
            "Listening"
        );

        Ok(Self {
            poller,
            listener,
            local_addr,
            connections: ConnectionRegistry::with_capacity(options.batch_size),
            shutdown,
            handler: AckHandler::new(sink, options.ack),
            batch: EventBatch::with_capacity(options.batch_size),
            buf: vec![0u8; BUFFER_SIZE],
            stats: LoopStats::default(),
        })
    }

    /// Treat delivery of any of `signals` as a shutdown request.
    pub fn watch_signals(&mut self, signals: &[c_int]) -> Result<(), ServerError> {
        self.shutdown.watch_signals(&mut self.poller, signals)
    }

    #[allow(dead_code)]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.handle()
    }

    #[allow(dead_code)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[allow(dead_code)]
    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    #[allow(dead_code)]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Serve until a shutdown request, then run the shutdown path.
    pub fn run(mut self) -> Result<LoopStats, ServerError> {
        loop {
            if let Turn::Shutdown(_) = self.turn(None)? {
                break;
            }
        }
        self.shut_down()
    }

    /// Wait once for readiness (`None` waits forever) and handle the batch.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<Turn, ServerError> {
        let mut batch = std::mem::take(&mut self.batch);
        let result = self.dispatch(&mut batch, timeout);
        self.batch = batch;
        result
    }

    fn dispatch(
        &mut self,
        batch: &mut EventBatch,
        timeout: Option<Duration>,
    ) -> Result<Turn, ServerError> {
        if self.poller.poll(batch, timeout)? == PollOutcome::Interrupted {
            trace!("Poll interrupted");
            return Ok(self.check_shutdown());
        }

        for ready in batch.iter() {
            match ready.token {
                LISTENER_TOKEN => self.accept_pending()?,
                token if ShutdownToken::owns(token) => {
                    if let Turn::Shutdown(reason) = self.check_shutdown() {
                        return Ok(Turn::Shutdown(reason));
                    }
                }
                token => self.handle_connection(token, *ready)?,
            }
        }

        Ok(Turn::Continue)
    }

    fn check_shutdown(&mut self) -> Turn {
        match self.shutdown.check() {
            Some(reason) => {
                match reason {
                    ShutdownReason::Signal(sig) => {
                        warn!(signal = signal::name(sig), signo = sig, "Signal received")
                    }
                    ShutdownReason::Requested => info!("Shutdown requested"),
                }
                Turn::Shutdown(reason)
            }
            None => Turn::Continue,
        }
    }

    /// Close the listener and stop. Open connections are abandoned.
    pub fn shut_down(mut self) -> Result<LoopStats, ServerError> {
        warn!(
            addr = %self.local_addr,
            connections = self.connections.len(),
            "Shutting down..."
        );

        self.poller.deregister(&mut self.listener, LISTENER_TOKEN)?;
        let Server {
            listener, stats, ..
        } = self;
        close_fd(listener.into_raw_fd())?;

        info!(
            accepted = stats.accepted,
            closed = stats.closed,
            resets = stats.resets,
            acks_sent = stats.acks_sent,
            bytes_received = stats.bytes_received,
            "Server stopped"
        );
        Ok(stats)
    }

    /// Accept until the listener would block.
    fn accept_pending(&mut self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.activate(stream, peer)?,
                Err(e) => match classify(&e) {
                    IoClass::WouldBlock => return Ok(()),
                    IoClass::Interrupted | IoClass::PeerReset => {
                        debug!(error = %e, "Accept retried");
                    }
                    IoClass::BadDescriptor | IoClass::Fatal => {
                        return Err(ServerError::io(Op::Accept, e));
                    }
                },
            }
        }
    }

    fn activate(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<(), ServerError> {
        SockRef::from(&stream)
            .set_nonblocking(true)
            .map_err(|e| ServerError::io(Op::SetNonBlocking, e))?;

        let token = self.connections.next_token();
        let mut conn = Connection::new(stream, peer);
        self.poller.register(
            &mut conn.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let fd = conn.fd;
        self.connections.insert(conn);
        self.stats.accepted += 1;

        debug!(token = token.0, fd, peer = %peer, "Accepted connection");
        Ok(())
    }

    fn handle_connection(&mut self, token: Token, ready: Readiness) -> Result<(), ServerError> {
        let Some(conn) = self.connections.get_mut(token) else {
            trace!(token = token.0, "Event for closed connection");
            return Ok(());
        };

        let mut received = 0;
        let mut peer_closed = false;

        if ready.readable {
            let (n, end) = drain(conn, &mut self.buf, &mut self.handler)?;
            received = n;
            self.stats.bytes_received += n as u64;

            match end {
                ReadEnd::WouldBlock => {}
                ReadEnd::PeerReset => return self.close(token, CloseReason::PeerReset),
                ReadEnd::PeerClosed if received == 0 => {
                    return self.close(token, CloseReason::PeerClosed);
                }
                ReadEnd::PeerClosed => peer_closed = true,
            }
        }

        if ready.error {
            return self.close(token, CloseReason::SocketError);
        }

        // Re-borrow after the close checks
        let Some(conn) = self.connections.get_mut(token) else {
            return Ok(());
        };

        if self.handler.should_ack(received) {
            conn.owe_ack();
        }

        if conn.ack_offset().is_some() && (ready.writable || received > 0) {
            let frame = self.handler.frame().as_bytes();
            if send_acks(conn, frame, &mut self.stats)? == WriteEnd::PeerReset {
                return self.close(token, CloseReason::PeerReset);
            }
        }

        if peer_closed {
            return self.close(token, CloseReason::PeerClosed);
        }

        Ok(())
    }

    /// Deregister and close a connection.
    fn close(&mut self, token: Token, reason: CloseReason) -> Result<(), ServerError> {
        let Some(mut conn) = self.connections.remove(token) else {
            return Ok(());
        };

        self.poller.deregister(&mut conn.stream, token)?;

        let Connection {
            stream, fd, peer, ..
        } = conn;
        close_fd(stream.into_raw_fd())?;

        self.stats.closed += 1;
        if reason == CloseReason::PeerReset {
            self.stats.resets += 1;
        }

        debug!(token = token.0, fd, peer = %peer, reason = ?reason, "Connection closed");
        Ok(())
    }

    #[cfg(test)]
    fn registrations(&self) -> usize {
        self.poller.len()
    }
}

/// Read until the socket would block, forwarding each chunk to the handler.
///
/// Returns the bytes read in this pass and how the pass ended.
fn drain(
    conn: &mut Connection,
    buf: &mut [u8],
    handler: &mut AckHandler,
) -> Result<(usize, ReadEnd), ServerError> {
    let mut received = 0;

    loop {
        match conn.stream.read(buf) {
            Ok(0) => return Ok((received, ReadEnd::PeerClosed)),
            Ok(n) => {
                handler
                    .on_data(conn.fd, &mut buf[..n])
                    .map_err(|e| ServerError::io(Op::EchoWrite, e))?;
                received += n;
            }
            Err(e) => match classify(&e) {
                IoClass::WouldBlock => return Ok((received, ReadEnd::WouldBlock)),
                IoClass::Interrupted => continue,
                IoClass::PeerReset => return Ok((received, ReadEnd::PeerReset)),
                IoClass::BadDescriptor | IoClass::Fatal => {
                    return Err(ServerError::io(Op::Recv, e));
                }
            },
        }
    }
}

/// Send owed acknowledgments until none are left or the socket is full.
fn send_acks(
    conn: &mut Connection,
    frame: &[u8],
    stats: &mut LoopStats,
) -> Result<WriteEnd, ServerError> {
    while let Some(written) = conn.ack_offset() {
        match conn.stream.write(&frame[written..]) {
            Ok(0) => {
                return Err(ServerError::io(
                    Op::Send,
                    io::Error::new(io::ErrorKind::WriteZero, "send returned 0"),
                ));
            }
            Ok(n) if written + n >= frame.len() => {
                conn.ack_sent();
                stats.acks_sent += 1;
            }
            Ok(n) => conn.ack_progress(written + n),
            Err(e) => match classify(&e) {
                IoClass::WouldBlock => return Ok(WriteEnd::Idle),
                IoClass::Interrupted => continue,
                IoClass::PeerReset => return Ok(WriteEnd::PeerReset),
                IoClass::BadDescriptor => {
                    // Closed underneath us; nothing to send to.
                    trace!(fd = conn.fd, "Send on closed descriptor ignored");
                    return Ok(WriteEnd::Idle);
                }
                IoClass::Fatal => return Err(ServerError::io(Op::Send, e)),
            },
        }
    }

    Ok(WriteEnd::Idle)
}

/// Close a descriptor released with `into_raw_fd`, surfacing failure.
fn close_fd(fd: RawFd) -> Result<(), ServerError> {
    // SAFETY: the caller gave up ownership of `fd` via `into_raw_fd`, so
    // nothing else will use or close it.
    if unsafe { libc::close(fd) } == -1 {
        return Err(ServerError::io(Op::Close, io::Error::last_os_error()));
    }
    Ok(())
}
