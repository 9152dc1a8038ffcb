//! Ack protocol handler.
//!
//! Called by the event loop with the bytes of each receive. Holds no
//! per-connection state: the decision to acknowledge depends only on how
//! many bytes the current pass received.

use super::sanitize::sanitize;
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use tracing::trace;

/// Acknowledgment frame sent after a pass that received data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckFrame {
    /// `Ack\n`
    #[default]
    Plain,
    /// `Ack\n\0`, the frame including its string terminator.
    NulTerminated,
}

impl AckFrame {
    pub fn from_config(ack_nul: bool) -> Self {
        if ack_nul {
            AckFrame::NulTerminated
        } else {
            AckFrame::Plain
        }
    }

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            AckFrame::Plain => b"Ack\n",
            AckFrame::NulTerminated => b"Ack\n\0",
        }
    }
}

/// Writes sanitized input to the echo sink and decides on acknowledgments.
pub struct AckHandler {
    sink: Box<dyn Write + Send>,
    frame: AckFrame,
}

impl AckHandler {
    pub fn new(sink: Box<dyn Write + Send>, frame: AckFrame) -> Self {
        Self { sink, frame }
    }

    /// Sanitize one received chunk in place and forward it to the sink.
    ///
    /// The sink is flushed after every chunk so output appears as it arrives.
    pub fn on_data(&mut self, fd: RawFd, data: &mut [u8]) -> io::Result<()> {
        trace!(fd, len = data.len(), "Received data");
        sanitize(data);
        self.sink.write_all(data)?;
        self.sink.flush()
    }

    /// Whether a pass that received `received` bytes is acknowledged.
    pub fn should_ack(&self, received: usize) -> bool {
        received > 0
    }

    pub fn frame(&self) -> AckFrame {
        self.frame
    }
}
