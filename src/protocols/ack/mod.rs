//! Ack protocol implementation.
//!
//! There is no framing on the inbound stream. Every readiness pass that
//! received at least one byte is answered with exactly one fixed frame:
//!
//! ```text
//! Client sends:  <any bytes>
//! Server sends:  Ack\n            (or Ack\n\0 with the NUL terminator enabled)
//! ```
//!
//! A pass that received nothing is never acknowledged. Received bytes are
//! copied to the echo sink (stdout in production) after control bytes are
//! replaced with `.`, so that arbitrary binary input cannot drive the
//! terminal.

pub mod handler;
pub mod sanitize;

pub use handler::{AckFrame, AckHandler};
