//! Protocol implementations.
//!
//! The runtime owns the sockets; protocols only decide what to do with the
//! bytes a readiness pass produced.
//!
//! - `ack`: sanitize received bytes for display and acknowledge each burst

pub mod ack;
