//! Single-threaded readiness runtime.
//!
//! Built on mio (epoll on Linux, kqueue on macOS):
//! - `listener`: listening socket setup
//! - `poller`: readiness multiplexer with its own registration table
//! - `connection`: per-connection state and the slab registry
//! - `event_loop`: the `Server`, which owns all of the above
//! - `signal` / `shutdown`: signals and in-process requests that stop the loop
//! - `error`: fatal errors and OS error classification

mod connection;
mod error;
mod event_loop;
mod listener;
mod poller;
mod shutdown;
mod signal;

pub use error::ServerError;
pub use event_loop::{LoopStats, Server, ServerOptions};

use crate::config::{listen_addr, Config, BACKLOG};
use crate::protocols::ack::AckFrame;
use std::io;

/// Run the server on the fixed listen address until a shutdown signal.
///
/// Received bytes are echoed to stdout.
pub fn run(config: &Config) -> Result<LoopStats, ServerError> {
    let options = ServerOptions {
        batch_size: config.batch_size,
        ack: AckFrame::from_config(config.ack_nul),
    };

    let mut server = Server::bind(
        listen_addr(),
        BACKLOG,
        options,
        Box::new(io::stdout()),
    )?;
    server.watch_signals(&signal::SHUTDOWN_SIGNALS)?;
    server.run()
}
