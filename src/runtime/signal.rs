//! Signal shim.
//!
//! Signals never run server code. The handler installed by signal-hook only
//! writes to a self-pipe; the read end is a mio source, so a delivered
//! signal both interrupts the blocking poll and shows up as a readiness
//! event the loop can inspect between polls.

use crate::runtime::error::{Op, ServerError};
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook_mio::v1_0::Signals;
use std::os::raw::c_int;

/// Signals that request shutdown: Ctrl-C, termination and both user signals.
pub const SHUTDOWN_SIGNALS: [c_int; 4] = [SIGINT, SIGTERM, SIGUSR1, SIGUSR2];

/// Install handlers for `signals` and return the pollable source.
pub fn install(signals: &[c_int]) -> Result<Signals, ServerError> {
    Signals::new(signals).map_err(|e| ServerError::io(Op::SignalInstall, e))
}

/// Human-readable name of a signal number.
pub fn name(signal: c_int) -> &'static str {
    signal_hook::low_level::signal_name(signal).unwrap_or("UNKNOWN")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(name(SIGINT), "SIGINT");
        assert_eq!(name(SIGTERM), "SIGTERM");
        assert_eq!(name(SIGUSR1), "SIGUSR1");
        assert_eq!(name(SIGUSR2), "SIGUSR2");
        assert_eq!(name(-1), "UNKNOWN");
    }

    #[test]
    fn test_shutdown_set() {
        assert!(SHUTDOWN_SIGNALS.contains(&SIGINT));
        assert!(SHUTDOWN_SIGNALS.contains(&SIGTERM));
        assert_eq!(SHUTDOWN_SIGNALS.len(), 4);
    }
}
