//! edge-ack: a single-threaded edge-triggered TCP ack server
//!
//! Accepts any number of TCP clients on port 8080 and, for every burst of
//! data a client sends, prints the bytes (control characters replaced by
//! `.`) to stdout and answers with `Ack\n`.
//!
//! Features:
//! - One thread, one poll, edge-triggered read and write readiness
//! - Clean handling of peer close and peer reset
//! - Shutdown on SIGINT, SIGTERM, SIGUSR1 or SIGUSR2 (exit code 0)
//! - Any fatal socket or poll failure exits with code 1
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;

use config::{Config, BACKLOG, PORT};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging; stdout carries the echoed data
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!(
        port = PORT,
        backlog = BACKLOG,
        batch_size = config.batch_size,
        ack_nul = config.ack_nul,
        "Starting edge-ack server"
    );

    match runtime::run(&config) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
