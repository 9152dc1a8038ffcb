//! Listening socket setup.
//!
//! The socket is created with socket2 so each step (create, option, bind,
//! listen) fails with its own operation, then handed to mio for
//! registration.

use crate::runtime::error::{Op, ServerError};
use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;

/// Create a non-blocking TCP listener with SO_REUSEADDR.
///
/// The listener is non-blocking so that accepting can be drained until it
/// would block.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, ServerError> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(|e| ServerError::io(Op::SocketCreate, e))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| ServerError::io(Op::SetSockOpt, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ServerError::io(Op::SetNonBlocking, e))?;

    socket.bind(&addr.into()).map_err(|e| {
        if e.kind() == io::ErrorKind::AddrInUse {
            ServerError::AddrInUse { addr, source: e }
        } else {
            ServerError::io(Op::Bind, e)
        }
    })?;

    socket
        .listen(backlog)
        .map_err(|e| ServerError::io(Op::Listen, e))?;

    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener))
}
