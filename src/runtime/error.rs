//! Fatal errors and OS error classification.
//!
//! Every `io::Error` coming out of a socket call is mapped once, here, into
//! an [`IoClass`]. The event loop decides what to do from the class and
//! never looks at raw error codes.

use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Operation that produced a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    SocketCreate,
    SetSockOpt,
    Bind,
    Listen,
    PollCreate,
    Register,
    Deregister,
    PollWait,
    Accept,
    SetNonBlocking,
    Recv,
    Send,
    Close,
    SignalInstall,
    EchoWrite,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::SocketCreate => "socket creation",
            Op::SetSockOpt => "socket setsockopt",
            Op::Bind => "socket bind",
            Op::Listen => "socket listen",
            Op::PollCreate => "poll create",
            Op::Register => "poll register",
            Op::Deregister => "poll deregister",
            Op::PollWait => "poll wait",
            Op::Accept => "socket accept",
            Op::SetNonBlocking => "socket set non-blocking",
            Op::Recv => "socket recv",
            Op::Send => "socket send",
            Op::Close => "socket close",
            Op::SignalInstall => "signal install",
            Op::EchoWrite => "echo write",
        };
        f.write_str(name)
    }
}

/// Errors that end the process.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("The given address is already in use ({addr}).")]
    AddrInUse {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("{op} error ({source})")]
    Io {
        op: Op,
        #[source]
        source: io::Error,
    },
}

impl ServerError {
    pub fn io(op: Op, source: io::Error) -> Self {
        ServerError::Io { op, source }
    }

    /// The failing operation, if the error carries one.
    #[allow(dead_code)]
    pub fn op(&self) -> Op {
        match self {
            ServerError::AddrInUse { .. } => Op::Bind,
            ServerError::Io { op, .. } => *op,
        }
    }
}

/// Outcome class of a failed socket call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoClass {
    /// No progress possible now; wait for the next readiness edge.
    WouldBlock,
    /// Interrupted by a signal before doing anything; retry.
    Interrupted,
    /// The peer reset or abandoned the connection. Closes that connection.
    PeerReset,
    /// The descriptor is no longer valid.
    BadDescriptor,
    /// Anything else.
    Fatal,
}

/// Map an OS error to its class.
pub fn classify(err: &io::Error) -> IoClass {
    if err.raw_os_error() == Some(libc::EBADF) {
        return IoClass::BadDescriptor;
    }

    match err.kind() {
        io::ErrorKind::WouldBlock => IoClass::WouldBlock,
        io::ErrorKind::Interrupted => IoClass::Interrupted,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => IoClass::PeerReset,
        _ => IoClass::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_os_errors() {
        let cases = [
            (libc::EAGAIN, IoClass::WouldBlock),
            (libc::EWOULDBLOCK, IoClass::WouldBlock),
            (libc::EINTR, IoClass::Interrupted),
            (libc::ECONNRESET, IoClass::PeerReset),
            (libc::ECONNABORTED, IoClass::PeerReset),
            (libc::EPIPE, IoClass::PeerReset),
            (libc::EBADF, IoClass::BadDescriptor),
            (libc::EINVAL, IoClass::Fatal),
            (libc::ENOMEM, IoClass::Fatal),
            (libc::EMFILE, IoClass::Fatal),
            (libc::EACCES, IoClass::Fatal),
        ];

        for (errno, expected) in cases {
            let err = io::Error::from_raw_os_error(errno);
            assert_eq!(classify(&err), expected, "errno {errno}");
        }
    }

    #[test]
    fn test_classify_synthetic_errors() {
        let err = io::Error::new(io::ErrorKind::WouldBlock, "later");
        assert_eq!(classify(&err), IoClass::WouldBlock);

        let err = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(classify(&err), IoClass::Fatal);
    }

    #[test]
    fn test_error_display() {
        let err = ServerError::io(Op::Recv, io::Error::from_raw_os_error(libc::EINVAL));
        let msg = err.to_string();
        assert!(msg.starts_with("socket recv error ("), "{msg}");
        assert!(msg.contains(&format!("os error {}", libc::EINVAL)), "{msg}");
        assert_eq!(err.op(), Op::Recv);

        let err = ServerError::AddrInUse {
            addr: "0.0.0.0:8080".parse().unwrap(),
            source: io::Error::from_raw_os_error(libc::EADDRINUSE),
        };
        assert!(err.to_string().starts_with("The given address is already in use"));
        assert_eq!(err.op(), Op::Bind);
    }
}
