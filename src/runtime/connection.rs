//! Connection state machine for accepted TCP connections.
//!
//! A connection lives in the registry from accept until it is closed. The
//! registry key doubles as the poll token, so a slot freed by a close can be
//! reused by the next accept without ever being confused with the old peer:
//! the old entry is gone before the new one is inserted.

use mio::net::TcpStream;
use mio::Token;
use slab::Slab;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered, nothing owed to the peer.
    Active,
    /// Acknowledgments are owed; the first one may be partly sent.
    Acking {
        /// Bytes of the current frame already written.
        written: usize,
        /// Further frames owed after the current one.
        queued: usize,
    },
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    /// Socket, switched to non-blocking on accept.
    pub stream: TcpStream,
    /// Descriptor, kept for logging after the stream is gone.
    pub fd: RawFd,
    /// Remote address.
    pub peer: SocketAddr,
    /// Current connection state.
    pub state: ConnState,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            stream,
            fd,
            peer,
            state: ConnState::Active,
        }
    }

    /// Owe one more acknowledgment.
    pub fn owe_ack(&mut self) {
        self.state = match self.state {
            ConnState::Active => ConnState::Acking {
                written: 0,
                queued: 0,
            },
            ConnState::Acking { written, queued } => ConnState::Acking {
                written,
                queued: queued + 1,
            },
        };
    }

    /// Record a partial write of the current frame.
    pub fn ack_progress(&mut self, written: usize) {
        if let ConnState::Acking { queued, .. } = self.state {
            self.state = ConnState::Acking { written, queued };
        }
    }

    /// Current frame fully sent.
    pub fn ack_sent(&mut self) {
        self.state = match self.state {
            ConnState::Acking { queued, .. } if queued > 0 => ConnState::Acking {
                written: 0,
                queued: queued - 1,
            },
            _ => ConnState::Active,
        };
    }

    /// Bytes of the current frame already written, if a frame is owed.
    pub fn ack_offset(&self) -> Option<usize> {
        match self.state {
            ConnState::Active => None,
            ConnState::Acking { written, .. } => Some(written),
        }
    }
}

/// Registry of live connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
}

impl ConnectionRegistry {
    /// Create a new registry with room for `capacity` connections before
    /// it has to grow.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: Slab::with_capacity(capacity),
        }
    }

    /// Token the next inserted connection will get.
    pub fn next_token(&self) -> Token {
        Token(self.connections.vacant_key())
    }

    /// Insert a new connection and return its token.
    pub fn insert(&mut self, conn: Connection) -> Token {
        Token(self.connections.insert(conn))
    }

    /// Get an immutable reference to a connection.
    #[allow(dead_code)]
    pub fn get(&self, token: Token) -> Option<&Connection> {
        self.connections.get(token.0)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.get_mut(token.0)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        self.connections.try_remove(token.0)
    }

    /// Check if a connection exists.
    #[allow(dead_code)]
    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains(token.0)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;

    fn pair(listener: &TcpListener) -> (std::net::TcpStream, Connection) {
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        loop {
            match listener.accept() {
                Ok((stream, peer)) => return (client, Connection::new(stream, peer)),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
    }

    fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_connection_state_transitions() {
        let l = listener();
        let (_client, mut conn) = pair(&l);

        assert_eq!(conn.state, ConnState::Active);
        assert_eq!(conn.fd, conn.stream.as_raw_fd());
        assert_eq!(conn.ack_offset(), None);

        conn.owe_ack();
        assert_eq!(conn.state, ConnState::Acking { written: 0, queued: 0 });

        conn.ack_progress(2);
        assert_eq!(conn.ack_offset(), Some(2));

        // A second pass with data while the first frame is still in flight.
        conn.owe_ack();
        assert_eq!(conn.state, ConnState::Acking { written: 2, queued: 1 });

        conn.ack_sent();
        assert_eq!(conn.state, ConnState::Acking { written: 0, queued: 0 });

        conn.ack_sent();
        assert_eq!(conn.state, ConnState::Active);

        // Progress without an owed frame is ignored.
        conn.ack_progress(3);
        assert_eq!(conn.state, ConnState::Active);
    }

    #[test]
    fn test_connection_registry() {
        let l = listener();
        let mut registry = ConnectionRegistry::with_capacity(2);

        let (_c1, conn1) = pair(&l);
        let (_c2, conn2) = pair(&l);
        let (_c3, conn3) = pair(&l);
        let fd2 = conn2.fd;

        let expected = registry.next_token();
        let t1 = registry.insert(conn1);
        assert_eq!(t1, expected);
        let t2 = registry.insert(conn2);

        // Grows past the initial capacity.
        let t3 = registry.insert(conn3);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get(t2).unwrap().fd, fd2);

        assert!(registry.remove(t1).is_some());
        assert!(!registry.contains(t1));
        assert!(registry.remove(t1).is_none());
        assert_eq!(registry.len(), 2);

        // The freed slot is handed out again.
        assert_eq!(registry.next_token(), t1);
        assert!(registry.contains(t3));
    }
}
