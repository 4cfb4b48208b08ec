//! Owns every live peer connection and its partial-read buffer.

use std::{collections::HashMap, fmt, net::SocketAddr};

use thiserror::Error;
use tokio::net::TcpStream;

use crate::framer;

/// Stable identifier for one registered connection. Never reused within a
/// relay's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection limit of {limit} reached")]
    CapacityExceeded { limit: usize },
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),
}

/// One accepted peer: its socket, remote address, and the bytes received so
/// far that do not yet end in a terminator.
///
/// The stream is owned exclusively by the registry entry, so removing the
/// entry closes the socket and deregisters it from the runtime in one step;
/// registry membership and reactor registration cannot drift apart.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: Vec<u8>,
}

impl Connection {
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Mapping from [`ConnId`] to [`Connection`], plus the limits that keep a
/// hostile or stuck peer population from growing memory without bound.
///
/// Owned and mutated only by the reactor loop; iteration order is arbitrary
/// and delivery order across peers is not a guaranteed property.
pub struct Registry {
    connections: HashMap<ConnId, Connection>,
    next_id: u64,
    max_connections: usize,
    max_buffered_bytes: usize,
}

impl Registry {
    pub fn new(max_connections: usize, max_buffered_bytes: usize) -> Self {
        Self {
            connections: HashMap::new(),
            next_id: 1,
            max_connections,
            max_buffered_bytes,
        }
    }

    /// Registers a newly accepted peer with an empty buffer. The stream is
    /// dropped (closing the socket) when the connection limit is reached.
    pub fn add(&mut self, stream: TcpStream, peer: SocketAddr) -> Result<ConnId, RegistryError> {
        if self.connections.len() >= self.max_connections {
            return Err(RegistryError::CapacityExceeded {
                limit: self.max_connections,
            });
        }

        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.connections.insert(
            id,
            Connection {
                stream,
                peer,
                buffer: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Closes and discards a connection. Idempotent: the EOF path and the
    /// error path may both ask for removal of the same id within one event
    /// batch, and the second request is a no-op.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn append_bytes(&mut self, id: ConnId, bytes: &[u8]) -> Result<(), RegistryError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        conn.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Runs the framer over the connection's buffer, keeps the unterminated
    /// remainder, and returns the complete lines in order. After this call
    /// the buffer contains no terminator.
    pub fn drain_lines(&mut self, id: ConnId) -> Result<Vec<Vec<u8>>, RegistryError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        let (lines, remainder) = framer::extract_lines(&conn.buffer);
        conn.buffer = remainder;
        Ok(lines)
    }

    /// True when a connection's unterminated bytes exceed the configured
    /// limit. The reactor treats this as a terminal per-connection error: a
    /// peer that streams without ever sending a terminator gets cut off
    /// instead of growing the buffer forever.
    pub fn exceeds_buffer_limit(&self, id: ConnId) -> bool {
        self.connections
            .get(&id)
            .is_some_and(|conn| conn.buffer.len() > self.max_buffered_bytes)
    }

    /// Applies `f` to every connection other than `origin`, in registry
    /// iteration order. `f` has no way to abort the iteration, so a failed
    /// delivery to one target never starves the rest.
    pub fn for_each_except<F>(&self, origin: ConnId, mut f: F)
    where
        F: FnMut(ConnId, &Connection),
    {
        for (&id, conn) in &self.connections {
            if id != origin {
                f(id, conn);
            }
        }
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &Connection)> {
        self.connections.iter().map(|(&id, conn)| (id, conn))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drops every connection, closing all peer sockets. Used on shutdown.
    pub fn clear(&mut self) {
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair(listener: &TcpListener) -> (TcpStream, SocketAddr) {
        let addr = listener.local_addr().expect("listener address");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server_side, _) = listener.accept().await.expect("accept");
        let peer = server_side.peer_addr().expect("peer address");
        drop(client);
        (server_side, peer)
    }

    #[tokio::test]
    async fn add_assigns_unique_ids() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let mut registry = Registry::new(8, 1024);

        let (stream_a, peer_a) = socket_pair(&listener).await;
        let (stream_b, peer_b) = socket_pair(&listener).await;
        let a = registry.add(stream_a, peer_a).expect("first add");
        let b = registry.add(stream_b, peer_b).expect("second add");

        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn add_rejects_past_the_connection_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let mut registry = Registry::new(1, 1024);

        let (stream_a, peer_a) = socket_pair(&listener).await;
        registry.add(stream_a, peer_a).expect("first add");

        let (stream_b, peer_b) = socket_pair(&listener).await;
        let result = registry.add(stream_b, peer_b);
        assert!(matches!(
            result,
            Err(RegistryError::CapacityExceeded { limit: 1 })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let mut registry = Registry::new(8, 1024);

        let (stream, peer) = socket_pair(&listener).await;
        let id = registry.add(stream, peer).expect("add");

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn append_to_removed_connection_reports_unknown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let mut registry = Registry::new(8, 1024);

        let (stream, peer) = socket_pair(&listener).await;
        let id = registry.add(stream, peer).expect("add");
        registry.remove(id);

        let result = registry.append_bytes(id, b"late");
        assert!(matches!(result, Err(RegistryError::UnknownConnection(_))));
    }

    #[tokio::test]
    async fn drain_lines_leaves_no_terminator_behind() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let mut registry = Registry::new(8, 1024);

        let (stream, peer) = socket_pair(&listener).await;
        let id = registry.add(stream, peer).expect("add");

        registry.append_bytes(id, b"one\ntw").expect("append");
        let lines = registry.drain_lines(id).expect("drain");
        assert_eq!(lines, vec![b"one\n".to_vec()]);

        registry.append_bytes(id, b"o\n").expect("append");
        let lines = registry.drain_lines(id).expect("drain");
        assert_eq!(lines, vec![b"two\n".to_vec()]);
    }

    #[tokio::test]
    async fn buffer_limit_trips_only_on_unterminated_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let mut registry = Registry::new(8, 4);

        let (stream, peer) = socket_pair(&listener).await;
        let id = registry.add(stream, peer).expect("add");

        // Terminated data passes through the framer and never accumulates.
        registry.append_bytes(id, b"abcdefgh\n").expect("append");
        registry.drain_lines(id).expect("drain");
        assert!(!registry.exceeds_buffer_limit(id));

        registry.append_bytes(id, b"abcdefgh").expect("append");
        registry.drain_lines(id).expect("drain");
        assert!(registry.exceeds_buffer_limit(id));
    }

    #[tokio::test]
    async fn for_each_except_skips_the_origin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let mut registry = Registry::new(8, 1024);

        let (stream_a, peer_a) = socket_pair(&listener).await;
        let (stream_b, peer_b) = socket_pair(&listener).await;
        let (stream_c, peer_c) = socket_pair(&listener).await;
        let a = registry.add(stream_a, peer_a).expect("add a");
        let b = registry.add(stream_b, peer_b).expect("add b");
        let c = registry.add(stream_c, peer_c).expect("add c");

        let mut seen = Vec::new();
        registry.for_each_except(a, |id, _| seen.push(id));

        assert_eq!(seen.len(), 2);
        assert!(!seen.contains(&a));
        assert!(seen.contains(&b));
        assert!(seen.contains(&c));
    }
}
