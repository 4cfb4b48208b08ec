//! The reactor loop: one task multiplexing the listener and every peer.

use std::{future::Future, io, net::SocketAddr};

use anyhow::Result;
use futures::{future, FutureExt};
use tokio::{
    io::Interest,
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    broadcast,
    registry::{ConnId, Registry},
};

/// Matches the reference server's receive buffer. Reads are drained until
/// they would block, so the size only bounds one syscall's worth of bytes.
const READ_CHUNK: usize = 1024;

/// Limits injected into the registry. Both exist to bound memory against a
/// slow, stuck, or abusive peer population.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Live connections accepted at once; further accepts are rejected.
    pub max_connections: usize,
    /// Bytes a single connection may accumulate without sending a
    /// terminator before it is disconnected.
    pub max_buffered_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_buffered_bytes: 64 * 1024,
        }
    }
}

/// What a loop iteration woke up for. Computed inside the `select!` so the
/// registry borrow held by the readiness wait ends before dispatch mutates
/// anything.
enum Wakeup {
    Shutdown,
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Readable(ConnId, io::Result<()>),
}

pub struct Relay {
    listener: TcpListener,
    registry: Registry,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            registry: Registry::new(config.max_connections, config.max_buffered_bytes),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the relay until `shutdown` completes, then closes every peer
    /// connection and the listener.
    ///
    /// The whole loop is one future: it suspends only in the `select!`
    /// below, and every socket operation it performs (`accept` drain,
    /// `try_read`, `try_write`) returns without blocking. The registry is
    /// owned here and touched by nothing else, so there is no locking.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            mut registry,
        } = self;
        tokio::pin!(shutdown);

        loop {
            let wakeup = select! {
                _ = &mut shutdown => Wakeup::Shutdown,
                result = listener.accept() => Wakeup::Accept(result),
                (id, result) = next_readable(&registry) => Wakeup::Readable(id, result),
            };

            match wakeup {
                Wakeup::Shutdown => {
                    info!(peers = registry.len(), "relay shutting down");
                    registry.clear();
                    break;
                }
                Wakeup::Accept(result) => {
                    handle_accept(&mut registry, result);
                    // One readiness notification can cover several queued
                    // connections; drain them so the accept queue is never
                    // starved by a busy batch of readable peers. A failed
                    // accept consumes nothing from the queue, so it would
                    // stay ready and spin this loop forever; bail back to
                    // the select! instead.
                    while let Some(result) = listener.accept().now_or_never() {
                        let accepted = result.is_ok();
                        handle_accept(&mut registry, result);
                        if !accepted {
                            break;
                        }
                    }
                }
                Wakeup::Readable(id, Ok(())) => handle_readable(&mut registry, id),
                Wakeup::Readable(id, Err(err)) => {
                    warn!(%id, error = %err, "readiness wait failed");
                    registry.remove(id);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Resolves when any registered peer socket is read-ready. Pends forever
/// while the registry is empty, leaving accept and shutdown as the only
/// things that can wake the loop.
async fn next_readable(registry: &Registry) -> (ConnId, io::Result<()>) {
    if registry.is_empty() {
        return future::pending().await;
    }

    let waits = registry
        .iter()
        .map(|(id, conn)| {
            async move {
                let result = conn.stream().ready(Interest::READABLE).await.map(|_| ());
                (id, result)
            }
            .boxed()
        })
        .collect::<Vec<_>>();

    let ((id, result), _, _) = future::select_all(waits).await;
    (id, result)
}

/// Accept failures are logged and never fatal; a full registry rejects the
/// peer by dropping its stream, which closes the socket.
fn handle_accept(registry: &mut Registry, result: io::Result<(TcpStream, SocketAddr)>) {
    match result {
        Ok((stream, peer)) => match registry.add(stream, peer) {
            Ok(id) => info!(%id, %peer, "peer connected"),
            Err(err) => warn!(%peer, %err, "connection rejected"),
        },
        Err(err) => warn!(error = %err, "accept failed"),
    }
}

/// Drains non-blocking reads from one peer until they would block, feeding
/// each chunk through the framer and broadcasting every completed line.
/// EOF and hard read errors tear down this connection and nothing else.
fn handle_readable(registry: &mut Registry, id: ConnId) {
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let Some(conn) = registry.get(id) else {
            return;
        };

        match conn.stream().try_read(&mut chunk) {
            Ok(0) => {
                if let Some(conn) = registry.remove(id) {
                    info!(%id, peer = %conn.peer(), "peer disconnected");
                }
                return;
            }
            Ok(count) => {
                if !ingest_chunk(registry, id, &chunk[..count]) {
                    return;
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                warn!(%id, error = %err, "read failed");
                registry.remove(id);
                return;
            }
        }
    }
}

/// Appends one read chunk, broadcasts the lines it completed, and enforces
/// the buffer limit. Returns false when the connection is gone.
fn ingest_chunk(registry: &mut Registry, id: ConnId, bytes: &[u8]) -> bool {
    if let Err(err) = registry.append_bytes(id, bytes) {
        // The connection was removed earlier in this event batch.
        debug!(%id, %err, "discarding bytes");
        return false;
    }

    let lines = match registry.drain_lines(id) {
        Ok(lines) => lines,
        Err(_) => return false,
    };
    for line in &lines {
        // A torn delivery corrupts that peer's framing from then on; cut
        // it off rather than glue later lines onto the fragment.
        for victim in broadcast::broadcast(registry, id, line) {
            if registry.remove(victim).is_some() {
                info!(%victim, "peer dropped after torn delivery");
            }
        }
    }

    if registry.exceeds_buffer_limit(id) {
        warn!(%id, "unterminated input exceeds buffer limit, disconnecting");
        registry.remove(id);
        return false;
    }
    true
}
