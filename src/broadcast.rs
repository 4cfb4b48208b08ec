//! Fans one completed line out to every peer except its sender.

use std::io;

use tracing::{debug, trace, warn};

use crate::registry::{ConnId, Registry};

/// Delivers `line` verbatim to every connection in `registry` except
/// `origin`, via one non-blocking write per target.
///
/// Delivery is best effort: a target whose outbound buffer is completely
/// full gets the line dropped whole, and a hard write error is left for the
/// read path to tear the connection down; neither stops delivery to the
/// remaining targets, and neither mutates the registry. A short write is
/// worse than either failure: the target already holds a torn prefix with
/// no terminator, so every later line it receives would be glued onto the
/// fragment. Such targets are returned for the caller to disconnect.
pub fn broadcast(registry: &Registry, origin: ConnId, line: &[u8]) -> Vec<ConnId> {
    let mut delivered = 0usize;
    let mut torn = Vec::new();

    registry.for_each_except(origin, |id, conn| {
        match conn.stream().try_write(line) {
            Ok(written) if written == line.len() => delivered += 1,
            Ok(written) => {
                warn!(%id, written, expected = line.len(), "short write left a torn line");
                torn.push(id);
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                debug!(%id, "peer outbound buffer full, line dropped");
            }
            Err(err) => {
                warn!(%id, error = %err, "delivery failed");
            }
        }
    });

    trace!(%origin, delivered, bytes = line.len(), "broadcast complete");
    torn
}
