//! A single-process TCP relay for newline-delimited text.
//!
//! Every line a connected peer sends is delivered, byte for byte, to every
//! other currently-connected peer. There is no persistence, no handshake,
//! and no protocol beyond "bytes up to and including `\n` form one message",
//! so `netcat` is a perfectly good client.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface (listen address and limits).
//! - [`framer`] splits a connection's accumulated bytes into complete
//!   newline-terminated lines plus an unterminated remainder.
//! - [`registry`] owns every live [`registry::Connection`] and its
//!   partial-read buffer, and enforces the connection and buffer limits.
//! - [`broadcast`] fans a completed line out to all peers except its sender,
//!   best effort, without blocking.
//! - [`relay`] is the reactor loop: one task that waits for readiness on the
//!   listener and every peer socket and drives the other modules.
//!
//! The whole server runs as a single task. The registry and all buffers are
//! owned by the reactor loop, so there is no locking anywhere; integration
//! tests use this crate directly to drive a relay on a loopback socket.

pub mod broadcast;
pub mod cli;
pub mod framer;
pub mod registry;
pub mod relay;
