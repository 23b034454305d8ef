//! rexd - Remote execution daemon
//!
//! Sandboxed workspace access (filesystem, child processes, PTYs) over a
//! JSON-RPC protocol carried by stdio, HTTP, or WebSocket transports.
//! The core services live in `rexd-core`; this crate adds the dispatcher,
//! transports, and CLI entry point.

#![forbid(unsafe_code)]

pub mod server;
