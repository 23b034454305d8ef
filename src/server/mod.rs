//! Server layer: dispatcher plus the three transports
//!
//! - service: JSON-RPC dispatcher over the core services
//! - stdio: newline-delimited JSON on stdin/stdout
//! - http: single-shot JSON-RPC over POST, plus /healthz
//! - ws: persistent bidirectional JSON messages

pub mod http;
pub mod service;
pub mod stdio;
pub mod ws;

pub use service::Service;
