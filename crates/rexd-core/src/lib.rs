//! rexd-core - Sandboxed remote execution services
//!
//! Core services for the rexd daemon:
//! - Policy: lexical path canonicalization and workspace containment
//! - Session: session registry with per-session process accounting
//! - Events: per-session notification fan-out with bounded queues
//! - Exec: child process spawning, stream pumps, timeouts, PTY sessions
//! - Fsops: read/write/list/glob/stat under policy-resolved paths
//! - Protocol: JSON-RPC framing and typed method shapes
//! - Config / Audit: TOML configuration and NDJSON audit sink

#![forbid(unsafe_code)]

pub mod audit;
pub mod config;
pub mod error;
pub mod events;
pub mod exec;
pub mod fsops;
pub mod policy;
pub mod protocol;
pub mod session;

pub use audit::AuditLog;
pub use config::Config;
pub use error::{Error, Result};
pub use events::{EventBus, Notification, SubscriptionGuard};
pub use exec::{ProcessManager, ProcessState, ProcessStatus, PtyManager, SpawnSpec};
pub use fsops::FsService;
pub use policy::PolicyEngine;
pub use session::{Session, SessionRegistry};
