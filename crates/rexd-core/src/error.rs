//! Error types for rexd-core

use thiserror::Error;

use crate::protocol;

/// Core error type. Every variant maps to a JSON-RPC wire code via
/// [`Error::code`].
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed parameters or generic validation failure
    #[error("{0}")]
    InvalidParams(String),

    /// Unknown method name
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Session ID not present in the registry
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Resolved path falls outside the allowed roots
    #[error("path is outside allowed roots")]
    ForbiddenPath,

    /// Process or PTY ID not present in the registry
    #[error("process not found: {0}")]
    ProcessNotFound(String),

    /// fs.write expected_mtime mismatch
    #[error("expected mtime does not match")]
    Conflict,

    /// Session or per-session process cap reached
    #[error("{0}")]
    ResourceLimit(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// JSON-RPC error code carried on the wire for this kind.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::MethodNotFound(_) => protocol::ERR_METHOD_NOT_FOUND,
            Self::ForbiddenPath => protocol::ERR_FORBIDDEN_PATH,
            Self::ProcessNotFound(_) => protocol::ERR_PROCESS_NOT_FOUND,
            Self::Conflict => protocol::ERR_CONCURRENCY_CONFLICT,
            Self::ResourceLimit(_) => protocol::ERR_RESOURCE_LIMIT,
            Self::InvalidParams(_) | Self::SessionNotFound(_) | Self::Io(_) => {
                protocol::ERR_INVALID_PARAMS
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidParams(format!("invalid params: {err}"))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(Error::InvalidParams("x".into()).code(), -32602);
        assert_eq!(Error::SessionNotFound("s_1".into()).code(), -32602);
        assert_eq!(Error::MethodNotFound("nope".into()).code(), -32601);
        assert_eq!(Error::ForbiddenPath.code(), -32002);
        assert_eq!(Error::ProcessNotFound("p_1".into()).code(), -32005);
        assert_eq!(Error::Conflict.code(), -32006);
        assert_eq!(Error::ResourceLimit("cap".into()).code(), -32008);
    }

    #[test]
    fn test_forbidden_path_message() {
        assert_eq!(
            Error::ForbiddenPath.to_string(),
            "path is outside allowed roots"
        );
    }
}
