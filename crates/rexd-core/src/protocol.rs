//! JSON-RPC wire protocol types
//!
//! Request/response/notification framing plus the typed parameter and result
//! shapes for every method. Field names are snake_case on the wire.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version carried in every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol identifier returned by `session.open`.
pub const PROTOCOL_NAME: &str = "rexd/1";

// Wire error codes. The reserved codes are part of the protocol surface even
// when the current server never emits them.
/// Malformed params, unknown session, generic validation.
pub const ERR_INVALID_PARAMS: i32 = -32602;
/// Unknown method.
pub const ERR_METHOD_NOT_FOUND: i32 = -32601;
/// Reserved: no transport auth in core.
pub const ERR_UNAUTHORIZED: i32 = -32001;
/// Policy rejected the resolved path.
pub const ERR_FORBIDDEN_PATH: i32 = -32002;
/// Reserved: timeouts surface via `exec.exit` with `timed_out=true`.
pub const ERR_TIMEOUT: i32 = -32003;
/// Reserved: output overruns surface as killed + `timed_out=true`.
pub const ERR_OUTPUT_LIMIT_EXCEEDED: i32 = -32004;
/// Unknown process_id / pty_id.
pub const ERR_PROCESS_NOT_FOUND: i32 = -32005;
/// fs.write mtime mismatch.
pub const ERR_CONCURRENCY_CONFLICT: i32 = -32006;
/// Reserved: shell-disabled currently surfaces as invalid params.
pub const ERR_UNSUPPORTED_CAPABILITY: i32 = -32007;
/// Session or per-session process cap.
pub const ERR_RESOURCE_LIMIT: i32 = -32008;

/// Incoming JSON-RPC request. A missing `id` marks a one-way notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Outgoing JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Build a success response for a request ID.
    #[must_use]
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response for a request ID.
    #[must_use]
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Structured error inside a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ── Session methods ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionOpenParams {
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client_version: String,
    #[serde(default)]
    pub workspace_roots: Vec<String>,
    #[serde(default)]
    pub requested_capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionOpenResult {
    pub session_id: String,
    pub protocol: String,
    pub server_version: String,
    pub capabilities: Vec<String>,
    pub limits: HashMap<String, u64>,
    pub workspace_roots: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfoParams {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionCloseParams {
    pub session_id: String,
}

// ── Exec methods ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecStartParams {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub max_output_bytes: u64,
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub inherit_env: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecStartResult {
    pub process_id: String,
    pub started_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecWaitParams {
    #[serde(default)]
    pub session_id: String,
    pub process_id: String,
    #[serde(default)]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecWaitResult {
    pub status: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub bytes_stdout: u64,
    pub bytes_stderr: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecKillParams {
    #[serde(default)]
    pub session_id: String,
    pub process_id: String,
    #[serde(default)]
    pub signal: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInputParams {
    #[serde(default)]
    pub session_id: String,
    pub process_id: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub eof: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecInputResult {
    pub accepted_bytes: usize,
}

// ── Filesystem methods ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct FsReadParams {
    #[serde(default)]
    pub session_id: String,
    pub path: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub encoding: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsWriteParams {
    #[serde(default)]
    pub session_id: String,
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub mkdir_parents: bool,
    #[serde(default = "default_true")]
    pub atomic: bool,
    #[serde(default)]
    pub expected_mtime: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsListParams {
    #[serde(default)]
    pub session_id: String,
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsGlobParams {
    #[serde(default)]
    pub session_id: String,
    pub pattern: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub max_matches: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsStatParams {
    #[serde(default)]
    pub session_id: String,
    pub path: String,
}

// ── PTY methods ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PtyOpenParams {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cols: u16,
    #[serde(default)]
    pub rows: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct PtyOpenResult {
    pub pty_id: String,
    pub process_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PtyInputParams {
    #[serde(default)]
    pub session_id: String,
    pub pty_id: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PtyResizeParams {
    #[serde(default)]
    pub session_id: String,
    pub pty_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PtyCloseParams {
    #[serde(default)]
    pub session_id: String,
    pub pty_id: String,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_without_id_is_notification() {
        let raw = r#"{"jsonrpc":"2.0","method":"session.close","params":{"session_id":"s_1"}}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        assert!(req.id.is_none());
        assert_eq!(req.method, "session.close");
    }

    #[test]
    fn test_response_ok_shape() {
        let resp = Response::ok(Some(json!(7)), json!({"ok": true}));
        let raw = serde_json::to_string(&resp).unwrap();
        assert!(raw.contains("\"jsonrpc\":\"2.0\""));
        assert!(raw.contains("\"id\":7"));
        assert!(!raw.contains("\"error\""));
    }

    #[test]
    fn test_response_error_shape() {
        let resp = Response::error(Some(json!("a")), ERR_FORBIDDEN_PATH, "nope");
        let raw = serde_json::to_string(&resp).unwrap();
        assert!(raw.contains("-32002"));
        assert!(!raw.contains("\"result\""));
    }

    #[test]
    fn test_exec_start_params_defaults() {
        let params: ExecStartParams =
            serde_json::from_value(json!({"session_id": "s_1", "argv": ["ls"]})).unwrap();
        assert_eq!(params.timeout_ms, 0);
        assert_eq!(params.max_output_bytes, 0);
        assert!(!params.shell);
        assert!(!params.detach);
        assert!(!params.inherit_env);
    }

    #[test]
    fn test_fs_write_atomic_default() {
        let params: FsWriteParams =
            serde_json::from_value(json!({"path": "/tmp/x", "content": "y"})).unwrap();
        assert!(params.atomic);
        assert_eq!(params.mode, "");
        assert_eq!(params.expected_mtime, 0);
    }
}
