//! JSON-RPC dispatcher
//!
//! Decodes incoming requests, routes them to the core services, and maps
//! service errors to wire codes. The dispatcher owns every component: the
//! bus is a leaf it hands to the exec/pty managers, and transports only ever
//! see [`Service::handle`] plus [`Service::bus`].

use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use rexd_core::audit::AuditLog;
use rexd_core::config::Config;
use rexd_core::error::{Error, Result};
use rexd_core::events::EventBus;
use rexd_core::exec::{ProcessManager, PtyManager, PtySpawnSpec, SpawnSpec};
use rexd_core::fsops::{decode_content, FsService};
use rexd_core::policy::{clean_path, PolicyEngine};
use rexd_core::protocol::{
    self, ExecInputParams, ExecInputResult, ExecKillParams, ExecStartParams, ExecStartResult,
    ExecWaitParams, ExecWaitResult, FsGlobParams, FsListParams, FsReadParams, FsStatParams,
    FsWriteParams, PtyCloseParams, PtyInputParams, PtyOpenParams, PtyOpenResult, PtyResizeParams,
    Request, Response, SessionCloseParams, SessionInfoParams, SessionOpenParams,
    SessionOpenResult,
};
use rexd_core::session::SessionRegistry;

/// Version string reported by `session.open`.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capabilities advertised to clients.
const CAPABILITIES: [&str; 5] = ["exec", "fs", "events", "pty", "http"];

/// The assembled daemon: dispatcher plus every core service.
pub struct Service {
    cfg: Config,
    sessions: Arc<SessionRegistry>,
    policy: PolicyEngine,
    exec: ProcessManager,
    pty: PtyManager,
    fs: FsService,
    bus: EventBus,
    audit: AuditLog,
}

impl Service {
    /// Wire up all services from one configuration.
    pub fn new(cfg: Config) -> Result<Self> {
        let policy = PolicyEngine::new(&cfg.allowed_roots(), cfg.security.allow_shell)?;
        let bus = EventBus::new();
        let sessions = Arc::new(SessionRegistry::new(cfg.limits.max_concurrent_sessions));
        let exec = ProcessManager::new(bus.clone(), Arc::clone(&sessions), cfg.limits.clone());
        let pty = PtyManager::new(
            bus.clone(),
            Arc::clone(&sessions),
            cfg.limits.max_processes_per_session,
        );
        let fs = FsService::new(cfg.limits.max_file_read_bytes);
        let audit = AuditLog::new(cfg.audit.enabled, &cfg.audit.path);
        Ok(Self {
            cfg,
            sessions,
            policy,
            exec,
            pty,
            fs,
            bus,
            audit,
        })
    }

    /// The notification bus, for transports to subscribe against.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Dispatch one request to a response. Transports decide whether the
    /// response is actually emitted (requests without an `id` are one-way).
    pub async fn handle(&self, req: Request) -> Response {
        let id = req.id.clone();
        if req.jsonrpc != protocol::JSONRPC_VERSION {
            return Response::error(id, protocol::ERR_INVALID_PARAMS, "jsonrpc must be 2.0");
        }
        match self.dispatch(&req.method, req.params).await {
            Ok(result) => {
                self.audit.append(&req.method, &result);
                Response::ok(id, result)
            }
            Err(err) => {
                debug!(method = %req.method, %err, "request failed");
                Response::error(id, err.code(), err.to_string())
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "session.open" => self.session_open(decode(params)?),
            "session.info" => self.session_info(decode(params)?),
            "session.close" => self.session_close(decode(params)?),
            "exec.start" => self.exec_start(decode(params)?).await,
            "exec.wait" => self.exec_wait(decode(params)?).await,
            "exec.kill" => self.exec_kill(decode(params)?),
            "exec.input" => self.exec_input(decode(params)?).await,
            "fs.read" => self.fs_read(decode(params)?).await,
            "fs.write" => self.fs_write(decode(params)?).await,
            "fs.list" => self.fs_list(decode(params)?).await,
            "fs.glob" => self.fs_glob(decode(params)?),
            "fs.stat" => self.fs_stat(decode(params)?).await,
            "pty.open" => self.pty_open(decode(params)?).await,
            "pty.input" => self.pty_input(decode(params)?).await,
            "pty.resize" => self.pty_resize(decode(params)?).await,
            "pty.close" => self.pty_close(decode(params)?),
            other => Err(Error::MethodNotFound(other.to_string())),
        }
    }

    // ── Session methods ──────────────────────────────────────────────────

    fn session_open(&self, params: SessionOpenParams) -> Result<Value> {
        let policy_roots: Vec<String> = self
            .policy
            .allowed_roots()
            .iter()
            .map(|root| root.to_string_lossy().into_owned())
            .collect();
        // Effective roots: intersection of requested and policy roots; an
        // empty intersection falls back to all policy roots.
        let mut roots = policy_roots.clone();
        if !params.workspace_roots.is_empty() {
            let filtered: Vec<String> = params
                .workspace_roots
                .iter()
                .filter(|requested| {
                    let cleaned = clean_path(std::path::Path::new(requested));
                    policy_roots
                        .iter()
                        .any(|allowed| cleaned == PathBuf::from(allowed))
                })
                .cloned()
                .collect();
            if !filtered.is_empty() {
                roots = filtered;
            }
        }
        let session = self
            .sessions
            .open(&params.client_name, &params.client_version, roots.clone())?;
        debug!(session_id = %session.id, client = %params.client_name, "session opened");
        let limits = [
            (
                "default_timeout_ms".to_string(),
                self.cfg.limits.default_timeout_ms,
            ),
            (
                "max_output_bytes".to_string(),
                self.cfg.limits.max_output_bytes,
            ),
        ]
        .into_iter()
        .collect();
        Ok(serde_json::to_value(SessionOpenResult {
            session_id: session.id,
            protocol: protocol::PROTOCOL_NAME.to_string(),
            server_version: SERVER_VERSION.to_string(),
            capabilities: CAPABILITIES.iter().map(ToString::to_string).collect(),
            limits,
            workspace_roots: roots,
        })?)
    }

    fn session_info(&self, params: SessionInfoParams) -> Result<Value> {
        let session = self.sessions.get(&params.session_id)?;
        Ok(json!({
            "session_id": session.id,
            "cwd": session.cwd.to_string_lossy(),
            "workspace_roots": session.workspace_roots,
            "running_processes": session.process_count,
            "limits": {
                "default_timeout_ms": self.cfg.limits.default_timeout_ms,
                "hard_timeout_ms": self.cfg.limits.hard_timeout_ms,
                "max_output_bytes": self.cfg.limits.max_output_bytes,
            },
        }))
    }

    fn session_close(&self, params: SessionCloseParams) -> Result<Value> {
        self.sessions.close(&params.session_id)?;
        debug!(session_id = %params.session_id, "session closed");
        Ok(json!({"ok": true}))
    }

    // ── Exec methods ─────────────────────────────────────────────────────

    async fn exec_start(&self, params: ExecStartParams) -> Result<Value> {
        let session = self.sessions.get(&params.session_id)?;
        if params.shell && !self.policy.allow_shell() {
            return Err(Error::InvalidParams("shell mode disabled".to_string()));
        }
        let cwd = if params.cwd.is_empty() {
            session.cwd.clone()
        } else {
            self.policy.resolve(&session.cwd, &params.cwd)?
        };
        let (process_id, started_at) = self
            .exec
            .start(SpawnSpec {
                session_id: session.id,
                argv: params.argv,
                shell: params.shell,
                command: params.command,
                cwd,
                env: params.env,
                inherit_env: params.inherit_env,
                stdin: params.stdin,
                timeout_ms: params.timeout_ms,
                max_output_bytes: params.max_output_bytes,
                detach: params.detach,
            })
            .await?;
        Ok(serde_json::to_value(ExecStartResult {
            process_id,
            started_at: started_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        })?)
    }

    async fn exec_wait(&self, params: ExecWaitParams) -> Result<Value> {
        let state = self
            .exec
            .wait(&params.process_id, params.timeout_ms)
            .await?;
        Ok(serde_json::to_value(ExecWaitResult {
            status: state.status.as_str().to_string(),
            exit_code: state.exit_code,
            signal: state.signal,
            bytes_stdout: state.bytes_stdout,
            bytes_stderr: state.bytes_stderr,
        })?)
    }

    fn exec_kill(&self, params: ExecKillParams) -> Result<Value> {
        let signal = if params.signal.is_empty() {
            "TERM"
        } else {
            params.signal.as_str()
        };
        self.exec.kill(&params.process_id, signal)?;
        Ok(json!({"ok": true}))
    }

    async fn exec_input(&self, params: ExecInputParams) -> Result<Value> {
        let accepted_bytes = self
            .exec
            .input(&params.process_id, &params.data, params.eof)
            .await?;
        Ok(serde_json::to_value(ExecInputResult { accepted_bytes })?)
    }

    // ── Filesystem methods ───────────────────────────────────────────────

    fn resolve_session_path(&self, session_id: &str, input: &str) -> Result<PathBuf> {
        let session = self.sessions.get(session_id)?;
        self.policy.resolve(&session.cwd, input)
    }

    async fn fs_read(&self, params: FsReadParams) -> Result<Value> {
        let path = self.resolve_session_path(&params.session_id, &params.path)?;
        self.fs
            .read(&path, &params.encoding, params.offset, params.length)
            .await
    }

    async fn fs_write(&self, params: FsWriteParams) -> Result<Value> {
        let path = self.resolve_session_path(&params.session_id, &params.path)?;
        let data = decode_content(&params.content, &params.encoding)?;
        let mode = if params.mode.is_empty() {
            "replace"
        } else {
            params.mode.as_str()
        };
        self.fs
            .write(
                &path,
                &data,
                mode,
                params.mkdir_parents,
                params.atomic,
                params.expected_mtime,
            )
            .await
    }

    async fn fs_list(&self, params: FsListParams) -> Result<Value> {
        let path = self.resolve_session_path(&params.session_id, &params.path)?;
        self.fs
            .list(&path, params.recursive, params.max_entries)
            .await
    }

    fn fs_glob(&self, params: FsGlobParams) -> Result<Value> {
        let session = self.sessions.get(&params.session_id)?;
        let cwd = if params.cwd.is_empty() {
            session.cwd.clone()
        } else {
            self.policy.resolve(&session.cwd, &params.cwd)?
        };
        let pattern = if std::path::Path::new(&params.pattern).is_absolute() {
            params.pattern.clone()
        } else {
            format!("{}/{}", cwd.to_string_lossy(), params.pattern)
        };
        let matches = self.fs.glob(&pattern, params.max_matches)?;
        let allowed: Vec<String> = matches
            .into_iter()
            .filter(|path| self.policy.is_allowed(std::path::Path::new(path)))
            .collect();
        Ok(json!({"matches": allowed}))
    }

    async fn fs_stat(&self, params: FsStatParams) -> Result<Value> {
        let path = self.resolve_session_path(&params.session_id, &params.path)?;
        self.fs.stat(&path).await
    }

    // ── PTY methods ──────────────────────────────────────────────────────

    async fn pty_open(&self, params: PtyOpenParams) -> Result<Value> {
        let session = self.sessions.get(&params.session_id)?;
        if params.shell && !self.policy.allow_shell() {
            return Err(Error::InvalidParams("shell mode disabled".to_string()));
        }
        let cwd = if params.cwd.is_empty() {
            session.cwd.clone()
        } else {
            self.policy.resolve(&session.cwd, &params.cwd)?
        };
        let (pty_id, process_id) = self
            .pty
            .open(PtySpawnSpec {
                session_id: session.id,
                argv: params.argv,
                shell: params.shell,
                command: params.command,
                cwd,
                env: params.env,
                cols: params.cols,
                rows: params.rows,
            })
            .await?;
        Ok(serde_json::to_value(PtyOpenResult { pty_id, process_id })?)
    }

    async fn pty_input(&self, params: PtyInputParams) -> Result<Value> {
        let accepted_bytes = self.pty.input(&params.pty_id, &params.data).await?;
        Ok(json!({"accepted_bytes": accepted_bytes}))
    }

    async fn pty_resize(&self, params: PtyResizeParams) -> Result<Value> {
        self.pty
            .resize(&params.pty_id, params.cols, params.rows)
            .await?;
        Ok(json!({"ok": true}))
    }

    fn pty_close(&self, params: PtyCloseParams) -> Result<Value> {
        self.pty.close(&params.pty_id)?;
        Ok(json!({"ok": true}))
    }
}

/// Decode typed params, treating absent params as an empty object.
fn decode<T: DeserializeOwned>(params: Value) -> Result<T> {
    let params = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params
    };
    Ok(serde_json::from_value(params)?)
}
