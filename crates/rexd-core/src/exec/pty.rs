//! Pseudo-terminal sessions
//!
//! Allocates a PTY pair, attaches a child to the slave, and streams the
//! master's output as `pty.output` notifications. Input and resize requests
//! go through the master's write half; a waiter publishes `pty.exit` and
//! tears the entry down when the child goes away.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::session::{rand_hex, SessionRegistry};

/// Window size applied when the client passes zero columns.
const DEFAULT_COLS: u16 = 120;
/// Window size applied when the client passes zero rows.
const DEFAULT_ROWS: u16 = 32;
/// Per-line buffer ceiling, matching the exec stream pumps.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One open PTY tracked by the manager.
#[derive(Debug)]
pub struct PtySession {
    pub id: String,
    pub process_id: String,
    pub session_id: String,
    pid: i32,
    writer: tokio::sync::Mutex<pty_process::OwnedWritePty>,
    pub cols: u16,
    pub rows: u16,
    started: Instant,
}

/// Inputs for [`PtyManager::open`], already policy-resolved by the
/// dispatcher.
#[derive(Debug, Clone)]
pub struct PtySpawnSpec {
    pub session_id: String,
    pub argv: Vec<String>,
    pub shell: bool,
    pub command: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// Registry and lifecycle driver for PTY sessions.
#[derive(Debug)]
pub struct PtyManager {
    ptys: Arc<RwLock<HashMap<String, Arc<PtySession>>>>,
    bus: EventBus,
    sessions: Arc<SessionRegistry>,
    max_per_session: usize,
}

impl PtyManager {
    #[must_use]
    pub fn new(bus: EventBus, sessions: Arc<SessionRegistry>, max_per_session: usize) -> Self {
        Self {
            ptys: Arc::new(RwLock::new(HashMap::new())),
            bus,
            sessions,
            max_per_session,
        }
    }

    /// Number of PTYs currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ptys.read().expect("pty registry poisoned").len()
    }

    /// True when no PTYs are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a PTY, spawn the child on the slave, and start the reader
    /// and waiter tasks. Returns `(pty_id, process_id)`.
    pub async fn open(&self, spec: PtySpawnSpec) -> Result<(String, String)> {
        let session = self.sessions.get(&spec.session_id)?;
        if session.process_count >= self.max_per_session {
            return Err(Error::ResourceLimit(
                "max processes per session reached".to_string(),
            ));
        }
        if !spec.shell && spec.argv.is_empty() {
            return Err(Error::InvalidParams("argv is required".to_string()));
        }
        if spec.shell && spec.command.is_empty() {
            return Err(Error::InvalidParams(
                "command is required when shell=true".to_string(),
            ));
        }

        let (pty, pts) = pty_process::open().map_err(pty_error)?;
        let cols = if spec.cols == 0 { DEFAULT_COLS } else { spec.cols };
        let rows = if spec.rows == 0 { DEFAULT_ROWS } else { spec.rows };
        pty.resize(pty_process::Size::new(rows, cols))
            .map_err(pty_error)?;

        // Builder pattern: each method consumes self.
        let mut cmd = if spec.shell {
            pty_process::Command::new("sh").args(["-lc", spec.command.as_str()])
        } else {
            pty_process::Command::new(&spec.argv[0]).args(spec.argv[1..].iter())
        }
        .env_clear()
        .current_dir(&spec.cwd);
        for (key, value) in &spec.env {
            cmd = cmd.env(key, value);
        }
        let mut child = cmd.spawn(pts).map_err(pty_error)?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Io(std::io::Error::other("pty child has no pid")))?
            as i32;

        let (read_half, write_half) = pty.into_split();
        let pty_session = Arc::new(PtySession {
            id: format!("pty_{}", rand_hex(8)),
            process_id: format!("p_{}", rand_hex(8)),
            session_id: spec.session_id.clone(),
            pid,
            writer: tokio::sync::Mutex::new(write_half),
            cols,
            rows,
            started: Instant::now(),
        });
        self.sessions.inc_process(&spec.session_id)?;
        self.ptys
            .write()
            .expect("pty registry poisoned")
            .insert(pty_session.id.clone(), Arc::clone(&pty_session));
        debug!(
            pty_id = %pty_session.id,
            session_id = %spec.session_id,
            pid,
            cols,
            rows,
            "pty opened"
        );

        // Reader: line-scan the master until EOF/EIO.
        let reader_session = Arc::clone(&pty_session);
        let reader_bus = self.bus.clone();
        let reader = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line: Vec<u8> = Vec::new();
            let mut seq: u64 = 0;
            loop {
                line.clear();
                let read = (&mut reader)
                    .take(MAX_LINE_BYTES as u64 + 1)
                    .read_until(b'\n', &mut line)
                    .await;
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                if line.len() > MAX_LINE_BYTES {
                    warn!(pty_id = %reader_session.id, "pty line exceeds 1 MiB, abandoning stream");
                    break;
                }
                seq += 1;
                reader_bus.publish(
                    &reader_session.session_id,
                    "pty.output",
                    json!({
                        "session_id": reader_session.session_id,
                        "pty_id": reader_session.id,
                        "process_id": reader_session.process_id,
                        "seq": seq,
                        "data": String::from_utf8_lossy(&line),
                        "encoding": "utf8",
                    }),
                );
            }
        });

        // Waiter: publish pty.exit after the reader drains, then drop the
        // registry entry (closing the master) and release the slot.
        let waiter_session = Arc::clone(&pty_session);
        let waiter_bus = self.bus.clone();
        let sessions = Arc::clone(&self.sessions);
        let ptys = Arc::clone(&self.ptys);
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = reader.await;
            let (exit_code, signal) = exit_parts(status);
            debug!(pty_id = %waiter_session.id, exit_code, "pty child exited");
            waiter_bus.publish(
                &waiter_session.session_id,
                "pty.exit",
                json!({
                    "session_id": waiter_session.session_id,
                    "pty_id": waiter_session.id,
                    "process_id": waiter_session.process_id,
                    "exit_code": exit_code,
                    "signal": signal,
                    "duration_ms": waiter_session.started.elapsed().as_millis() as u64,
                }),
            );
            ptys.write()
                .expect("pty registry poisoned")
                .remove(&waiter_session.id);
            let _ = sessions.dec_process(&waiter_session.session_id);
        });

        Ok((pty_session.id.clone(), pty_session.process_id.clone()))
    }

    fn get(&self, pty_id: &str) -> Result<Arc<PtySession>> {
        self.ptys
            .read()
            .expect("pty registry poisoned")
            .get(pty_id)
            .cloned()
            .ok_or_else(|| Error::ProcessNotFound(pty_id.to_string()))
    }

    /// Write raw bytes to the master. Returns the accepted byte count.
    pub async fn input(&self, pty_id: &str, data: &str) -> Result<usize> {
        let pty = self.get(pty_id)?;
        let mut writer = pty.writer.lock().await;
        writer.write_all(data.as_bytes()).await?;
        writer.flush().await?;
        Ok(data.len())
    }

    /// Apply a new window size to the PTY.
    pub async fn resize(&self, pty_id: &str, cols: u16, rows: u16) -> Result<()> {
        let pty = self.get(pty_id)?;
        let writer = pty.writer.lock().await;
        writer
            .resize(pty_process::Size::new(rows, cols))
            .map_err(pty_error)
    }

    /// Kill the child; the waiter publishes `pty.exit` and closes the
    /// master.
    pub fn close(&self, pty_id: &str) -> Result<()> {
        let pty = self.get(pty_id)?;
        if let Err(err) = kill(Pid::from_raw(pty.pid), Signal::SIGKILL) {
            debug!(pty_id = %pty.id, %err, "pty kill failed");
        }
        Ok(())
    }
}

fn exit_parts(status: std::io::Result<std::process::ExitStatus>) -> (i32, Option<String>) {
    match status {
        Ok(exit) => {
            use std::os::unix::process::ExitStatusExt;
            if let Some(code) = exit.code() {
                (code, None)
            } else if let Some(signum) = exit.signal() {
                let signal = Signal::try_from(signum)
                    .map(|signal| signal.as_str().to_string())
                    .ok();
                (-1, signal)
            } else {
                (-1, None)
            }
        }
        Err(_) => (-1, None),
    }
}

fn pty_error(err: pty_process::Error) -> Error {
    Error::Io(std::io::Error::other(err))
}
