//! Child process execution
//!
//! Spawns children with piped stdio, streams their output as per-line
//! notifications, and enforces byte and time budgets. Each process runs
//! three auxiliary tasks: one pump per output stream, a timeout watchdog,
//! and a waiter that assembles the terminal state and publishes `exec.exit`
//! strictly after both pumps have drained.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LimitsConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::session::{rand_hex, SessionRegistry};

/// Maximum bytes buffered for a single output line before the pump gives up
/// on the stream.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Terminal status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Exited,
    Killed,
    Running,
}

impl ProcessStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exited => "exited",
            Self::Killed => "killed",
            Self::Running => "running",
        }
    }
}

/// Terminal state of a process, produced exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessState {
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub bytes_stdout: u64,
    pub bytes_stderr: u64,
    pub timed_out: bool,
}

impl ProcessState {
    /// State reported when a wait timer fires before the process exits.
    #[must_use]
    pub fn running() -> Self {
        Self {
            status: ProcessStatus::Running,
            exit_code: None,
            signal: None,
            bytes_stdout: 0,
            bytes_stderr: 0,
            timed_out: false,
        }
    }
}

/// Which output stream a pump serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn method(self) -> &'static str {
        match self {
            Self::Stdout => "exec.stdout",
            Self::Stderr => "exec.stderr",
        }
    }
}

#[derive(Debug, Default)]
struct StreamCounters {
    bytes_stdout: u64,
    bytes_stderr: u64,
    stdout_seq: u64,
    stderr_seq: u64,
    timed_out: bool,
}

/// A spawned child tracked by the manager. Mutable counters sit behind a
/// lock held only across counter updates, never across I/O.
#[derive(Debug)]
pub struct RunningProcess {
    pub id: String,
    pub session_id: String,
    pid: i32,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pub started_at: DateTime<Utc>,
    started: Instant,
    max_output: u64,
    pub detached: bool,
    counters: Mutex<StreamCounters>,
    cancel_timeout: CancellationToken,
    exit_rx: tokio::sync::Mutex<Option<oneshot::Receiver<ProcessState>>>,
}

impl RunningProcess {
    fn mark_timed_out(&self) {
        self.counters.lock().expect("counters poisoned").timed_out = true;
    }

    fn send_signal(&self, signal: Signal) {
        if let Err(err) = kill(Pid::from_raw(self.pid), signal) {
            debug!(process_id = %self.id, %err, "signal delivery failed");
        }
    }
}

/// Inputs for [`ProcessManager::start`], already policy-resolved by the
/// dispatcher.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub session_id: String,
    pub argv: Vec<String>,
    pub shell: bool,
    pub command: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub inherit_env: bool,
    pub stdin: String,
    pub timeout_ms: u64,
    pub max_output_bytes: u64,
    pub detach: bool,
}

/// Registry and lifecycle driver for child processes.
#[derive(Debug)]
pub struct ProcessManager {
    processes: Arc<RwLock<HashMap<String, Arc<RunningProcess>>>>,
    bus: EventBus,
    sessions: Arc<SessionRegistry>,
    limits: LimitsConfig,
}

impl ProcessManager {
    #[must_use]
    pub fn new(bus: EventBus, sessions: Arc<SessionRegistry>, limits: LimitsConfig) -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            bus,
            sessions,
            limits,
        }
    }

    /// Number of processes currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.read().expect("process registry poisoned").len()
    }

    /// True when no processes are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn a child and start its pump, watchdog, and waiter tasks.
    /// Returns the process ID and start timestamp.
    pub async fn start(&self, spec: SpawnSpec) -> Result<(String, DateTime<Utc>)> {
        let session = self.sessions.get(&spec.session_id)?;
        if session.process_count >= self.limits.max_processes_per_session {
            return Err(Error::ResourceLimit(
                "max processes per session reached".to_string(),
            ));
        }

        let mut cmd = if spec.shell {
            if spec.command.is_empty() {
                return Err(Error::InvalidParams(
                    "command is required when shell=true".to_string(),
                ));
            }
            let mut cmd = Command::new("sh");
            cmd.arg("-lc").arg(&spec.command);
            cmd
        } else {
            if spec.argv.is_empty() {
                return Err(Error::InvalidParams("argv is required".to_string()));
            }
            let mut cmd = Command::new(&spec.argv[0]);
            cmd.args(&spec.argv[1..]);
            cmd
        };
        cmd.current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !spec.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&spec.env);

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Io(std::io::Error::other("child has no pid")))?
            as i32;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("missing stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("missing stderr pipe")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("missing stdin pipe")))?;

        self.sessions.inc_process(&spec.session_id)?;

        let mut timeout_ms = spec.timeout_ms;
        if timeout_ms == 0 {
            timeout_ms = self.limits.default_timeout_ms;
        }
        timeout_ms = timeout_ms.min(self.limits.hard_timeout_ms);
        let max_output = if spec.max_output_bytes == 0 {
            self.limits.max_output_bytes
        } else {
            spec.max_output_bytes
        };

        let (exit_tx, exit_rx) = oneshot::channel();
        let process = Arc::new(RunningProcess {
            id: format!("p_{}", rand_hex(8)),
            session_id: spec.session_id.clone(),
            pid,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            started_at: Utc::now(),
            started: Instant::now(),
            max_output,
            detached: spec.detach,
            counters: Mutex::new(StreamCounters::default()),
            cancel_timeout: CancellationToken::new(),
            exit_rx: tokio::sync::Mutex::new(Some(exit_rx)),
        });
        self.processes
            .write()
            .expect("process registry poisoned")
            .insert(process.id.clone(), Arc::clone(&process));
        debug!(
            process_id = %process.id,
            session_id = %process.session_id,
            pid,
            timeout_ms,
            max_output,
            "process started"
        );

        let stdout_pump = tokio::spawn(pump_stream(
            Arc::clone(&process),
            self.bus.clone(),
            stdout,
            StreamKind::Stdout,
        ));
        let stderr_pump = tokio::spawn(pump_stream(
            Arc::clone(&process),
            self.bus.clone(),
            stderr,
            StreamKind::Stderr,
        ));

        if !spec.stdin.is_empty() {
            let mut guard = process.stdin.lock().await;
            if let Some(handle) = guard.as_mut() {
                let _ = handle.write_all(spec.stdin.as_bytes()).await;
            }
            *guard = None;
        }

        // Timeout watchdog: a natural exit cancels the token first.
        let watchdog = Arc::clone(&process);
        let cancel = process.cancel_timeout.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                    warn!(process_id = %watchdog.id, timeout_ms, "process timed out, killing");
                    watchdog.mark_timed_out();
                    watchdog.send_signal(Signal::SIGKILL);
                }
            }
        });

        // Waiter: exit state is assembled and published only after both
        // pumps have returned, so exec.exit is the last notification.
        let waiter = Arc::clone(&process);
        let bus = self.bus.clone();
        let sessions = Arc::clone(&self.sessions);
        let processes = Arc::clone(&self.processes);
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = stdout_pump.await;
            let _ = stderr_pump.await;
            waiter.cancel_timeout.cancel();

            let state = assemble_state(&waiter, status);
            debug!(
                process_id = %waiter.id,
                status = state.status.as_str(),
                exit_code = ?state.exit_code,
                timed_out = state.timed_out,
                "process exited"
            );
            let _ = exit_tx.send(state.clone());
            bus.publish(
                &waiter.session_id,
                "exec.exit",
                json!({
                    "session_id": waiter.session_id,
                    "process_id": waiter.id,
                    "exit_code": state.exit_code,
                    "signal": state.signal,
                    "timed_out": state.timed_out,
                    "duration_ms": waiter.started.elapsed().as_millis() as u64,
                    "bytes_stdout": state.bytes_stdout,
                    "bytes_stderr": state.bytes_stderr,
                }),
            );
            processes
                .write()
                .expect("process registry poisoned")
                .remove(&waiter.id);
            let _ = sessions.dec_process(&waiter.session_id);
        });

        Ok((process.id.clone(), process.started_at))
    }

    fn get(&self, process_id: &str) -> Result<Arc<RunningProcess>> {
        self.processes
            .read()
            .expect("process registry poisoned")
            .get(process_id)
            .cloned()
            .ok_or_else(|| Error::ProcessNotFound(process_id.to_string()))
    }

    /// Race the exit slot against a timer. The slot is single-shot: only the
    /// first receipt observes the terminal state; once the process has been
    /// reaped and removed, later calls see ProcessNotFound.
    pub async fn wait(&self, process_id: &str, timeout_ms: u64) -> Result<ProcessState> {
        let process = self.get(process_id)?;
        let timeout_ms = if timeout_ms == 0 {
            self.limits.default_timeout_ms
        } else {
            timeout_ms
        };
        let receiver = process.exit_rx.lock().await.take();
        let Some(mut receiver) = receiver else {
            // Another waiter holds the slot.
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            return Ok(ProcessState::running());
        };
        tokio::select! {
            state = &mut receiver => {
                state.map_err(|_| Error::ProcessNotFound(process_id.to_string()))
            }
            () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                *process.exit_rx.lock().await = Some(receiver);
                Ok(ProcessState::running())
            }
        }
    }

    /// Deliver a signal by name: "KILL" maps to SIGKILL, anything else to
    /// SIGTERM.
    pub fn kill(&self, process_id: &str, signal: &str) -> Result<()> {
        let process = self.get(process_id)?;
        let signal = if signal == "KILL" {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        kill(Pid::from_raw(process.pid), signal)
            .map_err(|err| Error::InvalidParams(format!("failed to signal process: {err}")))
    }

    /// Write to the child's stdin; `eof` closes the handle afterwards.
    /// Returns the accepted byte count.
    pub async fn input(&self, process_id: &str, data: &str, eof: bool) -> Result<usize> {
        let process = self.get(process_id)?;
        let mut guard = process.stdin.lock().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| Error::InvalidParams("stdin is closed".to_string()))?;
        handle.write_all(data.as_bytes()).await?;
        handle.flush().await?;
        if eof {
            *guard = None;
        }
        Ok(data.len())
    }
}

/// Line-scan one output stream, counting bytes and publishing per-line
/// notifications until EOF, an over-long line, or the output cap.
async fn pump_stream<R>(
    process: Arc<RunningProcess>,
    bus: EventBus,
    stream: R,
    kind: StreamKind,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line: Vec<u8> = Vec::new();
    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(process_id = %process.id, %err, "stream read failed");
                break;
            }
        }
        if line.len() > MAX_LINE_BYTES {
            warn!(process_id = %process.id, "output line exceeds 1 MiB, abandoning stream");
            break;
        }
        let (seq, over_cap) = {
            let mut counters = process.counters.lock().expect("counters poisoned");
            let seq = match kind {
                StreamKind::Stdout => {
                    counters.stdout_seq += 1;
                    counters.bytes_stdout += line.len() as u64;
                    counters.stdout_seq
                }
                StreamKind::Stderr => {
                    counters.stderr_seq += 1;
                    counters.bytes_stderr += line.len() as u64;
                    counters.stderr_seq
                }
            };
            let total = counters.bytes_stdout + counters.bytes_stderr;
            let over_cap = process.max_output > 0 && total > process.max_output;
            if over_cap {
                counters.timed_out = true;
            }
            (seq, over_cap)
        };
        if over_cap {
            warn!(process_id = %process.id, "output limit exceeded, killing");
            process.send_signal(Signal::SIGKILL);
            break;
        }
        bus.publish(
            &process.session_id,
            kind.method(),
            json!({
                "session_id": process.session_id,
                "process_id": process.id,
                "seq": seq,
                "data": String::from_utf8_lossy(&line),
                "encoding": "utf8",
            }),
        );
    }
}

fn assemble_state(
    process: &RunningProcess,
    status: std::io::Result<std::process::ExitStatus>,
) -> ProcessState {
    let counters = process.counters.lock().expect("counters poisoned");
    let mut state = ProcessState {
        status: ProcessStatus::Exited,
        exit_code: None,
        signal: None,
        bytes_stdout: counters.bytes_stdout,
        bytes_stderr: counters.bytes_stderr,
        timed_out: counters.timed_out,
    };
    match status {
        Ok(exit) => {
            use std::os::unix::process::ExitStatusExt;
            if let Some(code) = exit.code() {
                state.exit_code = Some(code);
            } else if let Some(signum) = exit.signal() {
                state.status = ProcessStatus::Killed;
                state.exit_code = Some(-1);
                state.signal = Signal::try_from(signum)
                    .map(|signal| signal.as_str().to_string())
                    .ok();
            }
        }
        Err(_) => {
            state.status = ProcessStatus::Killed;
            state.exit_code = Some(-1);
        }
    }
    state
}
