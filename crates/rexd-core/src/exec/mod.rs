//! Child process and PTY execution

pub mod process;
pub mod pty;

pub use process::{ProcessManager, ProcessState, ProcessStatus, RunningProcess, SpawnSpec};
pub use pty::{PtyManager, PtySession, PtySpawnSpec};
