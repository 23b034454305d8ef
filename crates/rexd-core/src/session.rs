//! Session registry
//!
//! Tracks open client sessions: workspace roots, current working directory,
//! and the number of processes/PTYs they own. All operations take one lock
//! and never await while holding it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rand::RngCore;

use crate::error::{Error, Result};

/// One open client session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub client_name: String,
    pub client_version: String,
    pub workspace_roots: Vec<String>,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Running processes plus open PTYs owned by this session.
    pub process_count: usize,
}

/// Registry of live sessions with a configurable concurrency cap.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    max_active: usize,
}

impl SessionRegistry {
    /// Create a registry; `max_active == 0` disables the cap.
    #[must_use]
    pub fn new(max_active: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_active,
        }
    }

    /// Open a new session. `cwd` starts at the first workspace root, or `/`
    /// when no roots are granted.
    pub fn open(
        &self,
        client_name: &str,
        client_version: &str,
        roots: Vec<String>,
    ) -> Result<Session> {
        let mut sessions = self.sessions.write().expect("session registry poisoned");
        if self.max_active > 0 && sessions.len() >= self.max_active {
            return Err(Error::ResourceLimit(
                "max concurrent sessions reached".to_string(),
            ));
        }
        let id = format!("s_{}", rand_hex(6));
        let cwd = roots
            .first()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        let session = Session {
            id: id.clone(),
            client_name: client_name.to_string(),
            client_version: client_version.to_string(),
            workspace_roots: roots,
            cwd,
            created_at: Utc::now(),
            process_count: 0,
        };
        sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Look up a session by ID; returns a snapshot of the record.
    pub fn get(&self, id: &str) -> Result<Session> {
        let sessions = self.sessions.read().expect("session registry poisoned");
        sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Remove a session. Running processes and PTYs are left running; their
    /// exit events are dropped by the bus once nothing is subscribed.
    pub fn close(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().expect("session registry poisoned");
        sessions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .expect("session registry poisoned")
            .len()
    }

    /// True when no sessions are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Increment the owning session's process count.
    pub fn inc_process(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().expect("session registry poisoned");
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.process_count += 1;
        Ok(())
    }

    /// Decrement the owning session's process count; saturates at zero.
    pub fn dec_process(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().expect("session registry poisoned");
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.process_count = session.process_count.saturating_sub(1);
        Ok(())
    }
}

/// Random lowercase hex token, `bytes * 2` digits long.
#[must_use]
pub fn rand_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}
