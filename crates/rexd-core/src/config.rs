//! Daemon configuration
//!
//! TOML configuration loaded once at startup. A missing file yields the
//! built-in defaults; a present but malformed file is a startup error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Transport selection and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Run the NDJSON stdio transport.
    #[serde(default = "default_true")]
    pub stdio: bool,
    /// Listen address for the HTTP/WS transport; empty disables it.
    #[serde(default)]
    pub http_listen: String,
    #[serde(default = "default_http_path")]
    pub http_path: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stdio: true,
            http_listen: String::new(),
            http_path: default_http_path(),
            ws_path: default_ws_path(),
            log_level: default_log_level(),
        }
    }
}

/// Resource ceilings enforced by the services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_hard_timeout_ms")]
    pub hard_timeout_ms: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
    #[serde(default = "default_max_file_read_bytes")]
    pub max_file_read_bytes: u64,
    #[serde(default = "default_max_processes_per_session")]
    pub max_processes_per_session: usize,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            hard_timeout_ms: default_hard_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
            max_file_read_bytes: default_max_file_read_bytes(),
            max_processes_per_session: default_max_processes_per_session(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
        }
    }
}

/// Workspace confinement and shell policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub allow_shell: bool,
    /// Allowed workspace roots. Empty list means fail-closed.
    #[serde(default)]
    pub allowed_roots: Vec<AllowedRoot>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allow_shell: true,
            allowed_roots: Vec::new(),
        }
    }
}

/// One allowed workspace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedRoot {
    pub path: String,
}

/// Audit log sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config {}", path.display()));
            }
        };
        toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Non-empty allowed root paths from the security section.
    #[must_use]
    pub fn allowed_roots(&self) -> Vec<PathBuf> {
        self.security
            .allowed_roots
            .iter()
            .filter(|root| !root.path.is_empty())
            .map(|root| PathBuf::from(&root.path))
            .collect()
    }
}

fn default_true() -> bool {
    true
}

fn default_http_path() -> String {
    "/rpc".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_hard_timeout_ms() -> u64 {
    300_000
}

fn default_max_output_bytes() -> u64 {
    1_048_576
}

fn default_max_file_read_bytes() -> u64 {
    1_048_576
}

fn default_max_processes_per_session() -> usize {
    8
}

fn default_max_concurrent_sessions() -> usize {
    16
}
