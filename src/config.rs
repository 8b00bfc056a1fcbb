use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{hlog_debug, Error, Result};

pub const DEFAULT_WORKER_COMMAND: &str = "opencode serve --hostname 127.0.0.1 --port 0";
pub const DEFAULT_PORT_PATTERN: &str = r"(?i)listening on https?://[^\s:/]+:(\d+)";

/// Runtime configuration, read from `~/.herd/herd.toml`.
///
/// Every field is optional in the file; the accessors below supply
/// defaults so a missing or empty file behaves like a stock install.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Command launched inside each tmux session.
    pub worker_command: Option<String>,
    /// Regex with one capture group matching the worker's port announcement.
    pub port_pattern: Option<String>,
    /// Directory holding `agent-<task>.log` files.
    pub log_dir: Option<String>,
    pub tracker_command: Option<String>,
    pub claimed_status: Option<String>,
    pub close_status: Option<String>,
    pub worker_host: Option<String>,
    pub default_model: Option<String>,
    pub default_provider: Option<String>,
    pub port_timeout_secs: Option<u64>,
    pub port_poll_interval_ms: Option<u64>,
    pub http_timeout_secs: Option<u64>,
    pub tracker_timeout_secs: Option<u64>,
    pub reconstruct_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub message_text_limit: Option<usize>,
    pub capture_lines: Option<u16>,
}

impl Config {
    pub fn herd_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".herd"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::herd_dir()?.join("herd.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        hlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            hlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        hlog_debug!(
            "Config loaded: worker_command={:?} tracker_command={:?} log_dir={:?}",
            config.worker_command,
            config.tracker_command,
            config.log_dir
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let herd_dir = Self::herd_dir()?;
        if !herd_dir.exists() {
            fs::create_dir_all(&herd_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        hlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn worker_command(&self) -> Vec<String> {
        self.worker_command
            .as_deref()
            .unwrap_or(DEFAULT_WORKER_COMMAND)
            .split_whitespace()
            .map(String::from)
            .collect()
    }

    pub fn port_pattern(&self) -> &str {
        self.port_pattern.as_deref().unwrap_or(DEFAULT_PORT_PATTERN)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
    }

    /// Path of the combined-output log for one task.
    pub fn log_path(&self, task_id: &str) -> PathBuf {
        self.log_dir().join(format!("agent-{}.log", task_id))
    }

    pub fn tracker_command(&self) -> &str {
        self.tracker_command.as_deref().unwrap_or("bd")
    }

    pub fn claimed_status(&self) -> &str {
        self.claimed_status.as_deref().unwrap_or("in_progress")
    }

    pub fn close_status(&self) -> &str {
        self.close_status.as_deref().unwrap_or("closed")
    }

    pub fn worker_host(&self) -> &str {
        self.worker_host.as_deref().unwrap_or("localhost")
    }

    pub fn port_timeout(&self) -> Duration {
        Duration::from_secs(self.port_timeout_secs.unwrap_or(30))
    }

    pub fn port_poll_interval(&self) -> Duration {
        Duration::from_millis(self.port_poll_interval_ms.unwrap_or(500))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.unwrap_or(5))
    }

    pub fn tracker_timeout(&self) -> Duration {
        Duration::from_secs(self.tracker_timeout_secs.unwrap_or(15))
    }

    pub fn reconstruct_timeout(&self) -> Duration {
        Duration::from_secs(self.reconstruct_timeout_secs.unwrap_or(10))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(30))
    }

    pub fn message_text_limit(&self) -> usize {
        self.message_text_limit.unwrap_or(500)
    }

    pub fn capture_lines(&self) -> u16 {
        self.capture_lines.unwrap_or(50)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
