//! Process supervisor adapter over tmux.
//!
//! Workers run inside detached tmux sessions so they outlive the
//! coordinating process. The [`Supervisor`] trait is the seam the
//! orchestrator talks to; [`Tmux`] is the real implementation.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::{hlog_debug, hlog_trace, hlog_warn, Error, Result};

/// Everything needed to start one worker session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSpec {
    pub name: String,
    pub cwd: PathBuf,
    pub command: Vec<String>,
    /// Combined stdout/stderr is appended here when set.
    pub output_log: Option<PathBuf>,
}

#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn create_session(&self, spec: &SessionSpec) -> Result<()>;

    /// Liveness probe. Any failure to ask counts as "not alive".
    async fn session_exists(&self, name: &str) -> bool;

    /// Killing a session that is already gone is not an error.
    async fn kill_session(&self, name: &str) -> Result<()>;

    async fn capture_tail(&self, name: &str, lines: u16) -> Result<String>;
}

#[derive(Debug, Clone, Default)]
pub struct Tmux;

impl Tmux {
    pub fn is_available() -> bool {
        which::which("tmux").is_ok()
    }

    /// Shell command line tmux runs for a spec.
    pub fn shell_command(spec: &SessionSpec) -> Result<String> {
        if spec.command.is_empty() {
            return Err(Error::Validation("Command cannot be empty".to_string()));
        }
        let cmd_str = spec
            .command
            .iter()
            .map(|s| shell_escape(s))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(match &spec.output_log {
            Some(log) => format!(
                "{} >> {} 2>&1",
                cmd_str,
                shell_escape(&log.display().to_string())
            ),
            None => cmd_str,
        })
    }
}

#[async_trait]
impl Supervisor for Tmux {
    async fn create_session(&self, spec: &SessionSpec) -> Result<()> {
        let cmd_str = Self::shell_command(spec)?;
        hlog_debug!(
            "Tmux::create_session name={} cwd={} cmd={}",
            spec.name,
            spec.cwd.display(),
            cmd_str
        );
        let output = Command::new("tmux")
            .args([
                "new-session",
                "-d",
                "-s",
                &spec.name,
                "-c",
                &spec.cwd.display().to_string(),
                &cmd_str,
            ])
            .output()
            .await?;

        if !output.status.success() {
            let err = format!(
                "Failed to create session '{}': {}",
                spec.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            hlog_warn!("tmux create_session failed: {}", err);
            return Err(Error::Tmux(err));
        }
        hlog_debug!("Tmux session created: {}", spec.name);
        Ok(())
    }

    async fn session_exists(&self, name: &str) -> bool {
        Command::new("tmux")
            .args(["has-session", "-t", &exact_target(name)])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        hlog_debug!("Tmux::kill_session name={}", name);
        let output = Command::new("tmux")
            .args(["kill-session", "-t", &exact_target(name)])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !is_missing_session(&stderr) {
                hlog_warn!("Failed to kill tmux session '{}': {}", name, stderr);
                return Err(Error::Tmux(format!(
                    "Failed to kill session '{}': {}",
                    name,
                    stderr.trim()
                )));
            }
            hlog_debug!("Tmux session '{}' not found (already dead?)", name);
        }
        Ok(())
    }

    async fn capture_tail(&self, name: &str, lines: u16) -> Result<String> {
        hlog_trace!("Tmux::capture_tail name={} lines={}", name, lines);
        let start = format!("-{}", lines);
        let output = Command::new("tmux")
            .args(["capture-pane", "-t", &pane_target(name), "-p", "-S", &start])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Tmux(format!(
                "Failed to capture pane tail '{}': {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Session name for a task id.
///
/// tmux reads `.` and `:` as window/pane separators and a hyphen followed by
/// a digit as a relative index, so those are replaced with `_`.
pub fn session_name_for(task_id: &str) -> String {
    let chars: Vec<char> = task_id.chars().collect();
    chars
        .iter()
        .enumerate()
        .map(|(i, &c)| match c {
            '.' | ':' => '_',
            '-' if chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) => '_',
            other => other,
        })
        .collect()
}

/// Best-effort inverse of [`session_name_for`].
///
/// Only the hyphen-before-digit rewrite is undone. The mapping is lossy:
/// `.` and `:` come back as `-` when a digit follows and as `_` otherwise
/// (`proj-12.3` gives `proj-12-3`), and an id that already held `_` before a
/// digit comes back with `-` (`job_1` gives `job-1`). Callers must treat the
/// result as a guess.
pub fn label_from_session_name(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    chars
        .iter()
        .enumerate()
        .map(|(i, &c)| match c {
            '_' if chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) => '-',
            other => other,
        })
        .collect()
}

// `=name` makes tmux match the session name exactly instead of by prefix.
fn exact_target(name: &str) -> String {
    format!("={}", name)
}

// Active pane of the exactly-named session.
fn pane_target(name: &str) -> String {
    format!("={}:", name)
}

fn is_missing_session(stderr: &str) -> bool {
    stderr.contains("session not found")
        || stderr.contains("can't find session")
        || stderr.contains("no server running")
}

fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '='))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
