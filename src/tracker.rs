//! External issue tracker, driven through its CLI.
//!
//! Only four commands are used: `show`, `list --status`, `update` and
//! `sync`. The description field doubles as the durable store for dispatch
//! metadata (see [`crate::metadata`]).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::{hlog_debug, hlog_warn, Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerIssue {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: String,
}

/// Fields to change on one issue; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueUpdate {
    pub status: Option<String>,
    pub description: Option<String>,
}

impl IssueUpdate {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            description: None,
        }
    }

    pub fn description(description: impl Into<String>) -> Self {
        Self {
            status: None,
            description: Some(description.into()),
        }
    }
}

#[async_trait]
pub trait Tracker: Send + Sync {
    async fn show(&self, id: &str) -> Result<TrackerIssue>;

    /// List issues in `status`. The call is abandoned (and the child killed)
    /// once `deadline` elapses.
    async fn list_by_status(&self, status: &str, deadline: Duration) -> Result<Vec<TrackerIssue>>;

    async fn update(&self, id: &str, update: &IssueUpdate) -> Result<()>;

    async fn sync(&self) -> Result<()>;
}

/// Tracker backed by the `bd` command line.
#[derive(Debug, Clone)]
pub struct BeadsCli {
    program: String,
    cwd: PathBuf,
    timeout: Duration,
}

impl BeadsCli {
    pub fn new(program: impl Into<String>, cwd: &Path, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            cwd: cwd.to_path_buf(),
            timeout,
        }
    }

    pub fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    async fn run(&self, args: &[&str], deadline: Duration) -> Result<String> {
        hlog_debug!("{} {}", self.program, args.join(" "));
        let child = Command::new(&self.program)
            .args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(deadline, child)
            .await
            .map_err(|_| Error::Timeout(deadline))??;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            hlog_warn!("{} {} failed: {}", self.program, args.join(" "), stderr);
            return Err(Error::Tracker(format!(
                "`{} {}` exited with {}: {}",
                self.program,
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Tracker for BeadsCli {
    async fn show(&self, id: &str) -> Result<TrackerIssue> {
        let stdout = self.run(&["show", id, "--json"], self.timeout).await?;
        parse_issues(&stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    async fn list_by_status(&self, status: &str, deadline: Duration) -> Result<Vec<TrackerIssue>> {
        let stdout = self
            .run(&["list", "--status", status, "--json"], deadline)
            .await?;
        parse_issues(&stdout)
    }

    async fn update(&self, id: &str, update: &IssueUpdate) -> Result<()> {
        let mut args = vec!["update", id];
        if let Some(status) = update.status.as_deref() {
            args.extend(["--status", status]);
        }
        if let Some(description) = update.description.as_deref() {
            args.extend(["--description", description]);
        }
        if args.len() == 2 {
            return Ok(());
        }
        self.run(&args, self.timeout).await.map(|_| ())
    }

    async fn sync(&self) -> Result<()> {
        self.run(&["sync"], self.timeout).await.map(|_| ())
    }
}

/// `bd` prints either a single object or an array; empty output is no issues.
pub fn parse_issues(stdout: &str) -> Result<Vec<TrackerIssue>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_str(trimmed)?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(Error::from))
            .collect(),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}
