use std::path::Path;

use chrono::Utc;
use regex::Regex;

use super::{DispatchOutcome, Orchestrator};
use crate::lifecycle::LifecycleEvent;
use crate::metadata::{self, DispatchMetadata};
use crate::registry::{AgentEntry, NO_WORKSPACE_LABEL};
use crate::tmux::{session_name_for, SessionSpec};
use crate::tracker::{IssueUpdate, TrackerIssue};
use crate::util::BestEffort;
use crate::{hlog, hlog_debug, hlog_error, Error, Result};

/// What to dispatch and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchRequest {
    pub task_id: String,
    pub prompt: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    /// Workspace label; defaults to the task id.
    pub branch: Option<String>,
    /// Run in the workspace root instead of a fresh worktree.
    pub skip_workspace: bool,
}

impl DispatchRequest {
    pub fn new(task_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn model(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn branch(mut self, label: impl Into<String>) -> Self {
        self.branch = Some(label.into());
        self
    }

    pub fn skip_workspace(mut self) -> Self {
        self.skip_workspace = true;
        self
    }
}

impl Orchestrator {
    /// Launch a worker for a task and register it.
    ///
    /// Already-registered tasks come back as [`DispatchOutcome::Duplicate`]
    /// without touching anything. A failure part way through leaves no entry
    /// behind; side effects of the completed steps are not undone.
    pub async fn dispatch(&self, request: DispatchRequest) -> DispatchOutcome {
        let task_id = request.task_id.clone();
        if task_id.trim().is_empty() {
            return DispatchOutcome::Failed {
                task_id,
                error: "task id must not be empty".to_string(),
            };
        }

        if let Some(entry) = self.registry.get(&task_id) {
            hlog_debug!("dispatch {}: already registered", task_id);
            return DispatchOutcome::Duplicate { entry };
        }

        let Some(_admission) = self.registry.admit(&task_id) else {
            return DispatchOutcome::Failed {
                error: format!("dispatch already in progress for {}", task_id),
                task_id,
            };
        };
        // A dispatch holding the admission may have finished just before us.
        if let Some(entry) = self.registry.get(&task_id) {
            return DispatchOutcome::Duplicate { entry };
        }

        match self.run_dispatch(&request).await {
            Ok(entry) => DispatchOutcome::Dispatched { entry },
            Err(e) => {
                let error = e.to_string();
                hlog_error!("dispatch {} failed: {}", task_id, error);
                self.events
                    .emit(LifecycleEvent::errored(&task_id, error.clone()));
                DispatchOutcome::Failed { task_id, error }
            }
        }
    }

    async fn run_dispatch(&self, request: &DispatchRequest) -> Result<AgentEntry> {
        let task_id = request.task_id.as_str();

        let issue: BestEffort<TrackerIssue> = self.tracker.show(task_id).await.into();
        // `None` when the current description is unknown; never write over it blind.
        let (prompt, description) = match issue {
            BestEffort::Done(issue) => (augment_prompt(&issue, &request.prompt), Some(issue.description)),
            BestEffort::Degraded(reason) => {
                hlog_debug!("dispatch {}: no task context ({})", task_id, reason);
                (request.prompt.clone(), None)
            }
        };

        self.tracker
            .update(task_id, &IssueUpdate::status(self.config.claimed_status()))
            .await?;
        self.events.emit(LifecycleEvent::claimed(task_id));

        let (workspace_path, branch_label) = if request.skip_workspace {
            (self.workspace_root.clone(), NO_WORKSPACE_LABEL.to_string())
        } else {
            let label = request.branch.clone().unwrap_or_else(|| task_id.to_string());
            if label.trim().is_empty() || label == NO_WORKSPACE_LABEL {
                return Err(Error::Validation(format!("Invalid branch label '{}'", label)));
            }
            let path = self.workspaces.create(&self.workspace_root, &label).await?;
            (path, label)
        };

        let supervisor_session = session_name_for(task_id);
        let log_path = self.config.log_path(task_id);
        reset_log(&log_path).await?;
        self.supervisor
            .create_session(&SessionSpec {
                name: supervisor_session.clone(),
                cwd: workspace_path.clone(),
                command: self.config.worker_command(),
                output_log: Some(log_path.clone()),
            })
            .await?;

        let port = self.discover_port(&log_path).await?;
        hlog_debug!("dispatch {}: worker on port {}", task_id, port);

        let session_id = self.worker.create_session(port).await?;
        let model = self.model_selector(request.provider.as_deref(), request.model.as_deref());
        self.worker
            .prompt_async(port, &session_id, &prompt, model.as_ref())
            .await?;

        let description = match description {
            Some(description) => description,
            None => self.tracker.show(task_id).await?.description,
        };
        let record = DispatchMetadata::new(port, supervisor_session.as_str(), session_id.as_str());
        self.tracker
            .update(task_id, &IssueUpdate::description(record.embed(&description)))
            .await?;

        let entry = AgentEntry {
            task_id: task_id.to_string(),
            control_port: port,
            session_id,
            supervisor_session,
            workspace_path,
            branch_label,
            dispatched_at: Utc::now(),
        };
        self.registry.set(task_id, entry.clone());
        self.events
            .emit(LifecycleEvent::running(task_id, &entry.branch_label, port));
        hlog!("Dispatched {} on port {} ({})", task_id, port, entry.branch_label);
        Ok(entry)
    }

    /// Wait for the worker to announce its port in the log file.
    async fn discover_port(&self, log_path: &Path) -> Result<u16> {
        let limit = self.config.port_timeout();
        let interval = self.config.port_poll_interval();
        let wait = async {
            loop {
                if let Ok(bytes) = tokio::fs::read(log_path).await {
                    if let Some(port) = find_port(&self.port_pattern, &String::from_utf8_lossy(&bytes)) {
                        return port;
                    }
                }
                tokio::time::sleep(interval).await;
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| Error::Timeout(limit))
    }
}

/// First valid, non-zero port announced in `text`.
pub fn find_port(pattern: &Regex, text: &str) -> Option<u16> {
    pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
        .find(|port| *port != 0)
}

fn augment_prompt(issue: &TrackerIssue, prompt: &str) -> String {
    let mut context = String::new();
    if !issue.title.trim().is_empty() {
        context.push_str(&format!("Task {}: {}", issue.id, issue.title.trim()));
    }
    let body = metadata::strip(&issue.description);
    if !body.trim().is_empty() {
        if !context.is_empty() {
            context.push_str("\n\n");
        }
        context.push_str(body.trim());
    }
    if context.is_empty() {
        prompt.to_string()
    } else {
        format!("{}\n\n{}", context, prompt)
    }
}

async fn reset_log(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, b"").await?;
    Ok(())
}
