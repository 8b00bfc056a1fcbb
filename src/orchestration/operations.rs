//! Operations on registered workers: check, followup, abort, cleanup, list.

use std::io::ErrorKind;

use futures::future::join_all;

use super::{
    AgentSummary, CheckOutcome, CheckReport, CleanupOutcome, CleanupReport, CleanupStep,
    CommandOutcome, DegradedCheck, MessageSummary, Orchestrator, StepResult,
};
use crate::git::workspace_path_for;
use crate::lifecycle::LifecycleEvent;
use crate::registry::AgentEntry;
use crate::status::{self, WorkerStatus};
use crate::tracker::IssueUpdate;
use crate::util::{truncate_chars, BestEffort};
use crate::worker::MessageRecord;
use crate::{hlog, hlog_debug, hlog_warn};

impl Orchestrator {
    /// Status, recent messages and a diff summary for one worker.
    pub async fn check(&self, task_id: &str, message_limit: usize) -> CheckOutcome {
        let Some(entry) = self.registry.get(task_id) else {
            return CheckOutcome::NotFound {
                task_id: task_id.to_string(),
            };
        };

        let probe = self
            .worker
            .messages(entry.control_port, &entry.session_id, Some(message_limit.max(1)))
            .await;
        let status = status::resolve(&probe);

        match probe {
            Ok(records) => {
                let messages = self.summarize(&records, message_limit);
                let diff = self.diff_summary(&entry).await;
                CheckOutcome::Ok(CheckReport {
                    entry,
                    status,
                    messages,
                    diff,
                })
            }
            Err(e) => {
                hlog_debug!("check {}: control API unreachable: {}", task_id, e);
                let raw_output: BestEffort<String> = self
                    .supervisor
                    .capture_tail(&entry.supervisor_session, self.config.capture_lines())
                    .await
                    .into();
                CheckOutcome::Degraded(DegradedCheck {
                    entry,
                    status,
                    error: e.to_string(),
                    raw_output,
                })
            }
        }
    }

    fn summarize(&self, records: &[MessageRecord], limit: usize) -> Vec<MessageSummary> {
        let skip = records.len().saturating_sub(limit);
        records[skip..]
            .iter()
            .map(|record| MessageSummary {
                role: record.info.role.clone(),
                text: truncate_chars(&record.text(), self.config.message_text_limit()),
                completed: record
                    .info
                    .time
                    .as_ref()
                    .is_some_and(|t| t.completed.is_some()),
            })
            .collect()
    }

    async fn diff_summary(&self, entry: &AgentEntry) -> Option<String> {
        if !entry.workspace_known() {
            return None;
        }
        match self.workspaces.diff_summary(&entry.workspace_path).await {
            Ok(diff) => Some(diff),
            Err(e) => {
                hlog_debug!("diff summary for {} unavailable: {}", entry.task_id, e);
                None
            }
        }
    }

    /// Send another message to a running worker.
    pub async fn followup(&self, task_id: &str, message: &str) -> CommandOutcome {
        let Some(entry) = self.registry.get(task_id) else {
            return CommandOutcome::NotFound {
                task_id: task_id.to_string(),
            };
        };
        let model = self.model_selector(None, None);
        match self
            .worker
            .prompt_async(entry.control_port, &entry.session_id, message, model.as_ref())
            .await
        {
            Ok(()) => CommandOutcome::Ok {
                task_id: task_id.to_string(),
            },
            Err(e) => CommandOutcome::Failed {
                task_id: task_id.to_string(),
                error: e.to_string(),
            },
        }
    }

    /// Stop the worker's in-flight operation. The worker and its session
    /// stay alive.
    pub async fn abort(&self, task_id: &str) -> CommandOutcome {
        let Some(entry) = self.registry.get(task_id) else {
            return CommandOutcome::NotFound {
                task_id: task_id.to_string(),
            };
        };
        match self
            .worker
            .abort(entry.control_port, &entry.session_id)
            .await
        {
            Ok(()) => {
                self.events.emit(LifecycleEvent::aborted(task_id));
                CommandOutcome::Ok {
                    task_id: task_id.to_string(),
                }
            }
            Err(e) => CommandOutcome::Failed {
                task_id: task_id.to_string(),
                error: e.to_string(),
            },
        }
    }

    /// Tear down everything belonging to a task.
    ///
    /// Each step runs regardless of earlier failures; the report lists them
    /// in order.
    pub async fn cleanup(&self, task_id: &str, final_status: Option<&str>) -> CleanupOutcome {
        let Some(entry) = self.registry.get(task_id) else {
            return CleanupOutcome::NotFound {
                task_id: task_id.to_string(),
            };
        };
        let final_status = final_status
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(self.config.close_status());
        let mut report = CleanupReport::new(task_id, final_status);

        match self.supervisor.kill_session(&entry.supervisor_session).await {
            Ok(()) => report.record(
                CleanupStep::KillSession,
                StepResult::Done,
                format!("killed tmux session {}", entry.supervisor_session),
            ),
            Err(e) => report.record(CleanupStep::KillSession, StepResult::Failed, e.to_string()),
        }

        self.remove_workspace(&entry, &mut report).await;

        let status_set = match self
            .tracker
            .update(task_id, &IssueUpdate::status(final_status))
            .await
        {
            Ok(()) => {
                report.record(
                    CleanupStep::UpdateTracker,
                    StepResult::Done,
                    format!("status set to {}", final_status),
                );
                true
            }
            Err(e) => {
                report.record(CleanupStep::UpdateTracker, StepResult::Failed, e.to_string());
                false
            }
        };

        if status_set {
            let (event, note) = if final_status == self.config.close_status() {
                (LifecycleEvent::closed(task_id), "emitted closed")
            } else {
                (LifecycleEvent::finished(task_id), "emitted finished")
            };
            self.events.emit(event);
            report.record(CleanupStep::Notify, StepResult::Done, note);
        } else {
            report.record(CleanupStep::Notify, StepResult::Skipped, "tracker status unchanged");
        }

        match self.tracker.sync().await {
            Ok(()) => report.record(CleanupStep::Sync, StepResult::Done, "tracker synced"),
            Err(e) => {
                hlog_warn!("tracker sync after cleanup of {} failed: {}", task_id, e);
                report.record(CleanupStep::Sync, StepResult::Failed, e.to_string())
            }
        }

        if self.registry.delete(task_id) {
            report.record(CleanupStep::Unregister, StepResult::Done, "removed from registry");
        } else {
            report.record(CleanupStep::Unregister, StepResult::Skipped, "already removed");
        }

        let log_path = self.config.log_path(task_id);
        match tokio::fs::remove_file(&log_path).await {
            Ok(()) => report.record(
                CleanupStep::RemoveLog,
                StepResult::Done,
                format!("deleted {}", log_path.display()),
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                report.record(CleanupStep::RemoveLog, StepResult::Skipped, "no log file")
            }
            Err(e) => report.record(CleanupStep::RemoveLog, StepResult::Failed, e.to_string()),
        }

        hlog!(
            "Cleaned up {} ({} failed step(s))",
            task_id,
            report.failures().count()
        );
        CleanupOutcome::Completed(report)
    }

    async fn remove_workspace(&self, entry: &AgentEntry, report: &mut CleanupReport) {
        if !entry.has_isolated_workspace() {
            report.record(CleanupStep::RemoveWorkspace, StepResult::Skipped, "no isolated workspace");
            return;
        }

        let path = if entry.workspace_known() {
            entry.workspace_path.clone()
        } else {
            let candidate = workspace_path_for(&self.workspace_root, &entry.branch_label);
            if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                report.record(
                    CleanupStep::RemoveWorkspace,
                    StepResult::Skipped,
                    "workspace path unknown",
                );
                return;
            }
            // Labels of reconstructed entries are guessed; only a registered worktree qualifies.
            match self.workspaces.is_workspace(&self.workspace_root, &candidate).await {
                Ok(true) => candidate,
                Ok(false) => {
                    report.record(
                        CleanupStep::RemoveWorkspace,
                        StepResult::Skipped,
                        format!("{} is not a worktree", candidate.display()),
                    );
                    return;
                }
                Err(e) => {
                    report.record(CleanupStep::RemoveWorkspace, StepResult::Failed, e.to_string());
                    return;
                }
            }
        };

        match self.workspaces.remove(&self.workspace_root, &path, true).await {
            Ok(()) => report.record(
                CleanupStep::RemoveWorkspace,
                StepResult::Done,
                format!("removed {}", path.display()),
            ),
            Err(e) => report.record(CleanupStep::RemoveWorkspace, StepResult::Failed, e.to_string()),
        }
    }

    /// One row per registered worker, statuses resolved concurrently.
    pub async fn list(&self) -> Vec<AgentSummary> {
        let snapshot = self.registry.entries();
        let rows = snapshot.iter().map(|(_, entry)| async move {
            AgentSummary {
                task_id: entry.task_id.clone(),
                branch_label: entry.branch_label.clone(),
                control_port: entry.control_port,
                status: self.probe_status(entry).await,
                dispatched_at: entry.dispatched_at,
            }
        });
        let mut rows = join_all(rows).await;
        rows.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        rows
    }

    async fn probe_status(&self, entry: &AgentEntry) -> WorkerStatus {
        let probe = self
            .worker
            .messages(entry.control_port, &entry.session_id, Some(1));
        match tokio::time::timeout(self.config.http_timeout(), probe).await {
            Ok(result) => status::resolve(&result),
            Err(_) => WorkerStatus::Unreachable,
        }
    }
}
