//! Startup recovery of the registry from tracker metadata and tmux liveness.

use std::path::PathBuf;

use chrono::Utc;
use futures::future::join_all;

use super::{Orchestrator, ReconstructReport, SkippedTask};
use crate::metadata::DispatchMetadata;
use crate::registry::AgentEntry;
use crate::tmux::label_from_session_name;
use crate::tracker::TrackerIssue;
use crate::util::BestEffort;
use crate::{hlog, hlog_debug, hlog_warn, Error};

enum Readoption {
    Adopted(String),
    AlreadyTracked(String),
    Skipped(SkippedTask),
}

impl Orchestrator {
    /// Re-adopt workers that survived a restart of this process.
    ///
    /// Tasks already in the registry are left alone, so running this twice
    /// is harmless. A tracker that cannot be queried yields a degraded
    /// result rather than an error.
    pub async fn reconstruct(&self) -> BestEffort<ReconstructReport> {
        let limit = self.config.reconstruct_timeout();
        let listing = tokio::time::timeout(
            limit,
            self.tracker
                .list_by_status(self.config.claimed_status(), limit),
        )
        .await
        .unwrap_or(Err(Error::Timeout(limit)));

        let issues = match listing {
            Ok(issues) => issues,
            Err(e) => {
                hlog_warn!("Reconstruction skipped: {}", e);
                return BestEffort::Degraded(e.to_string());
            }
        };

        let results = join_all(issues.into_iter().map(|issue| self.readopt(issue))).await;
        let mut report = ReconstructReport::default();
        for result in results {
            match result {
                Readoption::Adopted(id) => report.adopted.push(id),
                Readoption::AlreadyTracked(id) => report.already_tracked.push(id),
                Readoption::Skipped(skipped) => {
                    hlog_debug!("reconstruct {}: {}", skipped.task_id, skipped.reason);
                    report.skipped.push(skipped)
                }
            }
        }
        if !report.adopted.is_empty() {
            hlog!("Re-adopted {} worker(s): {}", report.adopted.len(), report.adopted.join(", "));
        }
        BestEffort::Done(report)
    }

    async fn readopt(&self, issue: TrackerIssue) -> Readoption {
        let task_id = issue.id;
        if self.registry.has(&task_id) {
            return Readoption::AlreadyTracked(task_id);
        }
        let Some(record) = DispatchMetadata::parse(&issue.description) else {
            return Readoption::Skipped(SkippedTask {
                task_id,
                reason: "no dispatch metadata".to_string(),
            });
        };
        let probe_limit = self.config.http_timeout();
        let alive = tokio::time::timeout(
            probe_limit,
            self.supervisor.session_exists(&record.supervisor_session),
        )
        .await;
        match alive {
            Ok(true) => {}
            Ok(false) => {
                return Readoption::Skipped(SkippedTask {
                    task_id,
                    reason: format!("tmux session {} is gone", record.supervisor_session),
                })
            }
            Err(_) => {
                return Readoption::Skipped(SkippedTask {
                    task_id,
                    reason: format!(
                        "tmux session {} did not answer within {:?}",
                        record.supervisor_session, probe_limit
                    ),
                })
            }
        }

        let entry = AgentEntry {
            task_id: task_id.clone(),
            control_port: record.port,
            session_id: record.session_id,
            branch_label: label_from_session_name(&record.supervisor_session),
            supervisor_session: record.supervisor_session,
            workspace_path: PathBuf::new(),
            dispatched_at: Utc::now(),
        };
        // Dispatch may have registered the task while we were probing tmux.
        if self.registry.has(&task_id) {
            return Readoption::AlreadyTracked(task_id);
        }
        self.registry.set(&task_id, entry);
        Readoption::Adopted(task_id)
    }
}
