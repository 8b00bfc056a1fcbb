//! Worker status classification.
//!
//! The worker API has no status endpoint with a documented vocabulary, so the
//! state is inferred from the newest message record. Combinations that are
//! not recognised resolve to [`WorkerStatus::Idle`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::worker::MessageRecord;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Idle,
    Finished,
    Unreachable,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Running => write!(f, "running"),
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Finished => write!(f, "finished"),
            WorkerStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

const WORKER_ROLE: &str = "assistant";
const REQUESTER_ROLE: &str = "user";

/// Classify from a message history (oldest first).
pub fn classify(messages: &[MessageRecord]) -> WorkerStatus {
    let Some(last) = messages.last() else {
        return WorkerStatus::Idle;
    };
    let info = &last.info;
    let status = info.status.as_deref().map(str::to_ascii_lowercase);
    let completed_at = info.time.as_ref().and_then(|t| t.completed);

    match info.role.as_str() {
        WORKER_ROLE => match status.as_deref() {
            Some("completed") => WorkerStatus::Finished,
            Some("streaming") | Some("running") => WorkerStatus::Running,
            None if completed_at.is_some() => WorkerStatus::Finished,
            _ => WorkerStatus::Idle,
        },
        REQUESTER_ROLE => WorkerStatus::Running,
        _ => WorkerStatus::Idle,
    }
}

/// Classify a probe result; any failure to fetch means unreachable.
pub fn resolve(probe: &Result<Vec<MessageRecord>>) -> WorkerStatus {
    match probe {
        Ok(messages) => classify(messages),
        Err(_) => WorkerStatus::Unreachable,
    }
}
