//! Periodic re-probing of registered workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::Orchestrator;
use crate::lifecycle::LifecycleEvent;
use crate::registry::AgentEntry;
use crate::status::{classify, WorkerStatus};
use crate::{hlog_debug, hlog_trace};

/// What one probe saw.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Observation {
    Status(WorkerStatus),
    Errored(String),
}

impl Observation {
    // Error details vary between probes; only the kind of state counts.
    fn same_state(&self, other: &Observation) -> bool {
        match (self, other) {
            (Observation::Status(a), Observation::Status(b)) => a == b,
            (Observation::Errored(_), Observation::Errored(_)) => true,
            _ => false,
        }
    }

    fn event(&self, task_id: &str) -> Option<LifecycleEvent> {
        match self {
            Observation::Errored(detail) => Some(LifecycleEvent::errored(task_id, detail.clone())),
            Observation::Status(WorkerStatus::Finished) => Some(LifecycleEvent::finished(task_id)),
            Observation::Status(_) => None,
        }
    }
}

/// Probes every registered worker and emits `errored` / `finished` when a
/// worker's observed state changes. Never removes registry entries.
pub struct Poller {
    orchestrator: Arc<Orchestrator>,
    last_seen: Mutex<HashMap<String, Observation>>,
}

impl Poller {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Probe every worker once, concurrently. Returns the events emitted.
    pub async fn poll_once(&self) -> Vec<LifecycleEvent> {
        let snapshot = self.orchestrator.registry.entries();
        let probes = snapshot.iter().map(|(id, entry)| async move {
            (id.to_string(), self.probe(entry).await)
        });
        let observations = join_all(probes).await;

        let mut emitted = Vec::new();
        {
            let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
            last_seen.retain(|id, _| snapshot.iter().any(|(known, _)| known == id));
            for (task_id, observation) in observations {
                let changed = last_seen
                    .get(&task_id)
                    .is_none_or(|previous| !previous.same_state(&observation));
                if changed {
                    if let Some(event) = observation.event(&task_id) {
                        emitted.push(event);
                    }
                }
                last_seen.insert(task_id, observation);
            }
        }

        for event in &emitted {
            self.orchestrator.events.emit(event.clone());
        }
        hlog_trace!("poll: {} worker(s), {} event(s)", snapshot.len(), emitted.len());
        emitted
    }

    async fn probe(&self, entry: &AgentEntry) -> Observation {
        let limit = self.orchestrator.config.http_timeout();
        let request = self
            .orchestrator
            .worker
            .messages(entry.control_port, &entry.session_id, Some(1));
        match tokio::time::timeout(limit, request).await {
            Ok(Ok(messages)) => Observation::Status(classify(&messages)),
            Ok(Err(e)) => Observation::Errored(e.to_string()),
            Err(_) => Observation::Errored(format!("probe timed out after {:?}", limit)),
        }
    }

    /// Poll every `interval` until `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
        hlog_debug!("poller stopped");
    }
}
