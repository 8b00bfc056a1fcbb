//! Lifecycle events and the bus that carries them.
//!
//! Emitting never waits on observers: every subscriber owns a bounded queue
//! and `emit` uses `try_send`. A full queue drops the event for that
//! subscriber only; a closed queue is pruned.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{hlog_debug, hlog_warn, Result};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Claimed,
    Running,
    Finished,
    Errored,
    Aborted,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl LifecycleEvent {
    fn bare(kind: EventKind, task_id: &str) -> Self {
        Self {
            kind,
            task_id: task_id.to_string(),
            branch_label: None,
            control_port: None,
            error_detail: None,
        }
    }

    pub fn claimed(task_id: &str) -> Self {
        Self::bare(EventKind::Claimed, task_id)
    }

    pub fn running(task_id: &str, branch_label: &str, control_port: u16) -> Self {
        Self {
            branch_label: Some(branch_label.to_string()),
            control_port: Some(control_port),
            ..Self::bare(EventKind::Running, task_id)
        }
    }

    pub fn finished(task_id: &str) -> Self {
        Self::bare(EventKind::Finished, task_id)
    }

    pub fn errored(task_id: &str, detail: impl Into<String>) -> Self {
        Self {
            error_detail: Some(detail.into()),
            ..Self::bare(EventKind::Errored, task_id)
        }
    }

    pub fn aborted(task_id: &str) -> Self {
        Self::bare(EventKind::Aborted, task_id)
    }

    pub fn closed(task_id: &str) -> Self {
        Self::bare(EventKind::Closed, task_id)
    }
}

pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<LifecycleEvent>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<LifecycleEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Run `handler` for every event on its own task.
    ///
    /// Errors and panics raised by the handler are logged and swallowed; the
    /// observer keeps receiving later events.
    pub fn observe<F, Fut>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(LifecycleEvent) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let kind = event.kind;
                let task_id = event.task_id.clone();
                match AssertUnwindSafe(async { handler(event).await })
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        hlog_warn!("Event observer failed on {:?} for {}: {}", kind, task_id, e)
                    }
                    Err(_) => hlog_warn!("Event observer panicked on {:?} for {}", kind, task_id),
                }
            }
        })
    }

    pub fn emit(&self, event: LifecycleEvent) {
        hlog_debug!("event {:?} task={}", event.kind, event.task_id);
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                hlog_warn!(
                    "Event queue full, dropping {:?} for {}",
                    dropped.kind,
                    dropped.task_id
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
