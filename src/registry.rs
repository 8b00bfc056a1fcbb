//! In-memory registry of dispatched workers.
//!
//! The registry is owned by an [`crate::orchestration::Orchestrator`] and
//! shared by handle. Every mutation is a single map operation under a short
//! lock; entries are replaced wholesale, never patched.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Branch label of an entry whose worker runs in the shared workspace root.
pub const NO_WORKSPACE_LABEL: &str = "(none)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub task_id: String,
    pub control_port: u16,
    pub session_id: String,
    pub supervisor_session: String,
    /// Empty when unknown, e.g. for reconstructed entries.
    pub workspace_path: PathBuf,
    pub branch_label: String,
    pub dispatched_at: DateTime<Utc>,
}

impl AgentEntry {
    pub fn has_isolated_workspace(&self) -> bool {
        self.branch_label != NO_WORKSPACE_LABEL
    }

    pub fn workspace_known(&self) -> bool {
        !self.workspace_path.as_os_str().is_empty()
    }
}

/// Point-in-time copy of the registry contents; iterate it as often as needed.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: Arc<[(String, AgentEntry)]>,
}

impl Snapshot {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AgentEntry)> + '_ {
        self.entries.iter().map(|(id, entry)| (id.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, AgentEntry>>,
    admitting: Arc<Mutex<HashSet<String>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: &str, entry: AgentEntry) {
        self.write().insert(id.to_string(), entry);
    }

    pub fn get(&self, id: &str) -> Option<AgentEntry> {
        self.read().get(id).cloned()
    }

    pub fn has(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Remove an entry, returning whether one existed.
    pub fn delete(&self, id: &str) -> bool {
        self.write().remove(id).is_some()
    }

    pub fn entries(&self) -> Snapshot {
        let entries: Vec<(String, AgentEntry)> = self
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        Snapshot {
            entries: entries.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.read().len()
    }

    /// Claim the right to dispatch `id`. Returns `None` while another
    /// dispatch for the same id holds its guard.
    pub fn admit(&self, id: &str) -> Option<Admission> {
        let mut admitting = self
            .admitting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !admitting.insert(id.to_string()) {
            return None;
        }
        Some(Admission {
            id: id.to_string(),
            admitting: Arc::clone(&self.admitting),
        })
    }

    // Writers never panic mid-update, so a poisoned map is still consistent.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, AgentEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, AgentEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Dispatch admission for one task id, released on drop.
#[derive(Debug)]
pub struct Admission {
    id: String,
    admitting: Arc<Mutex<HashSet<String>>>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.admitting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
