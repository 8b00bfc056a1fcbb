//! Agent orchestration engine.
//!
//! The [`Orchestrator`] owns the [`Registry`] and the [`EventBus`] and talks
//! to the outside world through four collaborator traits: the issue
//! [`Tracker`], the process [`Supervisor`], the [`WorkerApi`] and the
//! [`Workspaces`] provider. Several orchestrators can live in one process;
//! nothing here is global.

mod dispatch;
mod operations;
mod outcome;
mod poller;
mod reconstruct;

pub use dispatch::{find_port, DispatchRequest};
pub use outcome::{
    AgentSummary, CheckOutcome, CheckReport, CleanupOutcome, CleanupReport, CleanupStep,
    CommandOutcome, DegradedCheck, DispatchOutcome, MessageSummary, ReconstructReport,
    SkippedTask, StepOutcome, StepResult,
};
pub use poller::Poller;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;

use crate::config::Config;
use crate::git::{GitWorkspaces, Workspaces};
use crate::lifecycle::EventBus;
use crate::registry::Registry;
use crate::tmux::{Supervisor, Tmux};
use crate::tracker::{BeadsCli, Tracker};
use crate::worker::{ModelSelector, WorkerApi, WorkerClient};
use crate::{Error, Result};

/// External systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub tracker: Arc<dyn Tracker>,
    pub supervisor: Arc<dyn Supervisor>,
    pub worker: Arc<dyn WorkerApi>,
    pub workspaces: Arc<dyn Workspaces>,
}

impl Collaborators {
    /// `bd`, tmux, HTTP and git2, configured from `config`.
    pub fn real(config: &Config, workspace_root: &Path) -> Result<Self> {
        Ok(Self {
            tracker: Arc::new(BeadsCli::new(
                config.tracker_command(),
                workspace_root,
                config.tracker_timeout(),
            )),
            supervisor: Arc::new(Tmux),
            worker: Arc::new(WorkerClient::new(
                config.worker_host(),
                config.http_timeout(),
            )?),
            workspaces: Arc::new(GitWorkspaces),
        })
    }
}

pub struct Orchestrator {
    config: Config,
    workspace_root: PathBuf,
    port_pattern: Regex,
    registry: Registry,
    events: EventBus,
    tracker: Arc<dyn Tracker>,
    supervisor: Arc<dyn Supervisor>,
    worker: Arc<dyn WorkerApi>,
    workspaces: Arc<dyn Workspaces>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        workspace_root: impl Into<PathBuf>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let port_pattern = Regex::new(config.port_pattern())
            .map_err(|e| Error::Validation(format!("Invalid port_pattern: {}", e)))?;
        if port_pattern.captures_len() < 2 {
            return Err(Error::Validation(
                "port_pattern needs a capture group for the port".to_string(),
            ));
        }
        Ok(Self {
            config,
            workspace_root: workspace_root.into(),
            port_pattern,
            registry: Registry::new(),
            events: EventBus::default(),
            tracker: collaborators.tracker,
            supervisor: collaborators.supervisor,
            worker: collaborators.worker,
            workspaces: collaborators.workspaces,
        })
    }

    pub fn with_real_collaborators(config: Config, workspace_root: impl Into<PathBuf>) -> Result<Self> {
        let root = workspace_root.into();
        let collaborators = Collaborators::real(&config, &root)?;
        Self::new(config, root, collaborators)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Explicit ids win; otherwise the configured defaults are used.
    fn model_selector(&self, provider: Option<&str>, model: Option<&str>) -> Option<ModelSelector> {
        ModelSelector::from_parts(
            provider.or(self.config.default_provider.as_deref()),
            model.or(self.config.default_model.as_deref()),
        )
    }
}
