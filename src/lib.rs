pub mod config;
pub mod error;
pub mod git;
pub mod lifecycle;
pub mod log;
pub mod metadata;
pub mod orchestration;
pub mod registry;
pub mod status;
pub mod tmux;
pub mod tracker;
pub mod util;
pub mod worker;

pub use error::{Error, Result};
pub use orchestration::{Collaborators, DispatchRequest, Orchestrator, Poller};
