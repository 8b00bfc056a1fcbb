//! Dispatch metadata persisted in the tracker's description field.
//!
//! The description is the only durable store available, so the triple
//! needed to re-adopt a worker after a restart is written there as a single
//! versioned line:
//!
//! ```text
//! [herd v1] Port: 4096, tmux: T_1, session: ses_abc
//! ```
//!
//! Parsing is total: [`DispatchMetadata::parse`] returns `None` for anything
//! that is not a complete record. The unversioned fragment written by older
//! coordinators (`Port: 4096, tmux: T_1, session: ses_abc`) is still read.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;
const MARKER_PREFIX: &str = "[herd v";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMetadata {
    pub port: u16,
    pub supervisor_session: String,
    pub session_id: String,
}

static METADATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Port:\s*(\d{1,5})\s*,\s*tmux:\s*([^\s,]+)\s*,\s*session:\s*([^\s,]+)")
        .unwrap()
});

impl DispatchMetadata {
    pub fn new(port: u16, supervisor_session: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            port,
            supervisor_session: supervisor_session.into(),
            session_id: session_id.into(),
        }
    }

    /// Find the newest complete record in a description.
    pub fn parse(description: &str) -> Option<Self> {
        METADATA_RE
            .captures_iter(description)
            .filter_map(|caps| {
                let port = caps.get(1)?.as_str().parse::<u16>().ok()?;
                if port == 0 {
                    return None;
                }
                Some(Self::new(port, caps.get(2)?.as_str(), caps.get(3)?.as_str()))
            })
            .last()
    }

    /// Description with any earlier record replaced by this one.
    pub fn embed(&self, description: &str) -> String {
        let body = strip(description);
        if body.is_empty() {
            self.to_string()
        } else {
            format!("{}\n\n{}", body, self)
        }
    }
}

/// Description with every metadata line removed.
pub fn strip(description: &str) -> String {
    let kept: Vec<&str> = description
        .lines()
        .filter(|line| !is_metadata_line(line))
        .collect();
    kept.join("\n").trim_end().to_string()
}

fn is_metadata_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with(MARKER_PREFIX)
        || (trimmed.starts_with("Port:") && METADATA_RE.is_match(trimmed))
}

impl fmt::Display for DispatchMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}] Port: {}, tmux: {}, session: {}",
            MARKER_PREFIX, SCHEMA_VERSION, self.port, self.supervisor_session, self.session_id
        )
    }
}
