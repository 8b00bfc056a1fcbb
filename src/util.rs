//! Shared utility functions.

use serde::Serialize;
use tokio::task::spawn_blocking;

use crate::{Error, Result};

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Result of an operation whose failure must not abort the caller.
///
/// `Degraded` carries the reason so callers can report it without treating
/// it as an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum BestEffort<T> {
    Done(T),
    Degraded(String),
}

impl<T> BestEffort<T> {
    pub fn is_degraded(&self) -> bool {
        matches!(self, BestEffort::Degraded(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            BestEffort::Done(value) => Some(value),
            BestEffort::Degraded(_) => None,
        }
    }
}

impl<T> From<Result<T>> for BestEffort<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => BestEffort::Done(value),
            Err(e) => BestEffort::Degraded(e.to_string()),
        }
    }
}

/// Truncate to at most `max` characters, appending an ellipsis when cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
