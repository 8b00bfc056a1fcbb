//! HTTP client for a worker's control API.
//!
//! Each worker listens on its own local port. The API surface used here is
//! four endpoints: create a session, submit a prompt asynchronously, read the
//! message history, and abort the in-flight operation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{hlog_debug, hlog_trace, Error, Result};

/// Model selector sent with a prompt. Both ids are required by the worker,
/// so a selector is only sent when both are known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelector {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelSelector {
    pub fn from_parts(provider: Option<&str>, model: Option<&str>) -> Option<Self> {
        match (provider, model) {
            (Some(p), Some(m)) if !p.is_empty() && !m.is_empty() => Some(Self {
                provider_id: p.to_string(),
                model_id: m.to_string(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub time: Option<MessageTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl MessageRecord {
    /// Concatenated text of every text part.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|p| p.kind == "text")
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
pub trait WorkerApi: Send + Sync {
    async fn create_session(&self, port: u16) -> Result<String>;

    /// Returns once the worker has accepted the prompt, not when it is done.
    async fn prompt_async(
        &self,
        port: u16,
        session_id: &str,
        text: &str,
        model: Option<&ModelSelector>,
    ) -> Result<()>;

    /// Message history, oldest first. `limit` keeps only the newest records.
    async fn messages(&self, port: u16, session_id: &str, limit: Option<usize>) -> Result<Vec<MessageRecord>>;

    async fn abort(&self, port: u16, session_id: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: String,
}

/// [`WorkerApi`] over HTTP with a per-request timeout.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    client: reqwest::Client,
    host: String,
}

impl WorkerClient {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(host, client))
    }

    pub fn with_client(host: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            host: host.into(),
        }
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.host, port, path)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::WorkerStatus {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl WorkerApi for WorkerClient {
    async fn create_session(&self, port: u16) -> Result<String> {
        hlog_debug!("WorkerClient::create_session port={}", port);
        let response = self
            .client
            .post(self.url(port, "/session"))
            .json(&json!({}))
            .send()
            .await?;
        let created: CreatedSession = check_status(response).await?.json().await?;
        Ok(created.id)
    }

    async fn prompt_async(
        &self,
        port: u16,
        session_id: &str,
        text: &str,
        model: Option<&ModelSelector>,
    ) -> Result<()> {
        hlog_debug!(
            "WorkerClient::prompt_async port={} session={} chars={}",
            port,
            session_id,
            text.len()
        );
        let mut body = json!({
            "parts": [{ "type": "text", "text": text }],
        });
        if let Some(model) = model {
            body["model"] = serde_json::to_value(model)?;
        }
        let response = self
            .client
            .post(self.url(port, &format!("/session/{}/prompt_async", session_id)))
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn messages(&self, port: u16, session_id: &str, limit: Option<usize>) -> Result<Vec<MessageRecord>> {
        hlog_trace!("WorkerClient::messages port={} session={}", port, session_id);
        let mut request = self
            .client
            .get(self.url(port, &format!("/session/{}/message", session_id)));
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        let response = request.send().await?;
        let mut records: Vec<MessageRecord> = check_status(response).await?.json().await?;
        // Not every worker honours `limit`.
        if let Some(limit) = limit {
            if records.len() > limit {
                records.drain(..records.len() - limit);
            }
        }
        Ok(records)
    }

    async fn abort(&self, port: u16, session_id: &str) -> Result<()> {
        hlog_debug!("WorkerClient::abort port={} session={}", port, session_id);
        let response = self
            .client
            .post(self.url(port, &format!("/session/{}/abort", session_id)))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}
