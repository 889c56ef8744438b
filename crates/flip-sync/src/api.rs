use async_trait::async_trait;
use flip_core::Task;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Body of a successful start/stop response. Either field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MutationAck {
    #[serde(default)]
    pub is_running: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("server rejected request ({status}): {reason}")]
    Rejected { status: u16, reason: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected response body: {0}")]
    Decode(String),
}

/// The request/response calls the synchronization core depends on.
#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn list_tasks(&self) -> Result<Vec<Task>, ApiError>;
    async fn start_task(&self, id: i64) -> Result<MutationAck, ApiError>;
    async fn stop_task(&self, id: i64) -> Result<MutationAck, ApiError>;
}

pub struct HttpTaskApi {
    client: reqwest::Client,
    base: Url,
}

impl HttpTaskApi {
    pub fn new(base: Url) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|err| ApiError::Transport(format!("invalid url for {path}: {err}")))
    }

    async fn post_mutation(&self, path: &str) -> Result<MutationAck, ApiError> {
        let url = self.endpoint(path)?;
        debug!(event = "task_api_request", method = "POST", url = %url);
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(ApiError::Rejected {
                status: status.as_u16(),
                reason: error_reason(&body).unwrap_or_else(|| status.to_string()),
            });
        }
        if body.trim().is_empty() {
            return Ok(MutationAck::default());
        }
        // A 2xx is a success whatever the body says; an unreadable body only
        // means there is no confirmed value to apply.
        match serde_json::from_str::<MutationAck>(&body) {
            Ok(ack) => Ok(ack),
            Err(err) => {
                debug!(event = "task_api_ack_unparsed", error = %err);
                Ok(MutationAck::default())
            }
        }
    }
}

#[async_trait]
impl TaskApi for HttpTaskApi {
    async fn list_tasks(&self) -> Result<Vec<Task>, ApiError> {
        let url = self.endpoint("api/tasks")?;
        debug!(event = "task_api_request", method = "GET", url = %url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Rejected {
                status: status.as_u16(),
                reason: error_reason(&body).unwrap_or_else(|| status.to_string()),
            });
        }
        response
            .json::<Vec<Task>>()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))
    }

    async fn start_task(&self, id: i64) -> Result<MutationAck, ApiError> {
        self.post_mutation(&format!("api/tasks/start/{id}")).await
    }

    async fn stop_task(&self, id: i64) -> Result<MutationAck, ApiError> {
        self.post_mutation(&format!("api/tasks/stop/{id}")).await
    }
}

/// Pull a human-readable reason out of an error body (`detail` or `message`).
fn error_reason(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => ["detail", "message", "error"]
            .iter()
            .find_map(|key| value.get(*key))
            .and_then(|reason| match reason {
                Value::String(text) => Some(text.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            }),
        Err(_) => Some(trimmed.to_string()),
    }
}
