//! HTTP client for the remote visual-agent service.
//!
//! Wraps `reqwest` with base-URL handling, timeouts, and typed failures.
//! The `AgentBackend` trait is the seam between the lifecycle core and the
//! transport so tests can drive a run through a scripted in-memory backend.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use reqwest::multipart;
use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::error::{status_error_message, ApiError};
use crate::model::{ClientConfig, RepromptAck, RunAccepted, StatusSnapshot};

#[derive(Debug, Clone)]
pub struct AgentApiClient {
    http: Client,
    base_url: String,
}

impl AgentApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(&config.base_url)?;
        let http = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(ApiError::from)?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Start a new run. With an attachment the request is multipart (prompt
    /// text part + file binary part), otherwise plain JSON. One request, no
    /// retry; the caller owns resubmission.
    pub async fn submit_run(
        &self,
        prompt: &str,
        attachment: Option<&Path>,
    ) -> Result<String, ApiError> {
        let url = self.endpoint("/api/run");
        let response = match attachment {
            Some(path) => {
                let bytes = tokio::fs::read(path).await.map_err(ApiError::Attachment)?;
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("attachment")
                    .to_string();
                let form = multipart::Form::new()
                    .text("prompt", prompt.to_string())
                    .part("file", multipart::Part::bytes(bytes).file_name(file_name));
                self.http.post(&url).multipart(form).send().await?
            }
            None => {
                self.http
                    .post(&url)
                    .json(&serde_json::json!({ "prompt": prompt }))
                    .send()
                    .await?
            }
        };
        let accepted: RunAccepted = decode(check_status(response).await?).await?;
        Ok(accepted.run_id)
    }

    /// Fetch the full status snapshot for a run.
    pub async fn fetch_status(&self, run_id: &str) -> Result<StatusSnapshot, ApiError> {
        let url = self.endpoint(&format!("/api/status/{run_id}"));
        let response = self.http.get(&url).send().await?;
        decode(check_status(response).await?).await
    }

    /// Deliver a clarification answer. The acknowledgement is advisory only.
    pub async fn send_reprompt(
        &self,
        run_id: &str,
        message: &str,
    ) -> Result<RepromptAck, ApiError> {
        let url = self.endpoint("/api/reprompt");
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "run_id": run_id, "message": message }))
            .send()
            .await?;
        decode(check_status(response).await?).await
    }
}

/// Transport seam for the lifecycle core. Implemented by `AgentApiClient`
/// for production and by scripted fakes in tests.
pub trait AgentBackend: Send + Sync + 'static {
    fn start_run(
        &self,
        prompt: String,
        attachment: Option<PathBuf>,
    ) -> BoxFuture<'static, Result<String, ApiError>>;

    fn poll_status(&self, run_id: String) -> BoxFuture<'static, Result<StatusSnapshot, ApiError>>;

    fn deliver_answer(
        &self,
        run_id: String,
        message: String,
    ) -> BoxFuture<'static, Result<RepromptAck, ApiError>>;
}

impl AgentBackend for AgentApiClient {
    fn start_run(
        &self,
        prompt: String,
        attachment: Option<PathBuf>,
    ) -> BoxFuture<'static, Result<String, ApiError>> {
        let client = self.clone();
        Box::pin(async move { client.submit_run(&prompt, attachment.as_deref()).await })
    }

    fn poll_status(&self, run_id: String) -> BoxFuture<'static, Result<StatusSnapshot, ApiError>> {
        let client = self.clone();
        Box::pin(async move { client.fetch_status(&run_id).await })
    }

    fn deliver_answer(
        &self,
        run_id: String,
        message: String,
    ) -> BoxFuture<'static, Result<RepromptAck, ApiError>> {
        let client = self.clone();
        Box::pin(async move { client.send_reprompt(&run_id, &message).await })
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status(status, status_error_message(status, &body)))
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(ApiError::from)
}

/// Validate and normalize the configured base URL (scheme required, trailing
/// slashes stripped so path joining stays predictable).
pub fn normalize_base_url(raw: &str) -> Result<String, ApiError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() || !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ApiError::InvalidBaseUrl(raw.to_string()));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClarificationMode;
    use std::time::Duration;

    fn config(base_url: &str) -> ClientConfig {
        ClientConfig {
            base_url: base_url.to_string(),
            poll_interval: Duration::from_millis(1500),
            request_timeout: Duration::from_secs(30),
            user_agent: "visual-agent-cli/test".to_string(),
            clarification_mode: ClarificationMode::StatusField,
        }
    }

    #[test]
    fn base_url_trailing_slash_is_stripped() {
        assert_eq!(
            normalize_base_url("http://127.0.0.1:8000/").unwrap(),
            "http://127.0.0.1:8000"
        );
        assert_eq!(
            normalize_base_url("https://agent.example.com").unwrap(),
            "https://agent.example.com"
        );
    }

    #[test]
    fn base_url_without_scheme_is_rejected() {
        assert!(normalize_base_url("agent.example.com").is_err());
        assert!(normalize_base_url("   ").is_err());
    }

    #[test]
    fn endpoints_join_without_double_slashes() {
        let client = AgentApiClient::new(&config("http://127.0.0.1:8000/")).unwrap();
        assert_eq!(client.endpoint("/api/run"), "http://127.0.0.1:8000/api/run");
        assert_eq!(
            client.endpoint("/api/status/r1"),
            "http://127.0.0.1:8000/api/status/r1"
        );
    }

    #[test]
    fn client_rejects_invalid_base_url() {
        assert!(AgentApiClient::new(&config("not-a-url")).is_err());
    }
}
