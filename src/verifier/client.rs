use super::types::*;
use crate::error::{Result, StackError};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Client for the execution service that accepts runs.
pub struct ExecutionClient {
    client: Client,
    base_url: String,
}

impl ExecutionClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// POST /api/runs/validate. Anything but 2xx means the request itself is bad.
    pub async fn validate(&self, request: &RunRequest) -> Result<()> {
        let url = format!("{}/api/runs/validate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| StackError::network(&url, e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(StackError::Configuration(format!(
                "run request rejected by {url} ({status}): {body}"
            )))
        }
    }

    /// POST /api/runs and return the assigned run id.
    pub async fn submit(&self, request: &RunRequest) -> Result<String> {
        let url = format!("{}/api/runs", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| StackError::network(&url, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StackError::network(&url, e))?;
        if !status.is_success() {
            return Err(StackError::protocol(&url, format!("submit returned {status}: {body}")));
        }

        let json: Value = serde_json::from_str(&body)
            .map_err(|e| StackError::protocol(&url, format!("unparsable submit response: {e}: {body}")))?;
        extract_run_id(&json).ok_or_else(|| StackError::protocol(&url, format!("no run_id in response: {body}")))
    }
}

/// `run_id` may come back as a string or a number; blank strings do not count.
fn extract_run_id(json: &Value) -> Option<String> {
    match json.get("run_id")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Client for the workbench endpoint that proxies run status.
pub struct StatusProxyClient {
    client: Client,
    base_url: String,
    prefix: String,
}

impl StatusProxyClient {
    pub fn new(base_url: &str, status_path_prefix: &str) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            prefix: status_path_prefix.trim_matches('/').to_string(),
        }
    }

    pub fn status_url(&self, run_id: &str) -> String {
        format!("{}/{}/{}/", self.base_url, self.prefix, run_id)
    }

    /// Fetch one snapshot. Transport failures and bad bodies come back as Unknown.
    pub async fn fetch(&self, run_id: &str) -> StatusSnapshot {
        let url = self.status_url(run_id);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => return StatusSnapshot::unknown(format!("request to {url} failed: {e}")),
        };
        match response.text().await {
            Ok(body) => StatusSnapshot::parse(body),
            Err(e) => StatusSnapshot::unknown(format!("unreadable body from {url}: {e}")),
        }
    }
}
