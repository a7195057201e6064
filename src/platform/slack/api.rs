// ABOUTME: Slack Web API client implementing the core HttpApi collaborator over reqwest
// ABOUTME: Retries rate limits and transient failures, then posts the outcome back to the host

use crate::host::{HostEvent, HostSender};
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, COOKIE, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use slackline_core::{DeferredResult, HttpApi, HttpConfig, Params, SyncError, WorkspaceConfig};
use std::time::Duration;

pub const API_BASE_URL: &str = "https://slack.com/api";

const USER_AGENT: &str = concat!("slackline/", env!("CARGO_PKG_VERSION"));

/// Form-encoded Web API client for one workspace.
#[derive(Clone)]
pub struct SlackHttp {
    client: reqwest::Client,
    base_url: String,
    token: String,
    cookies: Option<String>,
    max_retries: u32,
    default_retry_after: Duration,
    events: HostSender,
}

impl std::fmt::Debug for SlackHttp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackHttp")
            .field("base_url", &self.base_url)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl SlackHttp {
    pub fn new(workspace: &WorkspaceConfig, http: &HttpConfig, events: HostSender) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
            token: workspace.api_token.clone(),
            cookies: workspace.api_cookies.clone(),
            max_retries: http.max_retries,
            default_retry_after: http.default_retry_after(),
            events,
        })
    }

    /// Point the client at another server, e.g. a local test double.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn post(&self, url: &str, fields: &[(String, String)], timeout: Duration) -> slackline_core::Result<Value> {
        let mut attempt = 0;
        loop {
            let mut request = self
                .client
                .post(url)
                .bearer_auth(&self.token)
                .timeout(timeout)
                .form(fields);
            if let Some(cookies) = &self.cookies {
                request = request.header(COOKIE, cookies);
            }

            let delay = match request.send().await {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    retry_after(response.headers(), self.default_retry_after)
                }
                Ok(response) if response.status().is_server_error() => self.default_retry_after,
                Ok(response) if !response.status().is_success() => {
                    return Err(http_error(url, Some(response.status()), response.status().to_string()));
                }
                Ok(response) => {
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|e| http_error(url, None, format!("invalid response body: {e}")));
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    if attempt >= self.max_retries {
                        return Err(http_error(url, e.status(), e.to_string()));
                    }
                    self.default_retry_after
                }
                Err(e) => return Err(http_error(url, e.status(), e.to_string())),
            };

            if attempt >= self.max_retries {
                return Err(http_error(url, None, format!("gave up after {} retries", attempt)));
            }
            attempt += 1;
            tracing::warn!(url = %url, attempt, delay_secs = delay.as_secs(), "Retrying Slack API request");
            tokio::time::sleep(delay).await;
        }
    }
}

impl HttpApi for SlackHttp {
    fn request(&self, method: &str, params: &Params, timeout: Duration) -> DeferredResult<Value> {
        let request = DeferredResult::new();
        let client = self.clone();
        let url = format!("{}/{}", self.base_url, method);
        let fields = form_fields(params);
        let completion = request.clone();
        tracing::debug!(url = %url, fields = fields.len(), "Slack API request");

        tokio::task::spawn_local(async move {
            let outcome = client.post(&url, &fields, timeout).await;
            if let Err(e) = &outcome {
                tracing::debug!(url = %url, error = %e, "Slack API request failed");
            }
            let _ = client.events.send(HostEvent::Http {
                request: completion,
                outcome,
            });
        });
        request
    }
}

fn http_error(url: &str, status: Option<StatusCode>, error: String) -> SyncError {
    SyncError::Http {
        url: url.to_string(),
        status: status.map(|s| s.as_u16()),
        return_code: None,
        error,
    }
}

/// Flatten JSON params into form fields. Strings are sent unquoted.
pub fn form_fields(params: &Params) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Delay requested by a 429 response, falling back to `default`.
pub fn retry_after(headers: &HeaderMap, default: Duration) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
