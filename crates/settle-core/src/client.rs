//! HTTP boundary: the agent chat endpoint and the operation status endpoint.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use settle_types::OperationId;
use sha2::{Digest, Sha256};

use crate::session::TurnError;
use crate::settlement::{StatusReply, StatusSource};
use crate::stream::FrameStream;

/// Standard User-Agent header for settle requests.
pub const USER_AGENT: &str = concat!("settle/", env!("CARGO_PKG_VERSION"));

/// Decoded frames of one agent response.
pub type AgentStream = FrameStream<BoxStream<'static, reqwest::Result<Bytes>>>;

/// Opaque wallet credential forwarded to the agent runtime.
///
/// The value is never inspected and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Stable, non-reversible key for this credential (hex SHA-256 prefix).
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        digest[..8].iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<redacted {}>)", self.fingerprint())
    }
}

/// Absolute URLs of the two endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub chat_url: String,
    pub status_url: String,
}

impl Endpoints {
    /// Joins the configured paths onto a validated base URL.
    pub fn new(agent_url: &str, chat_path: &str, status_path: &str) -> Result<Self> {
        let base = url::Url::parse(agent_url)
            .with_context(|| format!("Invalid agent URL: {agent_url}"))?;
        if base.cannot_be_a_base() {
            bail!("Invalid agent URL: {agent_url}");
        }
        let root = agent_url.trim_end_matches('/');
        Ok(Self {
            chat_url: format!("{root}{}", normalize_path(chat_path)),
            status_url: format!("{root}{}", normalize_path(status_path)),
        })
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Builds the shared HTTP client. `None` disables the request timeout.
pub fn build_http_client(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().context("Failed to build HTTP client")
}

/// Shared HTTP client plus resolved endpoints; hands out per-credential
/// agent clients and the status client.
#[derive(Debug, Clone)]
pub struct Connector {
    http: reqwest::Client,
    endpoints: Endpoints,
}

impl Connector {
    pub fn new(endpoints: Endpoints, timeout: Option<Duration>) -> Result<Self> {
        Ok(Self {
            http: build_http_client(timeout)?,
            endpoints,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn agent(&self, credential: Credential) -> AgentClient {
        AgentClient::new(self.http.clone(), self.endpoints.chat_url.clone(), credential)
    }

    pub fn status(&self) -> StatusClient {
        StatusClient::new(self.http.clone(), self.endpoints.status_url.clone())
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: [ChatMessage<'a>; 1],
    #[serde(rename = "privateKey")]
    private_key: &'a str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct StatusRequest<'a> {
    #[serde(rename = "opHash")]
    op_hash: &'a str,
}

/// Client for the agent chat endpoint, bound to one credential.
#[derive(Debug, Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    chat_url: String,
    credential: Credential,
}

impl AgentClient {
    pub fn new(http: reqwest::Client, chat_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            http,
            chat_url: chat_url.into(),
            credential,
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Sends one user message and returns the decoded response stream.
    pub async fn send_chat(&self, input: &str) -> Result<AgentStream, TurnError> {
        let request = ChatRequest {
            messages: [ChatMessage {
                role: "user",
                content: input,
            }],
            private_key: self.credential.expose(),
        };

        let response = self
            .http
            .post(&self.chat_url)
            .header("content-type", "application/json")
            .header("x-action", "chat")
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TurnError::http_status(status.as_u16(), &body));
        }

        tracing::debug!(status = status.as_u16(), "agent response stream opened");
        Ok(FrameStream::new(response.bytes_stream().boxed()))
    }
}

/// Extracts the `error` field of a JSON error body.
pub(crate) fn error_field(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        Value::String(message) if !message.is_empty() => Some(message.clone()),
        Value::String(_) | Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> TurnError {
    if e.is_timeout() {
        TurnError::network(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        TurnError::network(format!("Connection failed: {e}"))
    } else if e.is_request() {
        TurnError::network(format!("Request error: {e}"))
    } else {
        TurnError::network(format!("Network error: {e}"))
    }
}

/// Client for the operation status endpoint.
#[derive(Debug, Clone)]
pub struct StatusClient {
    http: reqwest::Client,
    status_url: String,
}

impl StatusClient {
    pub fn new(http: reqwest::Client, status_url: impl Into<String>) -> Self {
        Self {
            http,
            status_url: status_url.into(),
        }
    }

    /// Asks whether `operation` has settled.
    pub async fn status(&self, operation: &OperationId) -> Result<StatusReply> {
        let response = self
            .http
            .post(&self.status_url)
            .header("content-type", "application/json")
            .json(&StatusRequest {
                op_hash: operation.as_str(),
            })
            .send()
            .await
            .context("Status request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("Status endpoint returned HTTP {}", status.as_u16());
        }

        response
            .json::<StatusReply>()
            .await
            .context("Failed to parse status response")
    }
}

impl StatusSource for StatusClient {
    fn query<'a>(&'a self, operation: &'a OperationId) -> BoxFuture<'a, Result<StatusReply>> {
        Box::pin(self.status(operation))
    }
}
