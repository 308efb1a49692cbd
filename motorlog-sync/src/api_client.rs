//! Applies queued changes to the Motorlog REST API.
//!
//! Every call resolves to one of three outcomes. `Confirmed` and `Rejected`
//! both mean the server answered; `Unreachable` means it did not (transport
//! failure, timeout, or a gateway status) and the change should stay queued.

use crate::config::SyncConfig;
use crate::error::SyncResult;
use async_trait::async_trait;
use motorlog_types::{ChangeKind, PendingChange};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Supplies bearer tokens for API calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Option<String>;

    /// Called once after a 401. Returning `None` gives up and lets the 401
    /// stand as a rejection.
    async fn refresh(&self) -> Option<String> {
        None
    }
}

/// A token that never changes.
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Why the server refused a change.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectionDetail {
    /// HTTP status, or `None` when the request could not be built at all.
    pub status: Option<u16>,
    pub message: String,
    pub body: Option<Value>,
}

impl RejectionDetail {
    pub fn local(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            body: None,
        }
    }

    fn from_response(status: StatusCode, body: Option<Value>) -> Self {
        // Prefer the API's own message ({"error": ...} or {"message": ...}).
        let message = body
            .as_ref()
            .and_then(|b| b.get("error").or_else(|| b.get("message")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request refused").to_string());
        Self {
            status: Some(status.as_u16()),
            message,
            body,
        }
    }
}

impl fmt::Display for RejectionDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status} {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The server accepted the change. Carries the response body, if any.
    Confirmed(Option<Value>),
    Rejected(RejectionDetail),
    /// No answer. The reason is kept as the change's last error.
    Unreachable(String),
}

/// Sends one change to the server.
#[async_trait]
pub trait MutationApplier: Send + Sync {
    async fn apply(&self, change: &PendingChange) -> ApplyOutcome;
}

/// Extracts the server id from a create response: `{"id": ..}` or
/// `{"data": {"id": ..}}`, numeric or string.
pub fn server_id(body: &Value) -> Option<String> {
    let id = body.get("id").or_else(|| body.get("data")?.get("id"))?;
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// [`MutationApplier`] over the REST API.
///
/// | kind   | request                              |
/// |--------|--------------------------------------|
/// | create | `POST {base}/{resource}`             |
/// | update | `PUT {base}/{resource}/{entityId}`   |
/// | delete | `DELETE {base}/{resource}/{entityId}`|
pub struct HttpMutationApplier {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    transient_statuses: Vec<u16>,
}

impl HttpMutationApplier {
    pub fn new(config: &SyncConfig, tokens: Arc<dyn TokenProvider>) -> SyncResult<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            tokens,
            transient_statuses: config.transient_statuses.clone(),
        })
    }

    /// Method and URL for a change. `None` while an update or delete still
    /// waits for its create's server id.
    pub fn endpoint(&self, change: &PendingChange) -> Option<(Method, String)> {
        let collection = format!("{}/{}", self.base_url, change.entity_type.resource());
        match change.kind {
            ChangeKind::Create => Some((Method::POST, collection)),
            ChangeKind::Update => {
                let id = change.entity_id.as_ref()?;
                Some((Method::PUT, format!("{collection}/{id}")))
            }
            ChangeKind::Delete => {
                let id = change.entity_id.as_ref()?;
                Some((Method::DELETE, format!("{collection}/{id}")))
            }
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self.client.request(method, url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await
    }

    /// Sends the request, retrying once with a refreshed token on 401.
    async fn send_authed(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let token = self.tokens.access_token().await;
        let resp = self.send(method.clone(), url, body, token.as_deref()).await?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        match self.tokens.refresh().await {
            Some(token) => {
                debug!("retrying {method} {url} with refreshed token");
                self.send(method, url, body, Some(&token)).await
            }
            None => Ok(resp),
        }
    }

    async fn classify(&self, change: &PendingChange, resp: reqwest::Response) -> ApplyOutcome {
        let status = resp.status();
        let body = match resp.bytes().await {
            Ok(bytes) if bytes.is_empty() => None,
            Ok(bytes) => serde_json::from_slice::<Value>(&bytes).ok(),
            Err(e) => {
                warn!("failed to read response body for {}: {e}", change.target());
                None
            }
        };

        if status.is_success() {
            return ApplyOutcome::Confirmed(body);
        }
        if change.kind == ChangeKind::Delete && status == StatusCode::NOT_FOUND {
            debug!("{} already gone on the server", change.target());
            return ApplyOutcome::Confirmed(None);
        }
        if self.transient_statuses.contains(&status.as_u16()) {
            return ApplyOutcome::Unreachable(format!("server answered {status}"));
        }
        ApplyOutcome::Rejected(RejectionDetail::from_response(status, body))
    }
}

#[async_trait]
impl MutationApplier for HttpMutationApplier {
    async fn apply(&self, change: &PendingChange) -> ApplyOutcome {
        let Some((method, url)) = self.endpoint(change) else {
            return ApplyOutcome::Rejected(RejectionDetail::local(format!(
                "{} has no server id yet",
                change.target()
            )));
        };

        debug!("{method} {url}");
        let body = match change.kind {
            ChangeKind::Delete => None,
            _ => change.data.as_ref(),
        };

        match self.send_authed(method, &url, body).await {
            Ok(resp) => self.classify(change, resp).await,
            Err(e) if e.is_builder() => {
                ApplyOutcome::Rejected(RejectionDetail::local(format!("invalid request: {e}")))
            }
            Err(e) if e.is_timeout() => ApplyOutcome::Unreachable("request timed out".into()),
            Err(e) if e.is_connect() => ApplyOutcome::Unreachable(format!("connection failed: {e}")),
            Err(e) => ApplyOutcome::Unreachable(e.to_string()),
        }
    }
}
