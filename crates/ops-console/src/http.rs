use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ops_protocol::{ScopeKey, TriggerAccepted};
use ops_tracker::resume::VerifyResponse;
use ops_tracker::{OperationKind, RemoteError, ResourceFetcher, Trigger, TriggerOutcome};
use reqwest::header::ACCEPT;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::OpsConfig;

pub(crate) const API_TOKEN_HEADER: &str = "X-API-Token";

/// Thin JSON client for the Pulse REST API.
pub(crate) struct PulseHttp {
    client: Client,
    base_url: Url,
    api_token: Option<String>,
    io_timeout: Duration,
    request_id: AtomicU64,
}

impl PulseHttp {
    pub(crate) fn new(config: &OpsConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        let base_url = Url::parse(config.server.base_url.trim())?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("base_url {base_url} cannot carry a path");
        }
        Ok(Self {
            client,
            base_url,
            api_token: config.server.api_token.clone(),
            io_timeout: config.io_timeout(),
            request_id: AtomicU64::new(1),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        endpoint_url(&self.base_url, segments)
    }

    async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<Value, RemoteError> {
        let request_id = self.request_id.fetch_add(1, Ordering::Relaxed);
        debug!(request_id, method = %method, url = %url, "pulse request start");
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header(ACCEPT, "application/json")
            .timeout(self.io_timeout);
        if let Some(token) = self.api_token.as_deref() {
            request = request.header(API_TOKEN_HEADER, token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|err| {
            warn!(
                request_id,
                method = %method,
                url = %url,
                timeout = err.is_timeout(),
                connect = err.is_connect(),
                error = %err,
                "pulse request failed"
            );
            RemoteError::Transport(err.to_string())
        })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| RemoteError::Transport(err.to_string()))?;
        debug!(request_id, status = status.as_u16(), body_len = body.len(), "pulse response");

        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message: error_message(status, &body),
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|err| RemoteError::Decode(err.to_string()))
    }

    pub(crate) async fn discovery(&self, scope: &ScopeKey) -> Result<Value, RemoteError> {
        let url = self.endpoint(&discovery_segments(scope))?;
        self.request(Method::GET, url, None).await
    }

    /// Server view of a docker host, or null once the host is gone.
    pub(crate) async fn docker_host(&self, host_id: &str) -> Result<Value, RemoteError> {
        let url = self.endpoint(&["api", "state"])?;
        let state = self.request(Method::GET, url, None).await?;
        Ok(state
            .get("dockerHosts")
            .and_then(Value::as_array)
            .and_then(|hosts| {
                hosts
                    .iter()
                    .find(|host| host.get("id").and_then(Value::as_str) == Some(host_id))
            })
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub(crate) async fn verify_audit_event(
        &self,
        event_id: &str,
    ) -> Result<VerifyResponse, RemoteError> {
        let url = self.endpoint(&["api", "audit", event_id, "verify"])?;
        let value = self.request(Method::GET, url, None).await?;
        serde_json::from_value(value).map_err(|err| RemoteError::Decode(err.to_string()))
    }
}

/// Request options of one user action.
#[derive(Clone, Debug)]
pub(crate) enum OperationRequest {
    Discovery {
        force: bool,
        hostname: Option<String>,
    },
    StopAgent,
    UpdateContainer {
        container_name: Option<String>,
    },
    UpdateAll,
    CheckUpdates,
}

impl OperationRequest {
    pub(crate) fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::Discovery { .. } => OperationKind::Discovery,
            OperationRequest::StopAgent => OperationKind::StopAgent,
            OperationRequest::UpdateContainer { .. } => OperationKind::UpdateContainer,
            OperationRequest::UpdateAll => OperationKind::UpdateAll,
            OperationRequest::CheckUpdates => OperationKind::CheckUpdates,
        }
    }
}

pub(crate) struct PulseTrigger {
    http: Arc<PulseHttp>,
    request: OperationRequest,
}

impl PulseTrigger {
    pub(crate) fn new(http: Arc<PulseHttp>, request: OperationRequest) -> Self {
        Self { http, request }
    }

    async fn accepted(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<TriggerOutcome, RemoteError> {
        let value = self.http.request(method, url, body).await?;
        let accepted = match serde_json::from_value::<TriggerAccepted>(value) {
            Ok(accepted) => Some(accepted),
            Err(err) => {
                debug!(error = %err, "trigger response carries no command status");
                None
            }
        };
        Ok(TriggerOutcome::Accepted(accepted))
    }
}

#[async_trait]
impl Trigger for PulseTrigger {
    async fn trigger(
        &self,
        scope: &ScopeKey,
        _kind: OperationKind,
    ) -> Result<TriggerOutcome, RemoteError> {
        let host = scope.host_id.as_str();
        match &self.request {
            OperationRequest::Discovery { force, hostname } => {
                let url = self.http.endpoint(&discovery_segments(scope))?;
                let body = json!({
                    "force": force,
                    "hostname": hostname.clone().unwrap_or_default(),
                });
                let value = self.http.request(Method::POST, url, Some(body)).await?;
                Ok(TriggerOutcome::Completed(value))
            }
            OperationRequest::StopAgent => {
                let url = self.http.endpoint(&["api", "agents", "docker", "hosts", host])?;
                self.accepted(Method::DELETE, url, None).await
            }
            OperationRequest::UpdateContainer { container_name } => {
                let url = self
                    .http
                    .endpoint(&["api", "agents", "docker", "containers", "update"])?;
                let body = json!({
                    "hostId": host,
                    "containerId": scope.resource_id,
                    "containerName": container_name.clone().unwrap_or_default(),
                });
                self.accepted(Method::POST, url, Some(body)).await
            }
            OperationRequest::UpdateAll => {
                let url = self
                    .http
                    .endpoint(&["api", "agents", "docker", "hosts", host, "update-all"])?;
                self.accepted(Method::POST, url, None).await
            }
            OperationRequest::CheckUpdates => {
                let url = self
                    .http
                    .endpoint(&["api", "agents", "docker", "hosts", host, "check-updates"])?;
                self.accepted(Method::POST, url, None).await
            }
        }
    }

    async fn force(&self, scope: &ScopeKey, _kind: OperationKind) -> Result<(), RemoteError> {
        if !matches!(self.request, OperationRequest::StopAgent) {
            return Ok(());
        }
        let mut url = self
            .http
            .endpoint(&["api", "agents", "docker", "hosts", scope.host_id.as_str()])?;
        url.query_pairs_mut().append_pair("force", "true");
        self.http.request(Method::DELETE, url, None).await?;
        Ok(())
    }
}

/// Reconciliation source matching the kind of operation being tracked.
pub(crate) struct PulseFetcher {
    http: Arc<PulseHttp>,
    kind: OperationKind,
}

impl PulseFetcher {
    pub(crate) fn new(http: Arc<PulseHttp>, kind: OperationKind) -> Self {
        Self { http, kind }
    }
}

#[async_trait]
impl ResourceFetcher for PulseFetcher {
    async fn fetch(&self, scope: &ScopeKey) -> Result<Value, RemoteError> {
        match self.kind {
            OperationKind::Discovery => self.http.discovery(scope).await,
            _ => self.http.docker_host(&scope.host_id).await,
        }
    }
}

fn discovery_segments(scope: &ScopeKey) -> [&str; 5] {
    [
        "api",
        "discovery",
        scope.resource_type.as_str(),
        scope.host_id.as_str(),
        scope.resource_id.as_str(),
    ]
}

fn endpoint_url(base: &Url, segments: &[&str]) -> Result<Url, RemoteError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| RemoteError::Transport(format!("invalid base url {base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Pulse reports errors as `{"error": ".."}`; fall back to the raw body.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["error", "message"] {
            if let Some(message) = value.get(key).and_then(Value::as_str) {
                return message.to_string();
            }
        }
    }
    let body = body.trim();
    if body.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string();
    }
    body.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ops_protocol::ResourceType;

    #[test]
    fn endpoint_encodes_segments_and_keeps_base_path() {
        let base = Url::parse("https://pulse.lan/pulse/").expect("url");
        let scope = ScopeKey::new(ResourceType::Docker, "dock 1", "web:v2");
        let url = endpoint_url(&base, &discovery_segments(&scope)).expect("endpoint");
        assert_eq!(
            url.as_str(),
            "https://pulse.lan/pulse/api/discovery/docker/dock%201/web:v2"
        );
    }

    #[test]
    fn endpoint_on_bare_host() {
        let base = Url::parse("http://127.0.0.1:7655").expect("url");
        let url = endpoint_url(&base, &["api", "state"]).expect("endpoint");
        assert_eq!(url.as_str(), "http://127.0.0.1:7655/api/state");
    }

    #[test]
    fn error_message_prefers_json_error() {
        assert_eq!(
            error_message(
                StatusCode::CONFLICT,
                r#"{"error":"Docker host already has a command in progress"}"#
            ),
            "Docker host already has a command in progress"
        );
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, "upstream down\n"), "upstream down");
        assert_eq!(error_message(StatusCode::NOT_FOUND, ""), "Not Found");
    }

    #[test]
    fn request_kinds() {
        assert_eq!(
            OperationRequest::Discovery {
                force: false,
                hostname: None
            }
            .kind(),
            OperationKind::Discovery
        );
        assert_eq!(OperationRequest::UpdateAll.kind(), OperationKind::UpdateAll);
    }
}
