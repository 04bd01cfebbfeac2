use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::progress::{ProgressEvent, ProgressKind};
use crate::{OperationStatus, ProtocolError, ResourceType, ScopeKey};

pub const EXPIRED_BEFORE_ACK: &str = "command expired before agent acknowledged it";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Stop,
    UpdateContainer,
    UpdateAll,
    CheckUpdates,
    #[serde(other)]
    Unknown,
}

/// Docker host command status as published by the server inside docker host state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatus {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

impl CommandStatus {
    /// Container update commands carry the container id after the first `:`
    /// of the command id.
    pub fn container_id(&self) -> Option<&str> {
        if self.kind != CommandKind::UpdateContainer {
            return None;
        }
        self.id
            .split_once(':')
            .map(|(_, container)| container)
            .filter(|container| !container.is_empty())
    }

    pub fn scope(&self, host_id: &str) -> ScopeKey {
        match self.container_id() {
            Some(container) => ScopeKey::new(ResourceType::Docker, host_id, container),
            None => ScopeKey::agent(host_id),
        }
    }

    pub fn has_expired(&self, now: SystemTime) -> bool {
        self.expires_at
            .as_deref()
            .and_then(|raw| humantime::parse_rfc3339_weak(raw).ok())
            .map(|expires_at| now > expires_at)
            .unwrap_or(false)
    }

    pub fn to_progress_event(
        &self,
        host_id: &str,
        now: SystemTime,
    ) -> Result<ProgressEvent, ProtocolError> {
        let status = OperationStatus::parse(&self.status)?;
        let message = self
            .message
            .as_ref()
            .map(|message| message.trim().to_string())
            .filter(|message| !message.is_empty());
        let reason = self
            .failure_reason
            .as_ref()
            .map(|reason| reason.trim().to_string())
            .filter(|reason| !reason.is_empty());
        let kind = if !status.is_terminal() && self.has_expired(now) {
            ProgressKind::Expired {
                reason: Some(EXPIRED_BEFORE_ACK.to_string()),
            }
        } else {
            match status {
                OperationStatus::Queued => ProgressKind::Queued,
                OperationStatus::Dispatched => ProgressKind::Dispatched,
                OperationStatus::Acknowledged => ProgressKind::Acknowledged,
                OperationStatus::InProgress => ProgressKind::InProgress,
                OperationStatus::Completed => ProgressKind::Completed,
                OperationStatus::Failed => ProgressKind::Failed { reason },
                OperationStatus::Expired => ProgressKind::Expired { reason },
            }
        };
        let mut event = ProgressEvent::new(self.scope(host_id), kind);
        event.message = message;
        event.command_id = Some(self.id.clone());
        Ok(event)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerHostState {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub pending_uninstall: bool,
    #[serde(default)]
    pub command: Option<CommandStatus>,
}

/// The slice of the server state broadcast this crate cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    #[serde(default)]
    pub docker_hosts: Vec<DockerHostState>,
}

impl StateSnapshot {
    pub fn docker_host(&self, host_id: &str) -> Option<&DockerHostState> {
        self.docker_hosts.iter().find(|host| host.id == host_id)
    }
}

/// Response body of trigger endpoints that accept a request for later completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerAccepted {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub command: Option<CommandStatus>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn command(kind: CommandKind, id: &str, status: &str) -> CommandStatus {
        CommandStatus {
            id: id.to_string(),
            kind,
            status: status.to_string(),
            message: None,
            created_at: None,
            updated_at: None,
            dispatched_at: None,
            acknowledged_at: None,
            completed_at: None,
            failed_at: None,
            failure_reason: None,
            expires_at: None,
        }
    }

    #[test]
    fn decodes_server_command_json() {
        let raw = r#"{
            "id": "3f1c",
            "type": "stop",
            "status": "dispatched",
            "message": "Stopping agent",
            "createdAt": "2026-03-01T10:00:00Z",
            "updatedAt": "2026-03-01T10:00:05Z",
            "dispatchedAt": "2026-03-01T10:00:05Z",
            "expiresAt": "2026-03-01T10:10:00Z"
        }"#;
        let status: CommandStatus = serde_json::from_str(raw).expect("command");
        assert_eq!(status.kind, CommandKind::Stop);
        assert_eq!(status.scope("dock-1"), ScopeKey::agent("dock-1"));
        let event = status
            .to_progress_event("dock-1", SystemTime::UNIX_EPOCH)
            .expect("event");
        assert_eq!(event.kind, ProgressKind::Dispatched);
        assert_eq!(event.message.as_deref(), Some("Stopping agent"));
        assert_eq!(event.command_id.as_deref(), Some("3f1c"));
    }

    #[test]
    fn unknown_command_type_is_tolerated() {
        let raw = r#"{"id":"x","type":"reboot","status":"queued"}"#;
        let status: CommandStatus = serde_json::from_str(raw).expect("command");
        assert_eq!(status.kind, CommandKind::Unknown);
    }

    #[test]
    fn container_update_scopes_to_container() {
        let status = command(CommandKind::UpdateContainer, "9a2e:abc123", "queued");
        assert_eq!(status.container_id(), Some("abc123"));
        assert_eq!(status.scope("dock-1").to_string(), "docker:dock-1:abc123");
    }

    #[test]
    fn overdue_active_command_maps_to_expired() {
        let mut status = command(CommandKind::Stop, "c1", "queued");
        status.expires_at = Some("2026-03-01T10:10:00Z".to_string());
        let expiry = humantime::parse_rfc3339("2026-03-01T10:10:00Z").expect("time");

        let before = status
            .to_progress_event("dock-1", expiry - Duration::from_secs(1))
            .expect("event");
        assert_eq!(before.kind, ProgressKind::Queued);

        let after = status
            .to_progress_event("dock-1", expiry + Duration::from_secs(1))
            .expect("event");
        assert_eq!(after.kind.reason(), Some(EXPIRED_BEFORE_ACK));
    }

    #[test]
    fn failed_command_keeps_failure_reason() {
        let mut status = command(CommandKind::UpdateAll, "c2", "failed");
        status.failure_reason = Some("registry unreachable".to_string());
        let event = status
            .to_progress_event("dock-1", SystemTime::UNIX_EPOCH)
            .expect("event");
        assert_eq!(event.kind.reason(), Some("registry unreachable"));
    }

    #[test]
    fn state_snapshot_finds_host() {
        let raw = r#"{"dockerHosts":[{"id":"dock-1","status":"online","pendingUninstall":true}],"nodes":[]}"#;
        let snapshot: StateSnapshot = serde_json::from_str(raw).expect("state");
        let host = snapshot.docker_host("dock-1").expect("host");
        assert!(host.pending_uninstall);
        assert!(snapshot.docker_host("dock-2").is_none());
    }
}
