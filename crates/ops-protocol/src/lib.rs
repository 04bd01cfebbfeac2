use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod command;
pub mod hub;
pub mod progress;

pub use command::{CommandKind, CommandStatus, TriggerAccepted};
pub use hub::HubMessage;
pub use progress::{ProgressDetail, ProgressEvent, ProgressKind, ProgressPayload};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid resource id {0:?}, expected type:host:id")]
    InvalidScopeKey(String),
    #[error("unknown operation status {0:?}")]
    UnknownStatus(String),
    #[error("invalid {field} in {status} event: {reason}")]
    InvalidField {
        status: String,
        field: &'static str,
        reason: String,
    },
    #[error("malformed hub message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Vm,
    SystemContainer,
    Docker,
    K8s,
    Host,
    DockerVm,
    DockerSystemContainer,
    Agent,
    Other(String),
}

impl ResourceType {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceType::Vm => "vm",
            ResourceType::SystemContainer => "system-container",
            ResourceType::Docker => "docker",
            ResourceType::K8s => "k8s",
            ResourceType::Host => "host",
            ResourceType::DockerVm => "docker_vm",
            ResourceType::DockerSystemContainer => "docker_system-container",
            ResourceType::Agent => "agent",
            ResourceType::Other(value) => value.as_str(),
        }
    }
}

impl From<&str> for ResourceType {
    fn from(value: &str) -> Self {
        match value {
            "vm" => ResourceType::Vm,
            "system-container" => ResourceType::SystemContainer,
            "docker" => ResourceType::Docker,
            "k8s" => ResourceType::K8s,
            "host" => ResourceType::Host,
            "docker_vm" => ResourceType::DockerVm,
            "docker_system-container" => ResourceType::DockerSystemContainer,
            "agent" => ResourceType::Agent,
            other => ResourceType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the resource a long-running operation belongs to.
///
/// Rendered as `type:host:id`. Only the first two separators are significant,
/// so resource ids that contain `:` survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey {
    pub resource_type: ResourceType,
    pub host_id: String,
    pub resource_id: String,
}

impl ScopeKey {
    pub fn new(
        resource_type: impl Into<ResourceType>,
        host_id: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            host_id: host_id.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Scope used for host-wide docker agent commands (stop, update all, check updates).
    pub fn agent(host_id: impl Into<String>) -> Self {
        let host_id = host_id.into();
        Self {
            resource_type: ResourceType::Agent,
            resource_id: host_id.clone(),
            host_id,
        }
    }

    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidScopeKey(value.to_string());
        let (resource_type, rest) = value.split_once(':').ok_or_else(invalid)?;
        let (host_id, resource_id) = rest.split_once(':').ok_or_else(invalid)?;
        if resource_type.trim().is_empty() || host_id.trim().is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(resource_type, host_id, resource_id))
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource_type, self.host_id, self.resource_id
        )
    }
}

impl FromStr for ScopeKey {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ScopeKey::parse(value)
    }
}

impl Serialize for ScopeKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ScopeKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ScopeKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Dispatched,
    Acknowledged,
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl OperationStatus {
    /// Accepts both the operation/command vocabulary and the discovery
    /// scanner's `running` status.
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        match value.trim() {
            "queued" => Ok(OperationStatus::Queued),
            "dispatched" => Ok(OperationStatus::Dispatched),
            "acknowledged" => Ok(OperationStatus::Acknowledged),
            "in_progress" | "running" => Ok(OperationStatus::InProgress),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            "expired" => Ok(OperationStatus::Expired),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Queued => "queued",
            OperationStatus::Dispatched => "dispatched",
            OperationStatus::Acknowledged => "acknowledged",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Expired
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_key_roundtrip() {
        let key = ScopeKey::new(ResourceType::Docker, "host-1", "web");
        assert_eq!(key.to_string(), "docker:host-1:web");
        let parsed: ScopeKey = "docker:host-1:web".parse().expect("parse");
        assert_eq!(parsed, key);
    }

    #[test]
    fn scope_key_keeps_colons_in_resource_id() {
        let parsed = ScopeKey::parse("k8s:cluster-a:default:nginx-7f9c").expect("parse");
        assert_eq!(parsed.resource_type, ResourceType::K8s);
        assert_eq!(parsed.host_id, "cluster-a");
        assert_eq!(parsed.resource_id, "default:nginx-7f9c");
        assert_eq!(parsed.to_string(), "k8s:cluster-a:default:nginx-7f9c");
    }

    #[test]
    fn scope_key_rejects_short_or_empty_parts() {
        assert!(ScopeKey::parse("vm:101").is_err());
        assert!(ScopeKey::parse(":node:101").is_err());
        assert!(ScopeKey::parse("vm::101").is_err());
    }

    #[test]
    fn unknown_resource_type_is_preserved() {
        let parsed = ScopeKey::parse("pbs:backup-1:datastore").expect("parse");
        assert_eq!(parsed.resource_type, ResourceType::Other("pbs".to_string()));
        assert_eq!(parsed.to_string(), "pbs:backup-1:datastore");
    }

    #[test]
    fn agent_scope_uses_host_for_both_ids() {
        assert_eq!(ScopeKey::agent("dock-7").to_string(), "agent:dock-7:dock-7");
    }

    #[test]
    fn status_parse_maps_running_to_in_progress() {
        assert_eq!(
            OperationStatus::parse("running").expect("status"),
            OperationStatus::InProgress
        );
        assert!(OperationStatus::parse("paused").is_err());
        assert!(OperationStatus::Expired.is_terminal());
        assert!(!OperationStatus::Acknowledged.is_terminal());
    }
}
