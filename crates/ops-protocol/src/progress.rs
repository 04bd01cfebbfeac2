use serde::{Deserialize, Serialize};

use crate::{OperationStatus, ProtocolError, ScopeKey};

/// Progress notification as it arrives on the push channel. Every field except
/// `resource_id` and `status` is optional and validated in [`ProgressEvent::try_from`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub resource_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_complete: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressDetail {
    pub current_step: Option<String>,
    pub current_command: Option<String>,
    pub percent_complete: Option<f64>,
    pub elapsed_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressKind {
    Queued,
    Dispatched,
    Acknowledged,
    InProgress,
    Completed,
    Failed { reason: Option<String> },
    Expired { reason: Option<String> },
}

impl ProgressKind {
    pub fn status(&self) -> OperationStatus {
        match self {
            ProgressKind::Queued => OperationStatus::Queued,
            ProgressKind::Dispatched => OperationStatus::Dispatched,
            ProgressKind::Acknowledged => OperationStatus::Acknowledged,
            ProgressKind::InProgress => OperationStatus::InProgress,
            ProgressKind::Completed => OperationStatus::Completed,
            ProgressKind::Failed { .. } => OperationStatus::Failed,
            ProgressKind::Expired { .. } => OperationStatus::Expired,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ProgressKind::Failed { reason } | ProgressKind::Expired { reason } => {
                reason.as_deref()
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub scope: ScopeKey,
    pub kind: ProgressKind,
    pub message: Option<String>,
    pub detail: ProgressDetail,
    /// Server command the event belongs to, when the channel reports one.
    pub command_id: Option<String>,
}

impl ProgressEvent {
    pub fn new(scope: ScopeKey, kind: ProgressKind) -> Self {
        Self {
            scope,
            kind,
            message: None,
            detail: ProgressDetail::default(),
            command_id: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_detail(mut self, detail: ProgressDetail) -> Self {
        self.detail = detail;
        self
    }

    pub fn status(&self) -> OperationStatus {
        self.kind.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

impl TryFrom<ProgressPayload> for ProgressEvent {
    type Error = ProtocolError;

    fn try_from(payload: ProgressPayload) -> Result<Self, Self::Error> {
        let scope = ScopeKey::parse(payload.resource_id.trim())?;
        let status = OperationStatus::parse(&payload.status)?;
        let invalid = |field: &'static str, reason: String| ProtocolError::InvalidField {
            status: status.to_string(),
            field,
            reason,
        };

        let percent_complete = match payload.percent_complete {
            Some(value) if !value.is_finite() || !(0.0..=100.0).contains(&value) => {
                return Err(invalid("percent_complete", format!("{value} out of range")));
            }
            other => other,
        };
        let elapsed_ms = match payload.elapsed_ms {
            Some(value) if value < 0 => {
                return Err(invalid("elapsed_ms", format!("{value} is negative")));
            }
            Some(value) => Some(value as u64),
            None => None,
        };

        let error = non_empty(payload.error);
        let message = non_empty(payload.message);
        let kind = match status {
            OperationStatus::Queued => ProgressKind::Queued,
            OperationStatus::Dispatched => ProgressKind::Dispatched,
            OperationStatus::Acknowledged => ProgressKind::Acknowledged,
            OperationStatus::InProgress => ProgressKind::InProgress,
            // The discovery scanner reports a failed scan as completed with an error.
            OperationStatus::Completed if error.is_some() => ProgressKind::Failed { reason: error },
            OperationStatus::Completed => ProgressKind::Completed,
            OperationStatus::Failed => ProgressKind::Failed {
                reason: error.or_else(|| message.clone()),
            },
            OperationStatus::Expired => ProgressKind::Expired {
                reason: error.or_else(|| message.clone()),
            },
        };

        Ok(ProgressEvent {
            scope,
            kind,
            message,
            detail: ProgressDetail {
                current_step: non_empty(payload.current_step),
                current_command: non_empty(payload.current_command),
                percent_complete,
                elapsed_ms,
            },
            command_id: None,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceType;

    fn payload(status: &str) -> ProgressPayload {
        ProgressPayload {
            resource_id: "docker:host-1:web".to_string(),
            status: status.to_string(),
            ..ProgressPayload::default()
        }
    }

    #[test]
    fn decodes_discovery_progress_json() {
        let raw = r#"{
            "resource_id": "vm:pve1:101",
            "status": "running",
            "current_step": "running commands",
            "current_command": "systemctl list-units",
            "total_steps": 12,
            "completed_steps": 3,
            "percent_complete": 25,
            "elapsed_ms": 1840,
            "started_at": "2026-01-02T10:00:00Z"
        }"#;
        let payload: ProgressPayload = serde_json::from_str(raw).expect("payload");
        let event = ProgressEvent::try_from(payload).expect("event");
        assert_eq!(event.scope, ScopeKey::new(ResourceType::Vm, "pve1", "101"));
        assert_eq!(event.kind, ProgressKind::InProgress);
        assert_eq!(event.detail.percent_complete, Some(25.0));
        assert_eq!(event.detail.elapsed_ms, Some(1840));
        assert_eq!(
            event.detail.current_command.as_deref(),
            Some("systemctl list-units")
        );
    }

    #[test]
    fn completed_with_error_becomes_failed() {
        let mut raw = payload("completed");
        raw.error = Some("ssh: connection refused".to_string());
        let event = ProgressEvent::try_from(raw).expect("event");
        assert_eq!(
            event.kind,
            ProgressKind::Failed {
                reason: Some("ssh: connection refused".to_string())
            }
        );
    }

    #[test]
    fn failed_reason_falls_back_to_message() {
        let mut raw = payload("failed");
        raw.message = Some("image pull failed".to_string());
        let event = ProgressEvent::try_from(raw).expect("event");
        assert_eq!(event.kind.reason(), Some("image pull failed"));
    }

    #[test]
    fn blank_error_is_ignored() {
        let mut raw = payload("completed");
        raw.error = Some("  ".to_string());
        let event = ProgressEvent::try_from(raw).expect("event");
        assert_eq!(event.kind, ProgressKind::Completed);
    }

    #[test]
    fn rejects_out_of_range_percent() {
        let mut raw = payload("in_progress");
        raw.percent_complete = Some(140.0);
        assert!(matches!(
            ProgressEvent::try_from(raw),
            Err(ProtocolError::InvalidField {
                field: "percent_complete",
                ..
            })
        ));
    }

    #[test]
    fn rejects_negative_elapsed() {
        let mut raw = payload("dispatched");
        raw.elapsed_ms = Some(-5);
        assert!(ProgressEvent::try_from(raw).is_err());
    }

    #[test]
    fn rejects_malformed_resource_id() {
        let mut raw = payload("queued");
        raw.resource_id = "docker-web".to_string();
        assert!(matches!(
            ProgressEvent::try_from(raw),
            Err(ProtocolError::InvalidScopeKey(_))
        ));
    }
}
