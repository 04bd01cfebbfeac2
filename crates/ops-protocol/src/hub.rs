use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tracing::warn;

use crate::command::StateSnapshot;
use crate::progress::{ProgressEvent, ProgressPayload};
use crate::ProtocolError;

pub const OPERATION_PROGRESS: &str = "operation_progress";
pub const DISCOVERY_PROGRESS: &str = "ai_discovery_progress";
pub const RAW_DATA: &str = "rawData";
pub const INITIAL_STATE: &str = "initialState";

/// Envelope of every message the server hub pushes over the websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl HubMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_progress_channel(&self) -> bool {
        matches!(
            self.kind.as_str(),
            OPERATION_PROGRESS | DISCOVERY_PROGRESS | RAW_DATA | INITIAL_STATE
        )
    }

    /// Extracts the operation progress carried by this message. Messages on
    /// unrelated channels yield nothing. A state broadcast yields one event per
    /// docker host that currently carries a readable command.
    pub fn progress_events(&self, now: SystemTime) -> Result<Vec<ProgressEvent>, ProtocolError> {
        match self.kind.as_str() {
            OPERATION_PROGRESS | DISCOVERY_PROGRESS => {
                let payload: ProgressPayload = serde_json::from_value(self.data.clone())?;
                Ok(vec![ProgressEvent::try_from(payload)?])
            }
            RAW_DATA | INITIAL_STATE => {
                let state: StateSnapshot = serde_json::from_value(self.data.clone())?;
                let mut events = Vec::new();
                for host in &state.docker_hosts {
                    let Some(command) = host.command.as_ref() else {
                        continue;
                    };
                    match command.to_progress_event(&host.id, now) {
                        Ok(event) => events.push(event),
                        Err(err) => {
                            warn!(host = %host.id, command = %command.id, error = %err, "skipping unreadable docker command");
                        }
                    }
                }
                Ok(events)
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProgressKind, ScopeKey};

    #[test]
    fn operation_progress_message_yields_event() {
        let text = r#"{"type":"operation_progress","data":{"resource_id":"agent:dock-1:dock-1","status":"acknowledged"}}"#;
        let message = HubMessage::decode(text).expect("message");
        let events = message
            .progress_events(SystemTime::UNIX_EPOCH)
            .expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].scope, ScopeKey::agent("dock-1"));
        assert_eq!(events[0].kind, ProgressKind::Acknowledged);
    }

    #[test]
    fn state_broadcast_yields_command_events() {
        let text = r#"{
            "type": "rawData",
            "data": {
                "dockerHosts": [
                    {"id": "dock-1", "status": "online"},
                    {"id": "dock-2", "status": "online",
                     "command": {"id": "c9:web", "type": "update_container", "status": "in_progress"}}
                ]
            },
            "timestamp": "2026-03-01T10:00:00Z"
        }"#;
        let message = HubMessage::decode(text).expect("message");
        let events = message
            .progress_events(SystemTime::UNIX_EPOCH)
            .expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].scope.to_string(), "docker:dock-2:web");
        assert_eq!(events[0].kind, ProgressKind::InProgress);
    }

    #[test]
    fn unreadable_command_does_not_hide_other_hosts() {
        let text = r#"{
            "type": "initialState",
            "data": {
                "dockerHosts": [
                    {"id": "dock-1", "command": {"id": "c1", "type": "stop", "status": "rebooting"}},
                    {"id": "dock-2", "command": {"id": "c2", "type": "check_updates", "status": "completed"}}
                ]
            }
        }"#;
        let message = HubMessage::decode(text).expect("message");
        let events = message
            .progress_events(SystemTime::UNIX_EPOCH)
            .expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].scope, ScopeKey::agent("dock-2"));
        assert_eq!(events[0].kind, ProgressKind::Completed);
        assert_eq!(events[0].command_id.as_deref(), Some("c2"));
    }

    #[test]
    fn unrelated_channels_are_ignored() {
        let message =
            HubMessage::decode(r#"{"type":"alert","data":{"id":"a1"}}"#).expect("message");
        assert!(!message.is_progress_channel());
        assert!(message
            .progress_events(SystemTime::UNIX_EPOCH)
            .expect("events")
            .is_empty());
    }
}
