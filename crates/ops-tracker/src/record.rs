use serde::Serialize;
use std::fmt;
use std::time::SystemTime;
use tokio::time::Instant;
use uuid::Uuid;

use ops_protocol::{OperationStatus, ProgressDetail, ProgressEvent, ScopeKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Idle,
    Queued,
    Dispatched,
    Acknowledged,
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl OperationState {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationState::Idle => "idle",
            OperationState::Queued => "queued",
            OperationState::Dispatched => "dispatched",
            OperationState::Acknowledged => "acknowledged",
            OperationState::InProgress => "in_progress",
            OperationState::Completed => "completed",
            OperationState::Failed => "failed",
            OperationState::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Expired
        )
    }

    pub fn is_active(self) -> bool {
        self != OperationState::Idle && !self.is_terminal()
    }

    fn rank(self) -> u8 {
        match self {
            OperationState::Idle => 0,
            OperationState::Queued => 1,
            OperationState::Dispatched => 2,
            OperationState::Acknowledged => 3,
            OperationState::InProgress => 4,
            OperationState::Completed | OperationState::Failed | OperationState::Expired => 5,
        }
    }

    /// Non-terminal progress only moves forward; terminal states are reachable
    /// from any active state and never left.
    pub fn can_transition_to(self, next: OperationState) -> bool {
        if !self.is_active() || next == OperationState::Idle {
            return false;
        }
        next.is_terminal() || next.rank() >= self.rank()
    }
}

impl From<OperationStatus> for OperationState {
    fn from(status: OperationStatus) -> Self {
        match status {
            OperationStatus::Queued => OperationState::Queued,
            OperationStatus::Dispatched => OperationState::Dispatched,
            OperationStatus::Acknowledged => OperationState::Acknowledged,
            OperationStatus::InProgress => OperationState::InProgress,
            OperationStatus::Completed => OperationState::Completed,
            OperationStatus::Failed => OperationState::Failed,
            OperationStatus::Expired => OperationState::Expired,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Discovery,
    StopAgent,
    UpdateContainer,
    UpdateAll,
    CheckUpdates,
}

impl OperationKind {
    pub fn initial_message(self) -> &'static str {
        match self {
            OperationKind::Discovery => "Running discovery",
            OperationKind::StopAgent => "Stopping agent",
            OperationKind::UpdateContainer => "Updating container",
            OperationKind::UpdateAll => "Updating containers",
            OperationKind::CheckUpdates => "Checking for container updates",
        }
    }
}

/// Which path performed the terminal side effect for an operation instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPath {
    Direct,
    Push,
    Forced,
}

#[derive(Clone, Debug)]
pub struct OperationRecord {
    pub scope: ScopeKey,
    pub instance_id: Uuid,
    pub kind: OperationKind,
    pub state: OperationState,
    pub started_at: Instant,
    pub created_at: SystemTime,
    pub message: Option<String>,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub progress: ProgressDetail,
    pub resolved_by: Option<ResolutionPath>,
    pub direct_pending: bool,
    /// Server command the push path resolves this instance with, once known.
    pub command_id: Option<String>,
    /// Live sessions tracking this instance.
    pub observers: u32,
}

impl OperationRecord {
    pub(crate) fn queued(scope: ScopeKey, kind: OperationKind, attempts: u32) -> Self {
        Self {
            scope,
            instance_id: Uuid::new_v4(),
            kind,
            state: OperationState::Queued,
            started_at: Instant::now(),
            created_at: SystemTime::now(),
            message: Some(kind.initial_message().to_string()),
            failure_reason: None,
            attempts,
            progress: ProgressDetail::default(),
            resolved_by: None,
            direct_pending: false,
            command_id: None,
            observers: 1,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

/// Partial update merged into a record by [`crate::OperationStore::apply_progress`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgressUpdate {
    pub instance_id: Option<Uuid>,
    pub state: Option<OperationState>,
    pub message: Option<String>,
    pub detail: Option<ProgressDetail>,
}

impl ProgressUpdate {
    pub fn from_event(event: &ProgressEvent) -> Self {
        Self {
            instance_id: None,
            state: Some(event.status().into()),
            message: event.message.clone(),
            detail: Some(event.detail.clone()),
        }
    }

    pub fn for_instance(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    /// Keeps the message and progress detail but leaves the state alone.
    pub fn without_state(mut self) -> Self {
        self.state = None;
        self
    }
}
