use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ops_protocol::ScopeKey;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TrackerError;
use crate::record::{
    OperationKind, OperationRecord, OperationState, ProgressUpdate, ResolutionPath,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub enum StoreEvent {
    Upserted(OperationRecord),
    Cleared(ScopeKey),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Unchanged,
    Ignored,
}

/// Shared map of in-flight operations keyed by scope.
///
/// Every mutation happens under one lock and is broadcast to subscribers
/// before the call returns. The lock is never held across an await.
#[derive(Clone)]
pub struct OperationStore {
    records: Arc<Mutex<HashMap<ScopeKey, OperationRecord>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for OperationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, scope: &ScopeKey) -> Option<OperationRecord> {
        let records = self.records.lock().expect("store lock");
        records.get(scope).cloned()
    }

    pub fn list_active(&self) -> Vec<OperationRecord> {
        let records = self.records.lock().expect("store lock");
        let mut active: Vec<_> = records
            .values()
            .filter(|record| record.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|record| record.started_at);
        active
    }

    /// Starts a fresh operation instance. Fails while another instance for the
    /// same scope is still active and observed; idle, terminal and abandoned
    /// records are replaced.
    pub fn set_queued(
        &self,
        scope: ScopeKey,
        kind: OperationKind,
    ) -> Result<OperationRecord, TrackerError> {
        let mut records = self.records.lock().expect("store lock");
        let attempts = match records.get(&scope) {
            Some(existing) if existing.is_active() && existing.observers > 0 => {
                return Err(TrackerError::AlreadyActive {
                    scope,
                    state: existing.state,
                });
            }
            Some(existing) => {
                if existing.is_active() {
                    warn!(
                        scope = %scope,
                        instance = %existing.instance_id,
                        state = %existing.state,
                        "replacing operation nobody tracks anymore"
                    );
                }
                existing.attempts + 1
            }
            None => 1,
        };
        let record = OperationRecord::queued(scope.clone(), kind, attempts);
        info!(
            event = "operation.queued",
            scope = %scope,
            kind = ?kind,
            instance = %record.instance_id,
            attempts = attempts,
            "operation queued"
        );
        records.insert(scope, record.clone());
        let _ = self.events.send(StoreEvent::Upserted(record.clone()));
        Ok(record)
    }

    /// Registers another observer of the active instance for a scope.
    pub fn attach(&self, scope: &ScopeKey) -> Result<OperationRecord, TrackerError> {
        let mut records = self.records.lock().expect("store lock");
        let record = match records.get_mut(scope) {
            Some(record) if record.is_active() => record,
            _ => return Err(TrackerError::NotTracked(scope.clone())),
        };
        record.observers += 1;
        debug!(scope = %scope, instance = %record.instance_id, observers = record.observers, "observer attached");
        let _ = self.events.send(StoreEvent::Upserted(record.clone()));
        Ok(record.clone())
    }

    pub fn detach(&self, scope: &ScopeKey, instance_id: Uuid) -> bool {
        self.mutate_instance(scope, instance_id, |record| {
            if record.observers == 0 {
                return false;
            }
            record.observers -= 1;
            true
        })
    }

    pub fn set_command_id(&self, scope: &ScopeKey, instance_id: Uuid, command_id: &str) -> bool {
        self.mutate_instance(scope, instance_id, |record| {
            if record.command_id.as_deref() == Some(command_id) {
                return false;
            }
            record.command_id = Some(command_id.to_string());
            true
        })
    }

    pub fn apply_progress(&self, scope: &ScopeKey, update: ProgressUpdate) -> ApplyOutcome {
        let mut records = self.records.lock().expect("store lock");
        let Some(record) = records.get_mut(scope) else {
            return ApplyOutcome::Ignored;
        };
        if !record.is_active() {
            return ApplyOutcome::Ignored;
        }
        if let Some(instance_id) = update.instance_id {
            if instance_id != record.instance_id {
                return ApplyOutcome::Ignored;
            }
        }
        if let Some(next) = update.state {
            if !record.state.can_transition_to(next) {
                debug!(
                    scope = %scope,
                    from = %record.state,
                    to = %next,
                    "ignoring out-of-order progress"
                );
                return ApplyOutcome::Ignored;
            }
        }

        let state = update.state.unwrap_or(record.state);
        let message = update.message.or_else(|| record.message.clone());
        let progress = update.detail.unwrap_or_else(|| record.progress.clone());
        if state == record.state && message == record.message && progress == record.progress {
            return ApplyOutcome::Unchanged;
        }

        record.state = state;
        record.message = message;
        record.progress = progress;
        if state.is_terminal() {
            record.direct_pending = false;
        }
        let _ = self.events.send(StoreEvent::Upserted(record.clone()));
        ApplyOutcome::Applied
    }

    pub fn set_direct_pending(&self, scope: &ScopeKey, instance_id: Uuid, pending: bool) -> bool {
        self.mutate_instance(scope, instance_id, |record| {
            if record.direct_pending == pending {
                return false;
            }
            record.direct_pending = pending;
            true
        })
    }

    /// Check-and-set of the race guard. Returns true for exactly one caller per
    /// operation instance.
    pub fn claim_resolution(
        &self,
        scope: &ScopeKey,
        instance_id: Uuid,
        path: ResolutionPath,
    ) -> bool {
        let claimed = self.mutate_instance(scope, instance_id, |record| {
            if record.resolved_by.is_some() || !record.is_active() {
                return false;
            }
            record.resolved_by = Some(path);
            true
        });
        if claimed {
            debug!(scope = %scope, path = ?path, "resolution claimed");
        }
        claimed
    }

    /// Moves an active instance into a terminal state.
    pub fn resolve(
        &self,
        scope: &ScopeKey,
        instance_id: Uuid,
        state: OperationState,
        reason: Option<String>,
    ) -> bool {
        if !state.is_terminal() {
            return false;
        }
        let resolved = self.mutate_instance(scope, instance_id, |record| {
            if !record.state.can_transition_to(state) {
                return false;
            }
            record.state = state;
            record.direct_pending = false;
            record.failure_reason = match state {
                OperationState::Failed => {
                    Some(reason.clone().unwrap_or_else(|| "operation failed".to_string()))
                }
                OperationState::Expired => {
                    Some(reason.clone().unwrap_or_else(|| "operation expired".to_string()))
                }
                _ => None,
            };
            true
        });
        if resolved {
            info!(
                event = "operation.resolved",
                scope = %scope,
                instance = %instance_id,
                state = %state,
                reason = ?reason,
                "operation reached terminal state"
            );
        }
        resolved
    }

    pub fn clear(&self, scope: &ScopeKey) -> Option<OperationRecord> {
        let mut records = self.records.lock().expect("store lock");
        let removed = records.remove(scope);
        if removed.is_some() {
            let _ = self.events.send(StoreEvent::Cleared(scope.clone()));
        }
        removed
    }

    /// Clears the record only if it still belongs to the given instance.
    pub fn clear_instance(&self, scope: &ScopeKey, instance_id: Uuid) -> Option<OperationRecord> {
        let mut records = self.records.lock().expect("store lock");
        if records.get(scope).map(|record| record.instance_id) != Some(instance_id) {
            return None;
        }
        let removed = records.remove(scope);
        let _ = self.events.send(StoreEvent::Cleared(scope.clone()));
        removed
    }

    fn mutate_instance<F>(&self, scope: &ScopeKey, instance_id: Uuid, mutate: F) -> bool
    where
        F: FnOnce(&mut OperationRecord) -> bool,
    {
        let mut records = self.records.lock().expect("store lock");
        let Some(record) = records.get_mut(scope) else {
            return false;
        };
        if record.instance_id != instance_id {
            return false;
        }
        if !mutate(record) {
            return false;
        }
        let _ = self.events.send(StoreEvent::Upserted(record.clone()));
        true
    }
}
