use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use ops_protocol::{ProgressDetail, ProgressEvent, ScopeKey, TriggerAccepted};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::TrackerConfig;
use crate::error::{RemoteError, TrackerError};
use crate::monitor::{ElapsedStatus, TimeoutMonitor};
use crate::reconcile::{ReconcileOutcome, Reconciler, ResourceFetcher};
use crate::record::{
    OperationKind, OperationRecord, OperationState, ProgressUpdate, ResolutionPath,
};
use crate::store::{ApplyOutcome, OperationStore};
use crate::subscriber::{ProgressHandler, PushSubscription};

/// Everything a session needs from the surrounding application.
#[derive(Clone)]
pub struct TrackerContext {
    pub store: OperationStore,
    pub bus: EventBus,
    pub fetcher: Arc<dyn ResourceFetcher>,
    pub config: TrackerConfig,
}

impl TrackerContext {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>, config: TrackerConfig) -> Self {
        Self {
            store: OperationStore::new(),
            bus: EventBus::default(),
            fetcher,
            config,
        }
    }
}

#[derive(Debug)]
pub enum TriggerOutcome {
    /// The server finished the operation inside the request.
    Completed(Value),
    /// The server queued the operation; completion arrives on the push channel.
    Accepted(Option<TriggerAccepted>),
}

/// Starts the remote operation for a scope.
#[async_trait]
pub trait Trigger: Send + Sync {
    async fn trigger(
        &self,
        scope: &ScopeKey,
        kind: OperationKind,
    ) -> Result<TriggerOutcome, RemoteError>;

    /// Server-side counterpart of the manual override. Most operations have none.
    async fn force(&self, scope: &ScopeKey, kind: OperationKind) -> Result<(), RemoteError> {
        let _ = (scope, kind);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgressDisplay {
    pub state: OperationState,
    pub message: Option<String>,
    pub detail: ProgressDetail,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionView {
    pub state: OperationState,
    pub data: Option<Value>,
    pub progress: Option<ProgressDisplay>,
    pub error_banner: Option<String>,
    pub message: Option<String>,
    pub failure_reason: Option<String>,
    pub timed_out: bool,
    pub reconciling: bool,
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            state: OperationState::Idle,
            data: None,
            progress: None,
            error_banner: None,
            message: None,
            failure_reason: None,
            timed_out: false,
            reconciling: false,
        }
    }
}

impl SessionView {
    pub fn is_settled(&self) -> bool {
        !self.state.is_active() && !self.reconciling
    }
}

struct SessionShared {
    ctx: TrackerContext,
    scope: ScopeKey,
    kind: OperationKind,
    trigger: Arc<dyn Trigger>,
    reconciler: Reconciler,
    view: watch::Sender<SessionView>,
}

const MAX_HELD_EVENTS: usize = 64;

/// Which server command may drive this instance from the push path.
enum CommandFilter {
    /// Trigger request in flight. Tagged events wait until the server names
    /// its command; the host may still report its previous one.
    Pending(VecDeque<ProgressEvent>),
    Tracking(String),
    Any,
}

/// Per-instance glue between the push path, the direct path and the view.
struct InstanceHandler {
    shared: Arc<SessionShared>,
    instance_id: Uuid,
    token: CancellationToken,
    filter: Mutex<CommandFilter>,
}

impl InstanceHandler {
    fn store(&self) -> &OperationStore {
        &self.shared.ctx.store
    }

    fn scope(&self) -> &ScopeKey {
        &self.shared.scope
    }

    /// Events tagged with another server command belong to an earlier
    /// operation on the same scope.
    fn admit(&self, event: &ProgressEvent) -> bool {
        let Some(actual) = event.command_id.as_deref() else {
            return true;
        };
        let mut filter = self.filter.lock().expect("command filter lock");
        match &mut *filter {
            CommandFilter::Tracking(expected) => expected.as_str() == actual,
            CommandFilter::Any => true,
            CommandFilter::Pending(held) => {
                if held.len() == MAX_HELD_EVENTS {
                    held.pop_front();
                }
                held.push_back(event.clone());
                false
            }
        }
    }

    /// Ends the pending phase and replays held events of the tracked command.
    fn settle_filter(&self, command_id: Option<String>) {
        let next = match command_id.clone() {
            Some(id) => CommandFilter::Tracking(id),
            None => CommandFilter::Any,
        };
        let previous =
            std::mem::replace(&mut *self.filter.lock().expect("command filter lock"), next);
        let CommandFilter::Pending(held) = previous else {
            return;
        };
        let Some(command_id) = command_id else {
            if !held.is_empty() {
                debug!(scope = %self.scope(), dropped = held.len(), "dropping command events of unknown origin");
            }
            return;
        };
        for event in held
            .iter()
            .filter(|event| event.command_id.as_deref() == Some(command_id.as_str()))
        {
            self.handle(event);
        }
    }

    fn failure_reason(&self) -> Option<String> {
        self.store()
            .get(self.scope())
            .filter(|record| record.instance_id == self.instance_id)
            .and_then(|record| record.failure_reason)
    }

    async fn run_trigger(self: Arc<Self>) {
        if self.token.is_cancelled() {
            return;
        }
        let shared = self.shared.clone();
        self.store()
            .set_direct_pending(self.scope(), self.instance_id, true);
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => return,
            result = shared.trigger.trigger(&shared.scope, shared.kind) => result,
        };
        if self.token.is_cancelled() {
            return;
        }
        self.store()
            .set_direct_pending(self.scope(), self.instance_id, false);

        match result {
            Ok(TriggerOutcome::Completed(payload)) => {
                self.settle_filter(None);
                self.resolve_direct(payload);
            }
            Ok(TriggerOutcome::Accepted(accepted)) => self.accept(accepted),
            Err(err) => {
                self.settle_filter(None);
                self.fail_direct(err);
            }
        }
    }

    fn resolve_direct(&self, payload: Value) {
        if !self
            .store()
            .claim_resolution(self.scope(), self.instance_id, ResolutionPath::Direct)
        {
            debug!(scope = %self.scope(), "direct result discarded, already resolved");
            return;
        }
        self.store().resolve(
            self.scope(),
            self.instance_id,
            OperationState::Completed,
            None,
        );
        self.shared.view.send_modify(|view| {
            view.state = OperationState::Completed;
            view.data = Some(payload);
            view.progress = None;
            view.failure_reason = None;
        });
    }

    fn accept(&self, accepted: Option<TriggerAccepted>) {
        let Some(accepted) = accepted else {
            self.settle_filter(None);
            return;
        };
        let command_id = accepted
            .command_id
            .clone()
            .or_else(|| accepted.command.as_ref().map(|command| command.id.clone()))
            .filter(|id| !id.trim().is_empty());
        if let Some(command_id) = command_id.as_deref() {
            debug!(scope = %self.scope(), command_id = %command_id, "tracking server command");
            self.store()
                .set_command_id(self.scope(), self.instance_id, command_id);
        }
        self.settle_filter(command_id);
        if let Some(message) = accepted.message.clone().filter(|m| !m.trim().is_empty()) {
            self.shared.view.send_modify(|view| view.message = Some(message));
        }
        let Some(command) = accepted.command else {
            return;
        };
        match command.to_progress_event(&self.scope().host_id, SystemTime::now()) {
            Ok(event) if &event.scope == self.scope() => self.handle(&event),
            Ok(event) => {
                debug!(scope = %self.scope(), command_scope = %event.scope, "accepted command belongs to another scope");
            }
            Err(err) => {
                warn!(scope = %self.scope(), error = %err, "ignoring malformed command status");
            }
        }
    }

    fn fail_direct(&self, err: RemoteError) {
        warn!(scope = %self.scope(), error = %err, "operation request failed");
        if !self
            .store()
            .claim_resolution(self.scope(), self.instance_id, ResolutionPath::Direct)
        {
            debug!(scope = %self.scope(), "request failure discarded, already resolved");
            return;
        }
        let banner = format!("{} failed: {err}", self.shared.kind.initial_message());
        self.store().resolve(
            self.scope(),
            self.instance_id,
            OperationState::Failed,
            Some(err.to_string()),
        );
        let reason = self.failure_reason();
        self.shared.view.send_modify(|view| {
            view.error_banner = Some(banner);
            view.state = OperationState::Failed;
            view.failure_reason = reason;
            view.progress = None;
        });
    }

    fn spawn_reconcile(&self) {
        let shared = self.shared.clone();
        let token = self.token.child_token();
        tokio::spawn(async move {
            let outcome = shared.reconciler.run(&shared.scope, &token).await;
            shared.view.send_modify(|view| {
                match outcome {
                    ReconcileOutcome::Replaced(value) => view.data = Some(value),
                    ReconcileOutcome::Failed(err) => {
                        view.error_banner =
                            Some(format!("Could not refresh {}: {err}", shared.scope));
                    }
                    ReconcileOutcome::Discarded => return,
                }
                view.progress = None;
                view.reconciling = false;
            });
        });
    }
}

impl ProgressHandler for InstanceHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        if self.token.is_cancelled() || !self.admit(event) {
            return;
        }
        let update = ProgressUpdate::from_event(event).for_instance(self.instance_id);
        if self.store().apply_progress(self.scope(), update) != ApplyOutcome::Applied {
            return;
        }
        let state = OperationState::from(event.status());
        self.shared.view.send_modify(|view| {
            view.state = state;
            if event.message.is_some() {
                view.message = event.message.clone();
            }
            view.progress = Some(ProgressDisplay {
                state,
                message: view.message.clone(),
                detail: event.detail.clone(),
            });
        });
    }

    fn on_terminal(&self, event: &ProgressEvent) {
        if self.token.is_cancelled() || !self.admit(event) {
            return;
        }
        if !self
            .store()
            .claim_resolution(self.scope(), self.instance_id, ResolutionPath::Push)
        {
            debug!(scope = %self.scope(), status = %event.status(), "push resolution suppressed");
            return;
        }
        let state = OperationState::from(event.status());
        let update = ProgressUpdate::from_event(event)
            .for_instance(self.instance_id)
            .without_state();
        self.store().apply_progress(self.scope(), update);
        self.store().resolve(
            self.scope(),
            self.instance_id,
            state,
            event.kind.reason().map(str::to_string),
        );
        let reason = self.failure_reason();
        self.shared.view.send_modify(|view| {
            view.state = state;
            view.failure_reason = reason;
            if event.message.is_some() {
                view.message = event.message.clone();
            }
            view.progress = Some(ProgressDisplay {
                state,
                message: view.message.clone(),
                detail: event.detail.clone(),
            });
            view.reconciling = true;
        });
        self.spawn_reconcile();
    }
}

struct ActiveInstance {
    id: Uuid,
    token: CancellationToken,
    monitor: TimeoutMonitor,
    _subscription: PushSubscription,
    store: OperationStore,
    scope: ScopeKey,
}

impl Drop for ActiveInstance {
    fn drop(&mut self) {
        self.token.cancel();
        self.store.detach(&self.scope, self.id);
    }
}

/// One tracked operation as seen by a single consumer. Dropping or closing
/// the session tears down its subscription, monitor and pending fetches.
pub struct OperationSession {
    shared: Arc<SessionShared>,
    root: CancellationToken,
    instance: Option<ActiveInstance>,
}

impl OperationSession {
    /// Queues the operation, subscribes to push events and fires the trigger
    /// request. Must be called inside a tokio runtime.
    pub fn start(
        ctx: TrackerContext,
        scope: ScopeKey,
        kind: OperationKind,
        trigger: Arc<dyn Trigger>,
    ) -> Result<Self, TrackerError> {
        let mut session = Self::detached(ctx, scope, kind, trigger);
        session.launch()?;
        Ok(session)
    }

    /// Follows the operation already running for a scope, e.g. after the
    /// session that started it was closed. The trigger is not fired again.
    pub fn attach(
        ctx: TrackerContext,
        scope: ScopeKey,
        trigger: Arc<dyn Trigger>,
    ) -> Result<Self, TrackerError> {
        let record = ctx.store.attach(&scope)?;
        let mut session = Self::detached(ctx, scope, record.kind, trigger);
        let filter = match record.command_id.clone() {
            Some(id) => CommandFilter::Tracking(id),
            None => CommandFilter::Any,
        };
        info!(event = "operation.attached", scope = %session.shared.scope, instance = %record.instance_id, state = %record.state, "following running operation");
        session.spawn_instance(record, filter, false);
        Ok(session)
    }

    fn detached(
        ctx: TrackerContext,
        scope: ScopeKey,
        kind: OperationKind,
        trigger: Arc<dyn Trigger>,
    ) -> Self {
        let reconciler = Reconciler::new(ctx.fetcher.clone(), ctx.config.reconcile_delay);
        let (view, _) = watch::channel(SessionView::default());
        Self {
            shared: Arc::new(SessionShared {
                ctx,
                scope,
                kind,
                trigger,
                reconciler,
                view,
            }),
            root: CancellationToken::new(),
            instance: None,
        }
    }

    fn launch(&mut self) -> Result<(), TrackerError> {
        let record = self
            .shared
            .ctx
            .store
            .set_queued(self.shared.scope.clone(), self.shared.kind)?;
        self.spawn_instance(record, CommandFilter::Pending(VecDeque::new()), true);
        Ok(())
    }

    fn spawn_instance(&mut self, record: OperationRecord, filter: CommandFilter, fire: bool) {
        // Drop the previous instance only once the fresh record exists.
        self.instance = None;
        let shared = self.shared.clone();
        let store = &shared.ctx.store;

        let token = self.root.child_token();
        let handler = Arc::new(InstanceHandler {
            shared: shared.clone(),
            instance_id: record.instance_id,
            token: token.clone(),
            filter: Mutex::new(filter),
        });
        let subscription = PushSubscription::spawn(
            shared.ctx.bus.subscribe(),
            shared.scope.clone(),
            handler.clone(),
            token.child_token(),
        );
        let monitor = TimeoutMonitor::spawn(
            store.clone(),
            shared.scope.clone(),
            record.instance_id,
            shared.ctx.config.tick_interval,
            shared.ctx.config.timeout_threshold,
            token.child_token(),
        );

        let progress = (record.state != OperationState::Queued).then(|| ProgressDisplay {
            state: record.state,
            message: record.message.clone(),
            detail: record.progress.clone(),
        });
        shared.view.send_modify(|view| {
            view.state = record.state;
            view.message = record.message.clone();
            view.progress = progress;
            view.error_banner = None;
            view.failure_reason = None;
            view.timed_out = false;
            view.reconciling = false;
        });
        tokio::spawn(forward_elapsed(
            shared.clone(),
            monitor.subscribe(),
            token.clone(),
        ));
        if fire {
            tokio::spawn(handler.run_trigger());
        }

        self.instance = Some(ActiveInstance {
            id: record.instance_id,
            token,
            monitor,
            _subscription: subscription,
            store: store.clone(),
            scope: shared.scope.clone(),
        });
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.shared.scope
    }

    pub fn kind(&self) -> OperationKind {
        self.shared.kind
    }

    pub fn instance_id(&self) -> Option<Uuid> {
        self.instance.as_ref().map(|instance| instance.id)
    }

    pub fn record(&self) -> Option<OperationRecord> {
        let id = self.instance_id()?;
        self.shared
            .ctx
            .store
            .get(&self.shared.scope)
            .filter(|record| record.instance_id == id)
    }

    pub fn view(&self) -> SessionView {
        self.shared.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.shared.view.subscribe()
    }

    pub fn elapsed(&self) -> ElapsedStatus {
        self.instance
            .as_ref()
            .map(|instance| instance.monitor.status())
            .unwrap_or_default()
    }

    /// Waits until the operation is terminal and any reconciliation finished,
    /// or the session is torn down.
    pub async fn settled(&self) -> SessionView {
        let mut view = self.shared.view.subscribe();
        loop {
            {
                let current = view.borrow_and_update();
                if current.is_settled() {
                    return current.clone();
                }
            }
            tokio::select! {
                biased;
                _ = self.root.cancelled() => break,
                changed = view.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        let current = view.borrow().clone();
        current
    }

    /// Manual escape hatch once the operation runs past the timeout threshold.
    /// Resolves the operation locally as expired.
    pub async fn force_resolve(&self) -> Result<(), TrackerError> {
        let scope = &self.shared.scope;
        let instance = self
            .instance
            .as_ref()
            .ok_or_else(|| TrackerError::NotTracked(scope.clone()))?;
        let status = instance.monitor.status();
        if !status.can_force() {
            return Err(TrackerError::OverrideUnavailable {
                scope: scope.clone(),
                elapsed: status.elapsed,
            });
        }
        let store = &self.shared.ctx.store;
        if !store.claim_resolution(scope, instance.id, ResolutionPath::Forced) {
            return Err(TrackerError::AlreadyResolved(scope.clone()));
        }

        let waited = Duration::from_secs(status.elapsed.as_secs());
        let reason = format!(
            "skipped waiting after {}",
            humantime::format_duration(waited)
        );
        store.resolve(
            scope,
            instance.id,
            OperationState::Expired,
            Some(reason.clone()),
        );
        info!(event = "operation.forced", scope = %scope, waited = ?waited, "operation resolved manually");
        self.shared.view.send_modify(|view| {
            view.state = OperationState::Expired;
            view.failure_reason = Some(reason);
            view.progress = None;
            view.timed_out = false;
        });

        if let Err(err) = self.shared.trigger.force(scope, self.shared.kind).await {
            warn!(scope = %scope, error = %err, "forced cleanup request failed");
            self.shared.view.send_modify(|view| {
                view.error_banner = Some(format!("Forced cleanup failed: {err}"));
            });
        }
        Ok(())
    }

    /// User cancel: drops the record and stops tracking.
    pub fn cancel(&mut self) -> bool {
        let Some(instance) = self.instance.take() else {
            return false;
        };
        let id = instance.id;
        drop(instance);
        let cleared = self
            .shared
            .ctx
            .store
            .clear_instance(&self.shared.scope, id)
            .is_some();
        self.shared.view.send_modify(|view| {
            view.state = OperationState::Idle;
            view.message = None;
            view.progress = None;
            view.timed_out = false;
            view.reconciling = false;
        });
        info!(event = "operation.cancelled", scope = %self.shared.scope, "operation cancelled");
        cleared
    }

    /// Starts a fresh instance after the previous one ended.
    pub fn retry(&mut self) -> Result<(), TrackerError> {
        self.launch()
    }

    pub fn dismiss_error(&self) {
        self.shared.view.send_if_modified(|view| view.error_banner.take().is_some());
    }

    pub fn close(self) {
        debug!(scope = %self.shared.scope, "closing operation session");
    }
}

impl Drop for OperationSession {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn forward_elapsed(
    shared: Arc<SessionShared>,
    mut status: watch::Receiver<ElapsedStatus>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let timed_out = status.borrow_and_update().can_force();
        shared.view.send_if_modified(|view| {
            if view.timed_out == timed_out {
                return false;
            }
            view.timed_out = timed_out;
            true
        });
    }
}
