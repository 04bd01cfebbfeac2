use std::time::Duration;

use ops_protocol::ScopeKey;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{OperationStore, StoreEvent};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ElapsedStatus {
    pub elapsed: Duration,
    pub timed_out: bool,
    pub active: bool,
}

impl ElapsedStatus {
    /// The manual override is offered only while the operation is still
    /// running past the threshold.
    pub fn can_force(&self) -> bool {
        self.active && self.timed_out
    }
}

pub fn evaluate(started_at: Instant, now: Instant, threshold: Duration) -> ElapsedStatus {
    let elapsed = now.saturating_duration_since(started_at);
    ElapsedStatus {
        elapsed,
        timed_out: elapsed > threshold,
        active: true,
    }
}

/// Periodic elapsed-time check for one operation instance. It only reports;
/// it never fails or cancels the operation.
pub struct TimeoutMonitor {
    status: watch::Receiver<ElapsedStatus>,
    handle: JoinHandle<()>,
    _guard: DropGuard,
}

impl TimeoutMonitor {
    pub fn spawn(
        store: OperationStore,
        scope: ScopeKey,
        instance_id: Uuid,
        tick: Duration,
        threshold: Duration,
        token: CancellationToken,
    ) -> Self {
        let (tx, status) = watch::channel(ElapsedStatus::default());
        let mut store_events = store.subscribe();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut flagged = false;
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    event = store_events.recv() => match event {
                        Ok(StoreEvent::Upserted(record)) if record.scope == scope => {
                            if record.instance_id != instance_id || !record.is_active() {
                                break;
                            }
                        }
                        Ok(StoreEvent::Cleared(cleared)) if cleared == scope => break,
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        let record = match store.get(&scope) {
                            Some(record) if record.instance_id == instance_id && record.is_active() => record,
                            _ => break,
                        };
                        let status = evaluate(record.started_at, Instant::now(), threshold);
                        if status.timed_out && !flagged {
                            flagged = true;
                            info!(
                                event = "operation.slow",
                                scope = %scope,
                                elapsed = ?status.elapsed,
                                "operation is taking longer than expected"
                            );
                        }
                        tx.send_replace(status);
                    }
                }
            }
            tx.send_modify(|status| status.active = false);
            debug!(scope = %scope, "timeout monitor stopped");
        });
        Self {
            status,
            handle,
            _guard: token.drop_guard(),
        }
    }

    pub fn status(&self) -> ElapsedStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ElapsedStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{OperationKind, OperationState};
    use ops_protocol::ResourceType;

    const TICK: Duration = Duration::from_secs(1);
    const THRESHOLD: Duration = Duration::from_secs(120);

    #[test]
    fn threshold_is_strict() {
        let start = Instant::now();
        assert!(!evaluate(start, start + Duration::from_secs(119), THRESHOLD).timed_out);
        assert!(!evaluate(start, start + THRESHOLD, THRESHOLD).timed_out);
        assert!(evaluate(start, start + Duration::from_secs(121), THRESHOLD).timed_out);
    }

    #[test]
    fn clock_skew_saturates_to_zero() {
        let start = Instant::now() + Duration::from_secs(5);
        let status = evaluate(start, Instant::now(), THRESHOLD);
        assert_eq!(status.elapsed, Duration::ZERO);
        assert!(!status.timed_out);
    }

    fn spawn_monitor(store: &OperationStore, scope: &ScopeKey, instance: Uuid) -> TimeoutMonitor {
        TimeoutMonitor::spawn(
            store.clone(),
            scope.clone(),
            instance,
            TICK,
            THRESHOLD,
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn flags_slow_operation_after_threshold() {
        let store = OperationStore::new();
        let scope = ScopeKey::new(ResourceType::Docker, "dock-1", "web");
        let record = store
            .set_queued(scope.clone(), OperationKind::UpdateContainer)
            .expect("queued");
        let monitor = spawn_monitor(&store, &scope, record.instance_id);

        tokio::time::sleep(Duration::from_millis(119_500)).await;
        let status = monitor.status();
        assert!(status.active);
        assert!(!status.timed_out);
        assert_eq!(status.elapsed, Duration::from_secs(119));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = monitor.status();
        assert!(status.timed_out);
        assert!(status.can_force());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_operation_resolves() {
        let store = OperationStore::new();
        let scope = ScopeKey::agent("dock-1");
        let record = store
            .set_queued(scope.clone(), OperationKind::StopAgent)
            .expect("queued");
        let monitor = spawn_monitor(&store, &scope, record.instance_id);

        tokio::time::sleep(Duration::from_millis(130_500)).await;
        assert!(monitor.status().can_force());

        store.resolve(&scope, record.instance_id, OperationState::Completed, None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = monitor.status();
        assert!(!status.active);
        assert!(!status.can_force());
        assert!(monitor.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_record_cleared() {
        let store = OperationStore::new();
        let scope = ScopeKey::agent("dock-1");
        let record = store
            .set_queued(scope.clone(), OperationKind::StopAgent)
            .expect("queued");
        let monitor = spawn_monitor(&store, &scope, record.instance_id);
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        store.clear(&scope);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!monitor.status().active);
        assert!(monitor.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_monitor_stops_ticking() {
        let store = OperationStore::new();
        let scope = ScopeKey::agent("dock-1");
        let record = store
            .set_queued(scope.clone(), OperationKind::StopAgent)
            .expect("queued");
        let monitor = spawn_monitor(&store, &scope, record.instance_id);
        let mut status = monitor.subscribe();
        drop(monitor);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!status.borrow_and_update().active);
        assert!(status.changed().await.is_err());
    }
}
