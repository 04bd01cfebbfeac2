use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ops_protocol::ScopeKey;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RemoteError;

/// Fetches the authoritative server view of a resource.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, scope: &ScopeKey) -> Result<Value, RemoteError>;
}

#[derive(Debug)]
pub enum ReconcileOutcome {
    Replaced(Value),
    Failed(RemoteError),
    /// Torn down before the fetch result could be used.
    Discarded,
}

#[derive(Clone)]
pub struct Reconciler {
    fetcher: Arc<dyn ResourceFetcher>,
    delay: Duration,
}

impl Reconciler {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>, delay: Duration) -> Self {
        Self { fetcher, delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Waits the settle delay, then performs exactly one fetch. Failures are
    /// not retried.
    pub async fn run(&self, scope: &ScopeKey, token: &CancellationToken) -> ReconcileOutcome {
        tokio::select! {
            biased;
            _ = token.cancelled() => return ReconcileOutcome::Discarded,
            _ = tokio::time::sleep(self.delay) => {}
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return ReconcileOutcome::Discarded,
            result = self.fetcher.fetch(scope) => result,
        };
        if token.is_cancelled() {
            return ReconcileOutcome::Discarded;
        }

        match result {
            Ok(value) => {
                debug!(scope = %scope, "reconciled with server state");
                ReconcileOutcome::Replaced(value)
            }
            Err(err) => {
                warn!(scope = %scope, error = %err, "reconciliation fetch failed");
                ReconcileOutcome::Failed(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        latency: Duration,
        fail: bool,
    }

    #[async_trait]
    impl ResourceFetcher for CountingFetcher {
        async fn fetch(&self, scope: &ScopeKey) -> Result<Value, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            if self.fail {
                return Err(RemoteError::Status {
                    status: 502,
                    message: "bad gateway".to_string(),
                });
            }
            Ok(json!({ "id": scope.to_string() }))
        }
    }

    fn fetcher(latency: Duration, fail: bool) -> Arc<CountingFetcher> {
        Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            latency,
            fail,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_once_after_delay() {
        let fetcher = fetcher(Duration::ZERO, false);
        let reconciler = Reconciler::new(fetcher.clone(), Duration::from_millis(500));
        let scope = ScopeKey::agent("dock-1");
        let started = tokio::time::Instant::now();

        let outcome = reconciler.run(&scope, &CancellationToken::new()).await;
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(matches!(outcome, ReconcileOutcome::Replaced(value) if value["id"] == "agent:dock-1:dock-1"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_reported_without_retry() {
        let fetcher = fetcher(Duration::ZERO, true);
        let reconciler = Reconciler::new(fetcher.clone(), Duration::from_millis(500));
        let outcome = reconciler
            .run(&ScopeKey::agent("dock-1"), &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            ReconcileOutcome::Failed(RemoteError::Status { status: 502, .. })
        ));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_during_delay_skips_fetch() {
        let fetcher = fetcher(Duration::ZERO, false);
        let reconciler = Reconciler::new(fetcher.clone(), Duration::from_millis(500));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });
        let outcome = reconciler.run(&ScopeKey::agent("dock-1"), &token).await;
        assert!(matches!(outcome, ReconcileOutcome::Discarded));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_during_fetch_discards_result() {
        let fetcher = fetcher(Duration::from_secs(2), false);
        let reconciler = Reconciler::new(fetcher.clone(), Duration::from_millis(500));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let outcome = reconciler.run(&ScopeKey::agent("dock-1"), &token).await;
        assert!(matches!(outcome, ReconcileOutcome::Discarded));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
