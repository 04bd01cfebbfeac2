use std::sync::Arc;

use ops_protocol::{ProgressEvent, ScopeKey};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// Receives the push events of one scope.
pub trait ProgressHandler: Send + Sync + 'static {
    fn on_progress(&self, event: &ProgressEvent);

    fn on_terminal(&self, event: &ProgressEvent);

    fn handle(&self, event: &ProgressEvent) {
        if event.is_terminal() {
            self.on_terminal(event);
        } else {
            self.on_progress(event);
        }
    }
}

/// Listener task bound to a scope. Dropping the subscription cancels the task.
pub struct PushSubscription {
    scope: ScopeKey,
    token: CancellationToken,
    handle: JoinHandle<()>,
    _guard: DropGuard,
}

impl PushSubscription {
    pub fn spawn(
        mut events: broadcast::Receiver<ProgressEvent>,
        scope: ScopeKey,
        handler: Arc<dyn ProgressHandler>,
        token: CancellationToken,
    ) -> Self {
        let task_scope = scope.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    received = events.recv() => received,
                };
                match received {
                    Ok(event) => {
                        if event.scope != task_scope {
                            continue;
                        }
                        if task_token.is_cancelled() {
                            break;
                        }
                        handler.handle(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(scope = %task_scope, skipped, "progress subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(scope = %task_scope, "progress subscriber stopped");
        });
        Self {
            scope,
            _guard: token.clone().drop_guard(),
            token,
            handle,
        }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
