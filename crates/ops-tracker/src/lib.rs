pub mod bus;
pub mod config;
pub mod error;
pub mod monitor;
pub mod reconcile;
pub mod record;
pub mod resume;
pub mod session;
pub mod store;
pub mod subscriber;

pub use bus::EventBus;
pub use config::TrackerConfig;
pub use error::{RemoteError, TrackerError};
pub use monitor::{ElapsedStatus, TimeoutMonitor};
pub use reconcile::{ReconcileOutcome, Reconciler, ResourceFetcher};
pub use record::{OperationKind, OperationRecord, OperationState, ProgressUpdate, ResolutionPath};
pub use session::{
    OperationSession, ProgressDisplay, SessionView, TrackerContext, Trigger, TriggerOutcome,
};
pub use store::{ApplyOutcome, OperationStore, StoreEvent};
pub use subscriber::{ProgressHandler, PushSubscription};
