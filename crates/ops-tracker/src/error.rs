use std::time::Duration;

use ops_protocol::ScopeKey;

use crate::record::OperationState;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("{scope} already has an operation in progress ({state})")]
    AlreadyActive {
        scope: ScopeKey,
        state: OperationState,
    },
    #[error("no operation tracked for {0}")]
    NotTracked(ScopeKey),
    #[error("operation for {0} is already resolved")]
    AlreadyResolved(ScopeKey),
    #[error("override for {scope} not available yet ({elapsed:?} elapsed)")]
    OverrideUnavailable { scope: ScopeKey, elapsed: Duration },
}

/// Failure talking to the server, either while triggering an operation or
/// while fetching the authoritative resource state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid response: {0}")]
    Decode(String),
}
