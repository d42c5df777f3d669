use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by [`crate::Engine::handle`] and the registries.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("inspection unavailable: {0}")]
    InspectionUnavailable(String),
    #[error("shared fetch timed out")]
    SharedFetchTimeout,
    #[error("hold requested with no channels")]
    InvalidSubscription,
    #[error("hold registry is full ({limit} connections)")]
    CapacityExceeded { limit: usize },
    #[error("backend fetch failed: {0}")]
    Fetch(#[source] FetchError),
}

impl EngineError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            EngineError::InspectionUnavailable(_) => "inspection_unavailable",
            EngineError::SharedFetchTimeout => "shared_fetch_timeout",
            EngineError::InvalidSubscription => "invalid_subscription",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::Fetch(_) => "fetch_failed",
        }
    }
}

impl From<FetchError> for EngineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout => EngineError::SharedFetchTimeout,
            other => EngineError::Fetch(other),
        }
    }
}

/// Outcome of a failed backend fetch. `Clone` because one failure is handed
/// to every waiter of a shared fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("fetch did not complete before the sharing timeout")]
    Timeout,
    #[error("fetch leader went away without resolving")]
    LeaderAbandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("write failed: {0}")]
    Write(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("publish bus has no subscribers")]
    NoSubscribers,
}

/// Reason code passed to the transport when the engine closes a held connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Cursor continuity could not be proven; the client should reconnect and
    /// re-declare its last ids.
    GapDetected,
    MessageLimit,
    ControlMessage,
    HoldTimeout,
    DeliveryFailed,
    Shutdown,
}

impl CloseReason {
    pub fn code(self) -> &'static str {
        match self {
            CloseReason::GapDetected => "gap_detected",
            CloseReason::MessageLimit => "message_limit",
            CloseReason::ControlMessage => "control_message",
            CloseReason::HoldTimeout => "hold_timeout",
            CloseReason::DeliveryFailed => "delivery_failed",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Whether the client is expected to reconnect straight away.
    pub fn should_reconnect(self) -> bool {
        matches!(
            self,
            CloseReason::GapDetected | CloseReason::HoldTimeout | CloseReason::Shutdown
        )
    }
}
