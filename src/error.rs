//! Error types for the batching dispatcher.

use thiserror::Error;

use crate::ids::TaskId;

/// Errors surfaced to a caller awaiting a task's result.
///
/// Per the core's failure semantics, `Timeout` is the only failure a caller
/// ever observes directly; a failing prediction function instead shows up as
/// a [`PredictionFailure`] occupying an individual item's slot in the
/// returned vector (see [`crate::future::FutureSlot::await_result`]).
#[derive(Debug, Error)]
pub enum StreamerError {
    #[error("task {0} timed out waiting for a result")]
    Timeout(TaskId),

    #[error("batch must be non-empty")]
    EmptyBatch,
}

/// Errors internal to a transport, never seen directly by a `Streamer`
/// caller.
///
/// A background loop (collector, worker, broker receiver) logs these and
/// continues; a single bad message or a transient broker outage never kills
/// the loop.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("protocol error decoding transport message: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        TransportError::Unavailable(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        TransportError::Protocol(msg.into())
    }
}

/// A prediction function failure, scoped to a single batch item.
///
/// This is the resolution of the open question in the design notes: rather
/// than silently dropping responses for a batch whose predictor raised, the
/// worker publishes this value for every item in that batch so the caller's
/// `Future` still completes (with a result per request_id) instead of always
/// timing out.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PredictionFailure {
    #[error("prediction function failed: {0}")]
    Failed(String),
}

impl PredictionFailure {
    pub fn from_display(err: impl std::fmt::Display) -> Self {
        PredictionFailure::Failed(err.to_string())
    }
}
