//! The transport seam between `Streamer`/`Worker` and the message-moving
//! layer, plus the two concrete variants: [`memory`] (in-process) and
//! [`broker`] (Redis-backed).

pub mod memory;

#[cfg(feature = "broker")]
pub mod broker;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{PredictionFailure, TransportError};
use crate::ids::{ClientId, RequestId, TaskId};

/// One request item moving from a client to the worker pool.
#[derive(Debug, Clone)]
pub struct RequestItem<Req> {
    pub client_id: ClientId,
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub payload: Req,
}

/// One response item moving from the worker back to the originating client.
#[derive(Debug, Clone)]
pub struct ResponseItem<Res> {
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub result: Result<Res, PredictionFailure>,
}

/// The message-moving layer between clients and the worker pool.
///
/// Implementations must preserve tuple contents end to end and must not
/// duplicate items. Request-side ordering is first-come-first-served across
/// all producers — the core restores per-task order via `request_id`, not
/// via transport ordering.
#[async_trait]
pub trait Transport<Req, Res>: Send + Sync
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// Enqueue one item for the worker pool. Non-blocking from the caller's
    /// perspective beyond the transport's own send path.
    async fn send_request(&self, item: RequestItem<Req>) -> Result<(), TransportError>;

    /// Pull one item for the worker, or `None` if `timeout` elapses first.
    async fn recv_request(
        &self,
        timeout: Duration,
    ) -> Result<Option<RequestItem<Req>>, TransportError>;

    /// Deliver one response to the client identified by `client_id`.
    async fn send_response(
        &self,
        client_id: ClientId,
        item: ResponseItem<Res>,
    ) -> Result<(), TransportError>;

    /// Pull one response addressed to `client_id`, or `None` on timeout.
    async fn recv_response(
        &self,
        client_id: ClientId,
        timeout: Duration,
    ) -> Result<Option<ResponseItem<Res>>, TransportError>;
}
