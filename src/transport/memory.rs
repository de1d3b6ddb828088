//! Single-process transport backed by two unbounded FIFO queues.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{RequestItem, ResponseItem, Transport};
use crate::error::TransportError;
use crate::ids::ClientId;

/// In-memory transport: one request queue, one response queue, exactly one
/// client. `client_id` is accepted on every call (to satisfy the `Transport`
/// contract) but ignored — there is nowhere else a response could go.
pub struct InMemoryTransport<Req, Res> {
    request_tx: mpsc::UnboundedSender<RequestItem<Req>>,
    request_rx: Mutex<mpsc::UnboundedReceiver<RequestItem<Req>>>,
    response_tx: mpsc::UnboundedSender<ResponseItem<Res>>,
    response_rx: Mutex<mpsc::UnboundedReceiver<ResponseItem<Res>>>,
}

impl<Req, Res> InMemoryTransport<Req, Res> {
    pub fn new() -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        InMemoryTransport {
            request_tx,
            request_rx: Mutex::new(request_rx),
            response_tx,
            response_rx: Mutex::new(response_rx),
        }
    }
}

impl<Req, Res> Default for InMemoryTransport<Req, Res> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<Req, Res> Transport<Req, Res> for InMemoryTransport<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    async fn send_request(&self, item: RequestItem<Req>) -> Result<(), TransportError> {
        self.request_tx
            .send(item)
            .map_err(|_| TransportError::unavailable("in-memory request queue is closed"))
    }

    async fn recv_request(
        &self,
        timeout: Duration,
    ) -> Result<Option<RequestItem<Req>>, TransportError> {
        let mut rx = self.request_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => Err(TransportError::unavailable(
                "in-memory request queue is closed",
            )),
            Err(_) => Ok(None),
        }
    }

    async fn send_response(
        &self,
        _client_id: ClientId,
        item: ResponseItem<Res>,
    ) -> Result<(), TransportError> {
        self.response_tx
            .send(item)
            .map_err(|_| TransportError::unavailable("in-memory response queue is closed"))
    }

    async fn recv_response(
        &self,
        _client_id: ClientId,
        timeout: Duration,
    ) -> Result<Option<ResponseItem<Res>>, TransportError> {
        let mut rx = self.response_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => Err(TransportError::unavailable(
                "in-memory response queue is closed",
            )),
            Err(_) => Ok(None),
        }
    }
}
