//! Redis-backed transport: a shared list for requests, one pub/sub channel
//! per client for responses.
//!
//! Requests are pushed with `LPUSH` onto the `request_queue` key and popped
//! with a blocking `BLPOP` by a background receiver task, which forwards
//! decoded items into a local bounded channel so `recv_request` never waits
//! on the network. Responses are published to `response_pb_<client_id>`;
//! each registered client runs its own subscriber task forwarding decoded
//! messages into its own local channel.
//!
//! Wire format: JSON (`serde_json`), matching the original's choice of a
//! self-describing textual encoding.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{RequestItem, ResponseItem, Transport};
use crate::error::{PredictionFailure, TransportError};
use crate::ids::{ClientId, RequestId, TaskId};
use crate::retry::RetryConfig;

const REQUEST_QUEUE_KEY: &str = "request_queue";
const RECEIVER_BLPOP_SECS: usize = 1;
const LOCAL_QUEUE_CAPACITY: usize = 1_024;

fn response_channel(client_id: ClientId) -> String {
    format!("response_pb_{}", client_id.as_canonical())
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WireRequest<Req> {
    client_id: ClientId,
    task_id: TaskId,
    request_id: RequestId,
    payload: Req,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WireResponse<Res> {
    task_id: TaskId,
    request_id: RequestId,
    result: Result<Res, PredictionFailure>,
}

/// Broker-backed transport, parameterized over the wire-compatible request
/// and response types.
pub struct BrokerTransport<Req, Res> {
    conn: redis::aio::MultiplexedConnection,
    client: redis::Client,
    retry: RetryConfig,
    local_requests_tx: mpsc::Sender<RequestItem<Req>>,
    local_requests_rx: Mutex<mpsc::Receiver<RequestItem<Req>>>,
    client_channels: Mutex<HashMap<ClientId, mpsc::Receiver<ResponseItem<Res>>>>,
}

impl<Req, Res> BrokerTransport<Req, Res>
where
    Req: Serialize + DeserializeOwned + Send + 'static,
    Res: Serialize + DeserializeOwned + Send + 'static,
{
    /// Connect to the broker at `url` and start the request receiver task.
    pub async fn connect(url: &str, retry: RetryConfig) -> Result<Self, TransportError> {
        let client = redis::Client::open(url)
            .map_err(|e| TransportError::unavailable(format!("invalid broker url: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::unavailable(format!("broker connect failed: {e}")))?;

        let (local_requests_tx, local_requests_rx) = mpsc::channel(LOCAL_QUEUE_CAPACITY);

        tokio::spawn(request_receiver_loop::<Req>(
            client.clone(),
            local_requests_tx.clone(),
            retry.clone(),
        ));

        Ok(BrokerTransport {
            conn,
            client,
            retry,
            local_requests_tx,
            local_requests_rx: Mutex::new(local_requests_rx),
            client_channels: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe to this client's response channel. Must be called once,
    /// before the client's first `submit`, so no response published before
    /// subscription completes is lost — the underlying channel is pub/sub,
    /// which is fire-and-forget (see the design notes on this limitation).
    pub async fn register_client(&self, client_id: ClientId) -> Result<(), TransportError> {
        let channel = response_channel(client_id);
        let pubsub_conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| TransportError::unavailable(format!("broker connect failed: {e}")))?;
        let mut pubsub = pubsub_conn.into_pubsub();
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| TransportError::unavailable(format!("subscribe failed: {e}")))?;

        let (tx, rx) = mpsc::channel(LOCAL_QUEUE_CAPACITY);
        self.client_channels.lock().await.insert(client_id, rx);

        tokio::spawn(response_subscriber_loop::<Res>(pubsub, tx, channel));
        Ok(())
    }
}

async fn request_receiver_loop<Req>(
    client: redis::Client,
    local_tx: mpsc::Sender<RequestItem<Req>>,
    retry: RetryConfig,
) where
    Req: DeserializeOwned + Send + 'static,
{
    let mut attempt = 0u32;
    let mut backoff = retry.initial_backoff;
    loop {
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "broker request receiver: connect failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = retry.next_backoff(attempt, backoff);
                attempt += 1;
                continue;
            }
        };
        attempt = 0;
        backoff = retry.initial_backoff;

        loop {
            let popped: Result<Option<(String, String)>, redis::RedisError> = conn
                .blpop(REQUEST_QUEUE_KEY, RECEIVER_BLPOP_SECS as f64)
                .await;
            match popped {
                Ok(Some((_key, raw))) => match serde_json::from_str::<WireRequest<Req>>(&raw) {
                    Ok(wire) => {
                        let item = RequestItem {
                            client_id: wire.client_id,
                            task_id: wire.task_id,
                            request_id: wire.request_id,
                            payload: wire.payload,
                        };
                        if local_tx.send(item).await.is_err() {
                            return; // transport dropped
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "broker request receiver: dropping malformed message");
                    }
                },
                Ok(None) => continue, // BLPOP timeout, no item
                Err(e) => {
                    warn!(error = %e, "broker request receiver: connection lost, reconnecting");
                    break;
                }
            }
        }
    }
}

async fn response_subscriber_loop<Res>(
    mut pubsub: redis::aio::PubSub,
    local_tx: mpsc::Sender<ResponseItem<Res>>,
    channel: String,
) where
    Res: DeserializeOwned + Send + 'static,
{
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let raw: String = match msg.get_payload() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, %channel, "broker response subscriber: bad payload");
                continue;
            }
        };
        match serde_json::from_str::<WireResponse<Res>>(&raw) {
            Ok(wire) => {
                let item = ResponseItem {
                    task_id: wire.task_id,
                    request_id: wire.request_id,
                    result: wire.result,
                };
                if local_tx.send(item).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, %channel, "broker response subscriber: dropping malformed message");
            }
        }
    }
    debug!(%channel, "broker response subscriber: channel closed");
}

#[async_trait]
impl<Req, Res> Transport<Req, Res> for BrokerTransport<Req, Res>
where
    Req: Serialize + DeserializeOwned + Send + Sync + 'static,
    Res: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn send_request(&self, item: RequestItem<Req>) -> Result<(), TransportError> {
        let wire = WireRequest {
            client_id: item.client_id,
            task_id: item.task_id,
            request_id: item.request_id,
            payload: item.payload,
        };
        let raw = serde_json::to_string(&wire)
            .map_err(|e| TransportError::protocol(format!("encode request: {e}")))?;

        let mut conn = self.conn.clone();
        let mut attempt = 0u32;
        let mut backoff = self.retry.initial_backoff;
        loop {
            let result: Result<(), redis::RedisError> = conn.lpush(REQUEST_QUEUE_KEY, &raw).await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if self.retry.should_retry(attempt) => {
                    warn!(error = %e, attempt, "broker send_request failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = self.retry.next_backoff(attempt, backoff);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(TransportError::unavailable(format!(
                        "send_request exhausted retries: {e}"
                    )))
                }
            }
        }
    }

    async fn recv_request(
        &self,
        timeout: Duration,
    ) -> Result<Option<RequestItem<Req>>, TransportError> {
        let mut rx = self.local_requests_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => Err(TransportError::unavailable("broker receiver task stopped")),
            Err(_) => Ok(None),
        }
    }

    async fn send_response(
        &self,
        client_id: ClientId,
        item: ResponseItem<Res>,
    ) -> Result<(), TransportError> {
        let wire = WireResponse {
            task_id: item.task_id,
            request_id: item.request_id,
            result: item.result,
        };
        let raw = serde_json::to_string(&wire)
            .map_err(|e| TransportError::protocol(format!("encode response: {e}")))?;

        let mut conn = self.conn.clone();
        let channel = response_channel(client_id);
        let mut attempt = 0u32;
        let mut backoff = self.retry.initial_backoff;
        loop {
            let result: Result<i64, redis::RedisError> = conn.publish(&channel, &raw).await;
            match result {
                Ok(_subscriber_count) => return Ok(()),
                Err(e) if self.retry.should_retry(attempt) => {
                    warn!(error = %e, attempt, %channel, "broker send_response failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = self.retry.next_backoff(attempt, backoff);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(TransportError::unavailable(format!(
                        "send_response exhausted retries: {e}"
                    )))
                }
            }
        }
    }

    async fn recv_response(
        &self,
        client_id: ClientId,
        timeout: Duration,
    ) -> Result<Option<ResponseItem<Res>>, TransportError> {
        let mut channels = self.client_channels.lock().await;
        let rx = channels.get_mut(&client_id).ok_or_else(|| {
            TransportError::protocol("recv_response called for an unregistered client_id")
        })?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => Err(TransportError::unavailable(
                "broker response subscriber stopped",
            )),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_request_round_trips_through_json() {
        let wire = WireRequest {
            client_id: ClientId::new(),
            task_id: TaskId(7),
            request_id: RequestId(2),
            payload: 42i32,
        };
        let raw = serde_json::to_string(&wire).unwrap();
        let back: WireRequest<i32> = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.client_id, wire.client_id);
        assert_eq!(back.task_id, wire.task_id);
        assert_eq!(back.request_id, wire.request_id);
        assert_eq!(back.payload, wire.payload);
    }

    #[test]
    fn wire_response_round_trips_ok_and_err_through_json() {
        let ok = WireResponse {
            task_id: TaskId(1),
            request_id: RequestId(0),
            result: Ok::<i32, PredictionFailure>(9),
        };
        let raw = serde_json::to_string(&ok).unwrap();
        let back: WireResponse<i32> = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.result.unwrap(), 9);

        let err = WireResponse {
            task_id: TaskId(1),
            request_id: RequestId(1),
            result: Err::<i32, PredictionFailure>(PredictionFailure::Failed("boom".into())),
        };
        let raw = serde_json::to_string(&err).unwrap();
        let back: WireResponse<i32> = serde_json::from_str(&raw).unwrap();
        assert!(matches!(back.result, Err(PredictionFailure::Failed(msg)) if msg == "boom"));
    }

    #[test]
    fn response_channel_name_uses_canonical_uuid() {
        let client_id = ClientId::new();
        let channel = response_channel(client_id);
        assert_eq!(channel, format!("response_pb_{}", client_id.as_canonical()));
    }
}
