//! Batch assembly and prediction dispatch.

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::predictor::Predictor;
use crate::transport::{RequestItem, ResponseItem, Transport};

/// Worker configuration: the two knobs that bound one batch-assembly cycle.
#[derive(Clone, Copy, Debug)]
pub struct WorkerConfig {
    /// Maximum items collected before invoking the predictor.
    pub batch_size: usize,
    /// Upper bound on how long a cycle waits while assembling a batch.
    pub max_latency: Duration,
}

impl WorkerConfig {
    pub fn new(batch_size: usize, max_latency: Duration) -> Self {
        WorkerConfig {
            batch_size,
            max_latency,
        }
    }

    /// Build a config from `BATCH_STREAMER_BATCH_SIZE` /
    /// `BATCH_STREAMER_MAX_LATENCY_MS`, falling back to [`Default`] for any
    /// variable that's unset or fails to parse.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let batch_size = env::var("BATCH_STREAMER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.batch_size);
        let max_latency_ms = env::var("BATCH_STREAMER_MAX_LATENCY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.max_latency.as_millis() as u64);

        WorkerConfig {
            batch_size,
            max_latency: Duration::from_millis(max_latency_ms),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            batch_size: 32,
            max_latency: Duration::from_millis(100),
        }
    }
}

/// Pulls items from a transport, assembles size-and-latency bounded
/// batches, and invokes a [`Predictor`] exactly once per batch.
pub struct Worker<P: Predictor, T: Transport<P::Request, P::Response>> {
    predictor: Arc<P>,
    transport: Arc<T>,
    config: WorkerConfig,
}

impl<P, T> Worker<P, T>
where
    P: Predictor + 'static,
    P::Request: Send + 'static,
    P::Response: Send + 'static,
    T: Transport<P::Request, P::Response> + 'static,
{
    pub fn new(predictor: Arc<P>, transport: Arc<T>, config: WorkerConfig) -> Self {
        Worker {
            predictor,
            transport,
            config,
        }
    }

    /// Run batch-assembly cycles forever. Sleeps briefly after an empty
    /// cycle to avoid a busy spin; every other wait in the core is a
    /// blocking receive with a timeout, not a poll.
    pub async fn run(&self) {
        loop {
            let n = self.run_once().await;
            if n == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    /// One batch-assembly-and-dispatch cycle. Returns the number of items
    /// processed (0 if nothing arrived).
    pub async fn run_once(&self) -> usize {
        let batch = self.assemble_batch().await;
        if batch.is_empty() {
            return 0;
        }

        let batch_len = batch.len();
        let mut metas = Vec::with_capacity(batch_len);
        let mut payloads = Vec::with_capacity(batch_len);
        for item in batch {
            metas.push((item.client_id, item.task_id, item.request_id));
            payloads.push(item.payload);
        }

        let predictor = self.predictor.clone();
        let outcome =
            tokio::task::spawn_blocking(move || predictor.predict(payloads)).await;

        let results = match outcome {
            Ok(Ok(results)) if results.len() == batch_len => Some(results),
            Ok(Ok(results)) => {
                warn!(
                    expected = batch_len,
                    got = results.len(),
                    "predictor returned a mismatched result length, treating as failure"
                );
                None
            }
            Ok(Err(err)) => {
                warn!(error = %err, batch_len, "predictor failed for batch");
                None
            }
            Err(join_err) => {
                warn!(error = %join_err, batch_len, "predictor panicked");
                None
            }
        };

        match results {
            Some(results) => {
                for ((client_id, task_id, request_id), result) in
                    metas.into_iter().zip(results.into_iter())
                {
                    self.publish(client_id, task_id, request_id, Ok(result)).await;
                }
            }
            None => {
                let failure = crate::error::PredictionFailure::Failed(
                    "prediction function failed for this batch".to_string(),
                );
                for (client_id, task_id, request_id) in metas {
                    self.publish(client_id, task_id, request_id, Err(failure.clone()))
                        .await;
                }
            }
        }

        batch_len
    }

    async fn publish(
        &self,
        client_id: crate::ids::ClientId,
        task_id: crate::ids::TaskId,
        request_id: crate::ids::RequestId,
        result: Result<P::Response, crate::error::PredictionFailure>,
    ) {
        let response = ResponseItem {
            task_id,
            request_id,
            result,
        };
        if let Err(err) = self.transport.send_response(client_id, response).await {
            warn!(error = %err, "failed to publish batch result");
        }
    }

    async fn assemble_batch(&self) -> Vec<RequestItem<P::Request>> {
        let start = Instant::now();
        let mut batch = Vec::with_capacity(self.config.batch_size);

        while batch.len() < self.config.batch_size {
            let elapsed = start.elapsed();
            if elapsed >= self.config.max_latency {
                break;
            }
            let remaining = self.config.max_latency - elapsed;

            match self.transport.recv_request(remaining).await {
                Ok(Some(item)) => batch.push(item),
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "transport recv_request failed, ending this cycle");
                    break;
                }
            }
        }

        if !batch.is_empty() {
            debug!(batch_len = batch.len(), elapsed = ?start.elapsed(), "assembled batch");
        }
        batch
    }
}
