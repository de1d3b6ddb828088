//! Client-facing façade: assigns ids, fans out a batch, and routes incoming
//! results back to the right caller.

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{PredictionFailure, StreamerError};
use crate::future::{FutureSlot, FutureTable};
use crate::ids::{ClientId, RequestId, TaskId};
use crate::transport::{RequestItem, Transport};

/// Tuning knobs for the collector and the abandoned-task reaper.
#[derive(Clone, Copy, Debug)]
pub struct StreamerConfig {
    /// Bound on each collector poll of the transport.
    pub collector_poll: Duration,
    /// Default timeout used by [`Streamer::predict`].
    pub default_timeout: Duration,
    /// How often the reaper sweeps the future table.
    pub reap_interval: Duration,
    /// An *abandoned* slot (no outstanding `Arc` held by a caller) older
    /// than this is dropped by the reaper — the aging-out ceiling that
    /// stands in for a weak reference back to the table. A slot a caller is
    /// still awaiting is never reaped regardless of this value, since the
    /// caller's own `Arc` keeps it alive.
    pub max_slot_age: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        StreamerConfig {
            collector_poll: Duration::from_secs(1),
            default_timeout: Duration::from_secs(10),
            reap_interval: Duration::from_secs(30),
            max_slot_age: Duration::from_secs(300),
        }
    }
}

impl StreamerConfig {
    /// Build a config from `BATCH_STREAMER_COLLECTOR_POLL_MS` /
    /// `BATCH_STREAMER_DEFAULT_TIMEOUT_MS` / `BATCH_STREAMER_REAP_INTERVAL_MS`
    /// / `BATCH_STREAMER_MAX_SLOT_AGE_MS`, falling back to [`Default`] for
    /// any variable that's unset or fails to parse.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        fn millis_var(key: &str, default: Duration) -> Duration {
            env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        }

        StreamerConfig {
            collector_poll: millis_var(
                "BATCH_STREAMER_COLLECTOR_POLL_MS",
                defaults.collector_poll,
            ),
            default_timeout: millis_var(
                "BATCH_STREAMER_DEFAULT_TIMEOUT_MS",
                defaults.default_timeout,
            ),
            reap_interval: millis_var("BATCH_STREAMER_REAP_INTERVAL_MS", defaults.reap_interval),
            max_slot_age: millis_var("BATCH_STREAMER_MAX_SLOT_AGE_MS", defaults.max_slot_age),
        }
    }
}

/// Signals the collector and reaper background tasks to stop. Dropping a
/// `Streamer` without calling [`Streamer::shutdown`] leaves them running as
/// daemon-style background activity, exactly as the spec's original
/// "set daemon=true and forget" behavior, just explicit rather than implicit.
#[derive(Clone, Default)]
struct Shutdown(Arc<Notify>);

impl Shutdown {
    fn signal(&self) {
        self.0.notify_waiters();
    }

    async fn wait(&self) {
        self.0.notified().await;
    }
}

/// Client-facing façade over a [`Transport`].
///
/// Each `Streamer` has its own randomly generated [`ClientId`], a monotonic
/// task-id counter, a [`FutureTable`], and two background tasks: a
/// collector routing incoming responses to the right `FutureSlot`, and a
/// reaper aging out abandoned ones.
pub struct Streamer<Req, Res, T: Transport<Req, Res>> {
    client_id: ClientId,
    transport: Arc<T>,
    next_task_id: AtomicU64,
    futures: Arc<FutureTable<Res>>,
    config: StreamerConfig,
    shutdown: Shutdown,
    // `fn() -> Req` rather than `Req` itself: Send/Sync shouldn't depend on
    // whether Req happens to be Sync, since no Req value is ever stored here.
    _marker: std::marker::PhantomData<fn() -> Req>,
}

impl<Req, Res, T> Streamer<Req, Res, T>
where
    Req: Send + 'static,
    Res: Send + 'static,
    T: Transport<Req, Res> + 'static,
{
    /// Build a `Streamer` over `transport`, generating a fresh `client_id`
    /// and spawning its collector and reaper.
    ///
    /// Two `Streamer`s in the same process never share a `client_id` — each
    /// call to `new` draws a fresh random one.
    pub fn new(transport: Arc<T>, config: StreamerConfig) -> Self {
        let client_id = ClientId::new();
        let futures = Arc::new(FutureTable::new());
        let shutdown = Shutdown::default();

        spawn_collector(
            client_id,
            transport.clone(),
            futures.clone(),
            config,
            shutdown.clone(),
        );
        spawn_reaper(futures.clone(), config, shutdown.clone());

        Streamer {
            client_id,
            transport,
            next_task_id: AtomicU64::new(0),
            futures,
            config,
            shutdown,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Stop this `Streamer`'s collector and reaper. In-flight futures are
    /// left as-is; callers already awaiting them will still time out or
    /// complete if responses keep arriving through some other means, but no
    /// further responses will be routed once the collector stops.
    pub fn shutdown(&self) {
        self.shutdown.signal();
    }

    /// Assign a task id, fan out `batch` to the transport, and return a
    /// handle the caller can await for the ordered results.
    ///
    /// Non-blocking beyond the transport's own send path. `batch` must be
    /// non-empty; an empty batch is rejected with `StreamerError::EmptyBatch`
    /// rather than silently returning an already-complete future.
    pub async fn submit(&self, batch: Vec<Req>) -> Result<Arc<FutureSlot<Res>>, StreamerError> {
        if batch.is_empty() {
            return Err(StreamerError::EmptyBatch);
        }

        let task_id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        let slot = self.futures.insert(task_id, batch.len());

        for (i, payload) in batch.into_iter().enumerate() {
            let item = RequestItem {
                client_id: self.client_id,
                task_id,
                request_id: RequestId(i),
                payload,
            };
            if let Err(err) = self.transport.send_request(item).await {
                warn!(error = %err, %task_id, "send_request failed during submit");
            }
        }

        Ok(slot)
    }

    /// Convenience: `submit` followed by `await_result` with the configured
    /// default timeout.
    ///
    /// Table cleanup doesn't depend on going through this method: the
    /// collector removes a task's entry the moment its last item arrives
    /// (see `spawn_collector`), so a caller using `submit` and
    /// `await_result` directly is cleaned up the same way. This redundant
    /// removal on success is just a harmless no-op in the common case.
    pub async fn predict(
        &self,
        batch: Vec<Req>,
    ) -> Result<Vec<Result<Res, PredictionFailure>>, StreamerError> {
        let slot = self.submit(batch).await?;
        let result = slot.await_result(self.config.default_timeout).await;
        if result.is_ok() {
            self.futures.remove(slot.task_id());
        }
        result
    }
}

fn spawn_collector<Req, Res, T>(
    client_id: ClientId,
    transport: Arc<T>,
    futures: Arc<FutureTable<Res>>,
    config: StreamerConfig,
    shutdown: Shutdown,
) where
    Req: Send + 'static,
    Res: Send + 'static,
    T: Transport<Req, Res> + 'static,
{
    tokio::spawn(async move {
        loop {
            let recv = transport.recv_response(client_id, config.collector_poll);
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    debug!(%client_id, "collector shutting down");
                    return;
                }
                outcome = recv => {
                    match outcome {
                        Ok(Some(item)) => {
                            match futures.get(item.task_id) {
                                Some(slot) => {
                                    // Remove from the table the instant this
                                    // append completes the slot, rather than
                                    // waiting on the consumer: a caller still
                                    // inside `await_result` holds its own
                                    // `Arc`, so this never pulls the slot out
                                    // from under it, and it means a bare
                                    // `submit()` + `await_result()` caller
                                    // (who never touches `predict`'s removal)
                                    // doesn't leak a table entry.
                                    if slot.append(item.request_id, item.result) {
                                        futures.remove(item.task_id);
                                    }
                                }
                                None => {
                                    debug!(
                                        task_id = %item.task_id,
                                        "collector dropping response for unknown/completed task"
                                    );
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(error = %err, "collector recv_response failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        }
    });
}

fn spawn_reaper<Res>(futures: Arc<FutureTable<Res>>, config: StreamerConfig, shutdown: Shutdown)
where
    Res: Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(config.reap_interval) => {
                    let removed = futures.reap(config.max_slot_age);
                    if removed > 0 {
                        debug!(removed, "reaper swept abandoned futures");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PredictionFailure;
    use crate::predictor::Predictor;
    use crate::transport::memory::InMemoryTransport;
    use crate::worker::{Worker, WorkerConfig};

    fn double(batch: Vec<i32>) -> Result<Vec<i32>, PredictionFailure> {
        Ok(batch.into_iter().map(|x| x * 2).collect())
    }

    fn test_config() -> StreamerConfig {
        StreamerConfig {
            collector_poll: Duration::from_millis(20),
            default_timeout: Duration::from_secs(2),
            reap_interval: Duration::from_millis(50),
            max_slot_age: Duration::from_secs(60),
        }
    }

    fn spawn_worker(transport: Arc<InMemoryTransport<i32, i32>>) {
        let predictor: Arc<fn(Vec<i32>) -> Result<Vec<i32>, PredictionFailure>> =
            Arc::new(double as fn(Vec<i32>) -> Result<Vec<i32>, PredictionFailure>);
        let worker = Worker::new(predictor, transport, WorkerConfig::new(4, Duration::from_millis(50)));
        tokio::spawn(async move { worker.run().await });
    }

    #[tokio::test]
    async fn single_task_three_items_doubled() {
        let transport: Arc<InMemoryTransport<i32, i32>> = Arc::new(InMemoryTransport::new());
        spawn_worker(transport.clone());
        let streamer = Streamer::new(transport, test_config());

        let results = streamer.predict(vec![1, 2, 3]).await.unwrap();
        let values: Vec<i32> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn concurrent_submitters_each_get_their_own_ordered_result() {
        let transport: Arc<InMemoryTransport<i32, i32>> = Arc::new(InMemoryTransport::new());
        spawn_worker(transport.clone());
        let streamer = Arc::new(Streamer::new(transport, test_config()));

        let a = {
            let streamer = streamer.clone();
            tokio::spawn(async move { streamer.predict(vec![10, 20]).await })
        };
        let b = {
            let streamer = streamer.clone();
            tokio::spawn(async move { streamer.predict(vec![30, 40]).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(
            a.into_iter().map(|r| r.unwrap()).collect::<Vec<_>>(),
            vec![20, 40]
        );
        assert_eq!(
            b.into_iter().map(|r| r.unwrap()).collect::<Vec<_>>(),
            vec![60, 80]
        );
    }

    #[tokio::test]
    async fn raw_submit_and_await_result_cleans_up_the_table_without_predict() {
        // The spec's documented primary entry point is `submit` +
        // `await_result`, not the `predict` convenience wrapper. Table
        // cleanup must not depend on going through `predict`.
        let transport: Arc<InMemoryTransport<i32, i32>> = Arc::new(InMemoryTransport::new());
        spawn_worker(transport.clone());
        let streamer = Streamer::new(transport, test_config());

        let slot = streamer.submit(vec![1, 2, 3]).await.unwrap();
        let task_id = slot.task_id();
        let _results = slot.await_result(Duration::from_secs(2)).await.unwrap();

        assert!(
            streamer.futures.get(task_id).is_none(),
            "completed task's entry must not linger in the table"
        );
    }

    #[tokio::test]
    async fn a_caller_awaiting_past_the_reap_age_is_not_spuriously_timed_out() {
        // A caller's `await_result(timeout)` with a timeout >= `max_slot_age`
        // is fully valid per the public API. The reaper must not evict the
        // slot out from under it just because it is old and still
        // incomplete — only an *abandoned* slot (no outstanding `Arc`) is
        // reapable.
        fn slow(batch: Vec<i32>) -> Result<Vec<i32>, PredictionFailure> {
            std::thread::sleep(Duration::from_millis(120));
            Ok(batch)
        }

        let transport: Arc<InMemoryTransport<i32, i32>> = Arc::new(InMemoryTransport::new());
        let predictor: Arc<fn(Vec<i32>) -> Result<Vec<i32>, PredictionFailure>> =
            Arc::new(slow as fn(Vec<i32>) -> Result<Vec<i32>, PredictionFailure>);
        let worker = Worker::new(
            predictor,
            transport.clone(),
            WorkerConfig::new(4, Duration::from_millis(20)),
        );
        tokio::spawn(async move { worker.run().await });

        // reap_interval/max_slot_age are shorter than the predictor's delay,
        // so the reaper sweeps at least once while the caller is still
        // legitimately waiting.
        let config = StreamerConfig {
            collector_poll: Duration::from_millis(20),
            default_timeout: Duration::from_secs(2),
            reap_interval: Duration::from_millis(10),
            max_slot_age: Duration::from_millis(10),
        };
        let streamer = Streamer::new(transport, config);

        let result = streamer
            .submit(vec![7])
            .await
            .unwrap()
            .await_result(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result[0].as_ref().unwrap(), &7);
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let transport: Arc<InMemoryTransport<i32, i32>> = Arc::new(InMemoryTransport::new());
        let streamer = Streamer::new(transport, test_config());
        let err = streamer.submit(vec![]).await.unwrap_err();
        assert!(matches!(err, StreamerError::EmptyBatch));
    }

    #[tokio::test]
    async fn timeout_does_not_affect_subsequent_submissions() {
        fn sleepy(batch: Vec<i32>) -> Result<Vec<i32>, PredictionFailure> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(batch)
        }

        let transport: Arc<InMemoryTransport<i32, i32>> = Arc::new(InMemoryTransport::new());
        let predictor: Arc<fn(Vec<i32>) -> Result<Vec<i32>, PredictionFailure>> =
            Arc::new(sleepy as fn(Vec<i32>) -> Result<Vec<i32>, PredictionFailure>);
        let worker = Worker::new(
            predictor,
            transport.clone(),
            WorkerConfig::new(4, Duration::from_millis(20)),
        );
        tokio::spawn(async move { worker.run().await });

        let streamer = Streamer::new(transport, test_config());

        let timed_out = streamer
            .submit(vec![1])
            .await
            .unwrap()
            .await_result(Duration::from_millis(20))
            .await;
        assert!(matches!(timed_out, Err(StreamerError::Timeout(_))));

        // The collector and future table are unaffected by the earlier
        // timeout: a later submission on the same streamer still completes
        // once the (still in-flight, slow) first batch drains.
        let ok = streamer
            .submit(vec![2])
            .await
            .unwrap()
            .await_result(Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(ok[0].as_ref().unwrap(), &2);
    }

    #[test]
    fn from_env_reads_overrides_and_falls_back_to_defaults() {
        // SAFETY: test-only, not run concurrently with anything else that
        // reads these variable names.
        unsafe {
            env::set_var("BATCH_STREAMER_DEFAULT_TIMEOUT_MS", "5000");
            env::remove_var("BATCH_STREAMER_REAP_INTERVAL_MS");
        }
        let config = StreamerConfig::from_env();
        assert_eq!(config.default_timeout, Duration::from_millis(5000));
        assert_eq!(config.reap_interval, StreamerConfig::default().reap_interval);
        unsafe {
            env::remove_var("BATCH_STREAMER_DEFAULT_TIMEOUT_MS");
        }
    }

    #[tokio::test]
    async fn distinct_task_ids_for_concurrent_submissions() {
        let transport: Arc<InMemoryTransport<i32, i32>> = Arc::new(InMemoryTransport::new());
        let streamer = Streamer::new(transport, test_config());
        let a = streamer.submit(vec![1]).await.unwrap();
        let b = streamer.submit(vec![2]).await.unwrap();
        assert_ne!(a.task_id(), b.task_id());
    }
}
