//! Dynamic batching dispatcher for high-latency prediction functions.
//!
//! A prediction function that only gets efficient on a GPU with a large
//! batch, but is called with single items by many concurrent callers,
//! wastes almost all of its throughput. This crate sits between the two:
//! callers submit individual batches through a [`Streamer`], a [`Worker`]
//! assembles them into size-and-latency-bounded batches and invokes a
//! [`Predictor`] once per batch, and the per-caller [`FutureSlot`] restores
//! each caller's own result ordering once the batch completes.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use batch_streamer::{InMemoryTransport, PredictionFailure, Streamer, StreamerConfig, Worker, WorkerConfig};
//!
//! fn double(batch: Vec<i32>) -> Result<Vec<i32>, PredictionFailure> {
//!     Ok(batch.into_iter().map(|x| x * 2).collect())
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = Arc::new(InMemoryTransport::<i32, i32>::new());
//!     let predictor: Arc<fn(Vec<i32>) -> Result<Vec<i32>, PredictionFailure>> = Arc::new(double);
//!     let worker = Worker::new(predictor, transport.clone(), WorkerConfig::default());
//!     tokio::spawn(async move { worker.run().await });
//!
//!     let streamer = Streamer::new(transport, StreamerConfig::default());
//!     let results = streamer.predict(vec![1, 2, 3]).await.unwrap();
//!     assert_eq!(results.into_iter().map(|r| r.unwrap()).collect::<Vec<_>>(), vec![2, 4, 6]);
//! }
//! ```

mod error;
mod future;
mod ids;
mod predictor;
mod retry;
mod streamer;
mod transport;
mod worker;

pub use error::{PredictionFailure, StreamerError, TransportError};
pub use future::FutureSlot;
pub use ids::{ClientId, RequestId, TaskId};
pub use predictor::Predictor;
pub use retry::{JitterMode, RetryConfig};
pub use streamer::{Streamer, StreamerConfig};
pub use transport::memory::InMemoryTransport;
pub use transport::{RequestItem, ResponseItem, Transport};
pub use worker::{Worker, WorkerConfig};

#[cfg(feature = "broker")]
pub use transport::broker::BrokerTransport;
