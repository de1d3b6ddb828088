//! Runnable end-to-end demo: an in-memory transport, a toy predictor, one
//! worker, and a handful of concurrent callers.

use std::sync::Arc;
use std::time::Duration;

use batch_streamer::{
    InMemoryTransport, PredictionFailure, Streamer, StreamerConfig, Worker, WorkerConfig,
};

fn square(batch: Vec<u64>) -> Result<Vec<u64>, PredictionFailure> {
    tracing::info!(batch_len = batch.len(), "predicting batch");
    Ok(batch.into_iter().map(|x| x * x).collect())
}

#[tokio::main]
async fn main() {
    let transport = Arc::new(InMemoryTransport::<u64, u64>::new());

    let predictor: Arc<fn(Vec<u64>) -> Result<Vec<u64>, PredictionFailure>> = Arc::new(square);
    let worker = Worker::new(
        predictor,
        transport.clone(),
        WorkerConfig::new(8, Duration::from_millis(20)),
    );
    tokio::spawn(async move { worker.run().await });

    let streamer = Arc::new(Streamer::new(transport, StreamerConfig::default()));

    let mut callers = Vec::new();
    for i in 0..5u64 {
        let streamer = streamer.clone();
        callers.push(tokio::spawn(async move {
            let results = streamer.predict(vec![i, i + 1]).await.unwrap();
            let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
            println!("caller {i}: {values:?}");
        }));
    }

    for caller in callers {
        caller.await.unwrap();
    }

    streamer.shutdown();
}
