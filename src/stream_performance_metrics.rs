//! Throughput and error counters for bounded streams

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use futures_util::pin_mut;
use futures_util::stream::StreamExt;
use tokio::sync::Mutex;

use crate::FlowStream;

/// Metrics collected for a fallible stream
#[derive(Debug, Clone, Default)]
pub struct StreamMetrics {
    pub name: Option<String>,
    pub items_processed: u64,
    pub errors: u64,
    pub processing_time: Duration,
    pub start_time: Option<Instant>,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn record_item(&mut self) {
        self.items_processed += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Stops the clock. Called when the stream completes.
    pub fn finalize(&mut self) {
        if let Some(start) = self.start_time.take() {
            self.processing_time = start.elapsed();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.start_time.is_none()
    }

    pub fn throughput_items_per_sec(&self) -> f64 {
        if self.processing_time.as_secs_f64() > 0.0 {
            self.items_processed as f64 / self.processing_time.as_secs_f64()
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.items_processed + self.errors;
        if total > 0 {
            self.errors as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Counts `Ok` items and `Err`s flowing through `s`.
///
/// The metrics are finalized when `s` completes.
pub fn with_metrics<T, E>(
    s: FlowStream<Result<T, E>>,
    name: impl Into<String>,
) -> (FlowStream<Result<T, E>>, Arc<Mutex<StreamMetrics>>)
where
    T: Send + 'static,
    E: Send + 'static,
{
    let metrics = Arc::new(Mutex::new(StreamMetrics::new().with_name(name)));
    let metrics_clone = Arc::clone(&metrics);

    let monitored_stream = stream! {
        pin_mut!(s);
        while let Some(item) = s.next().await {
            {
                let mut m = metrics_clone.lock().await;
                match &item {
                    Ok(_) => m.record_item(),
                    Err(_) => m.record_error(),
                }
            }
            yield item;
        }

        metrics_clone.lock().await.finalize();
    }
    .boxed();

    (monitored_stream, metrics)
}
