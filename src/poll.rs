//! Adaptive production loop
//!
//! Repeatedly calls a producer `k` times in parallel and flattens what the
//! calls return. `k` ramps up while the producer keeps returning data and
//! backs off as soon as a whole iteration comes back empty, so paginated
//! sources are polled hard while busy and gently once drained.

use std::future::Future;
use std::sync::Arc;

use async_stream::stream;
use futures_util::pin_mut;
use futures_util::stream::{self, StreamExt};

use crate::error::StreamError;
use crate::par_map::try_par_eval_map;
use crate::stream_configuration::{IncreaseStrategy, PollConfig, ResetStrategy};
use crate::FlowStream;

/// Passed to every producer call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelismInfo {
    /// Number of concurrent calls in this iteration
    pub current: usize,
    pub max: usize,
    /// Position of this call within the iteration, `0..current`
    pub call_index: usize,
    pub iteration: u64,
}

/// What a whole iteration produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Every call returned an empty batch
    Empty,
    NonEmpty,
}

/// Decides the parallelism of the next iteration.
///
/// Returned values are clamped to `[min, max]` by the poller.
pub trait ScalingPolicy: Send + Sync + 'static {
    fn next_parallelism(&self, current: usize, min: usize, max: usize, outcome: IterationOutcome) -> usize;
}

impl<F> ScalingPolicy for F
where
    F: Fn(usize, usize, usize, IterationOutcome) -> usize + Send + Sync + 'static,
{
    fn next_parallelism(&self, current: usize, min: usize, max: usize, outcome: IterationOutcome) -> usize {
        self(current, min, max, outcome)
    }
}

impl IncreaseStrategy {
    pub fn apply(&self, current: usize, max: usize) -> usize {
        match self {
            IncreaseStrategy::ByOne => current.saturating_add(1),
            IncreaseStrategy::Exponential => current.max(1).saturating_mul(2),
            IncreaseStrategy::JumpToMax => max,
        }
    }
}

impl ResetStrategy {
    pub fn apply(&self, current: usize, min: usize) -> usize {
        match self {
            ResetStrategy::ToMinimum => min,
            ResetStrategy::Halve => current / 2,
            ResetStrategy::DecreaseByOne => current.saturating_sub(1),
        }
    }
}

/// The built-in policy: grow by an [`IncreaseStrategy`] after data, shrink
/// by a [`ResetStrategy`] after an empty iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveScaling {
    pub increase: IncreaseStrategy,
    pub reset: ResetStrategy,
}

impl AdaptiveScaling {
    pub fn new(increase: IncreaseStrategy, reset: ResetStrategy) -> Self {
        Self { increase, reset }
    }

    pub fn from_config(config: &PollConfig) -> Self {
        Self::new(config.increase, config.reset)
    }
}

impl ScalingPolicy for AdaptiveScaling {
    fn next_parallelism(&self, current: usize, min: usize, max: usize, outcome: IterationOutcome) -> usize {
        match outcome {
            IterationOutcome::NonEmpty => self.increase.apply(current, max),
            IterationOutcome::Empty => self.reset.apply(current, min),
        }
    }
}

/// Polls `producer` using the scaling strategies named in `config`.
///
/// # Examples
/// ```
/// use bounded_streams::error::StreamError;
/// use bounded_streams::poll::poll_adaptive;
/// use bounded_streams::stream_configuration::PollConfig;
/// use futures_util::stream::StreamExt;
///
/// # async fn example() {
/// let config = PollConfig::new().parallelism(1, 4).stop_on_empty(true);
/// let pages = poll_adaptive(config, |info| async move {
///     // three pages of two items, then nothing
///     let page = info.iteration * 4 + info.call_index as u64;
///     Ok::<_, StreamError>(if page < 3 { vec![page * 2, page * 2 + 1] } else { vec![] })
/// });
/// let items: Vec<_> = pages.collect().await;
/// assert!(items.iter().all(|r| r.is_ok()));
/// # }
/// ```
pub fn poll_adaptive<T, E, F, Fut>(config: PollConfig, producer: F) -> FlowStream<Result<T, E>>
where
    T: Send + 'static,
    E: From<StreamError> + Send + 'static,
    F: Fn(ParallelismInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, E>> + Send + 'static,
{
    let policy = AdaptiveScaling::from_config(&config);
    poll_adaptive_with_policy(config, policy, producer)
}

/// Like [`poll_adaptive`], with a caller-supplied [`ScalingPolicy`]. The
/// strategies named in `config` are ignored.
pub fn poll_adaptive_with_policy<T, E, F, Fut, P>(config: PollConfig, policy: P, producer: F) -> FlowStream<Result<T, E>>
where
    T: Send + 'static,
    E: From<StreamError> + Send + 'static,
    F: Fn(ParallelismInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, E>> + Send + 'static,
    P: ScalingPolicy,
{
    if let Err(e) = config.validate() {
        log::warn!("adaptive poller: {}; clamping parallelism bounds", e);
    }
    let min = config.min_parallelism.max(1);
    let max = config.max_parallelism.max(min);
    let producer = Arc::new(producer);

    stream! {
        let mut current = min;
        let mut iteration: u64 = 0;

        'poll: loop {
            let k = current;
            let calls = stream::iter(0..k).boxed();
            let call_producer = Arc::clone(&producer);
            let batches = try_par_eval_map(calls, k, move |call_index| {
                call_producer(ParallelismInfo {
                    current: k,
                    max,
                    call_index,
                    iteration,
                })
            });
            pin_mut!(batches);

            let mut produced = 0usize;
            while let Some(batch) = batches.next().await {
                match batch {
                    Ok(items) => {
                        produced += items.len();
                        for item in items {
                            yield Ok(item);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        break 'poll;
                    }
                }
            }

            let outcome = if produced == 0 {
                IterationOutcome::Empty
            } else {
                IterationOutcome::NonEmpty
            };
            if outcome == IterationOutcome::Empty && config.stop_on_empty {
                log::debug!("adaptive poller: iteration {} empty, stopping", iteration);
                break;
            }

            current = policy.next_parallelism(k, min, max, outcome).clamp(min, max);
            if current != k {
                log::debug!("adaptive poller: parallelism {} -> {} after {:?} iteration", k, current, outcome);
            }
            iteration += 1;

            if let Some(interval) = config.interval {
                tokio::time::sleep(interval).await;
            }
        }
    }
    .boxed()
}
