//! Configuration types for bounded stream operations
//!
//! Every config is plain data with `Default`, builder-style setters and a
//! `validate` method. Durations serialize as integer milliseconds so configs
//! can be loaded from JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

fn non_zero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { field })
    } else {
        Ok(())
    }
}

fn non_zero_duration(field: &'static str, value: Option<Duration>) -> Result<(), ConfigError> {
    match value {
        Some(d) if d.is_zero() => Err(ConfigError::ZeroDuration { field, value: d }),
        _ => Ok(()),
    }
}

/// Permit count and optional lease for a [`Semaphore`](crate::semaphore::Semaphore)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemaphoreConfig {
    pub permits: usize,
    /// Unreleased permits are reclaimed after this long
    #[serde(default, with = "millis")]
    pub lease: Option<Duration>,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            permits: num_cpus::get(),
            lease: None,
        }
    }
}

impl SemaphoreConfig {
    pub fn new(permits: usize) -> Self {
        Self {
            permits,
            lease: None,
        }
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("permits", self.permits)?;
        non_zero_duration("lease", self.lease)
    }
}

/// Capacity and eviction settings for an [`ObjectPool`](crate::pool::ObjectPool)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub size: usize,
    /// Instances older than this are closed and replaced on borrow
    #[serde(default, with = "millis")]
    pub max_age: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: num_cpus::get(),
            max_age: None,
        }
    }
}

impl PoolConfig {
    pub fn new(size: usize) -> Self {
        Self { size, max_age: None }
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("size", self.size)?;
        non_zero_duration("max_age", self.max_age)
    }
}

/// When the chunker flushes its accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPolicy {
    /// Flush exactly when `n` items have accumulated
    Count(usize),
    /// Flush at `max_items` or when `window` has elapsed since the chunk's first item
    TimeWindow { max_items: usize, window: Duration },
    /// Flush when `window` has elapsed since the chunk's first item
    Window(Duration),
}

impl ChunkPolicy {
    pub fn count(n: usize) -> Result<Self, ConfigError> {
        non_zero("max_items", n)?;
        Ok(ChunkPolicy::Count(n))
    }

    pub fn time_window(max_items: usize, window: Duration) -> Result<Self, ConfigError> {
        non_zero("max_items", max_items)?;
        non_zero_duration("window", Some(window))?;
        Ok(ChunkPolicy::TimeWindow { max_items, window })
    }

    pub fn window(window: Duration) -> Result<Self, ConfigError> {
        non_zero_duration("window", Some(window))?;
        Ok(ChunkPolicy::Window(window))
    }

    pub fn max_items(&self) -> Option<usize> {
        match *self {
            ChunkPolicy::Count(n) => Some(n),
            ChunkPolicy::TimeWindow { max_items, .. } => Some(max_items),
            ChunkPolicy::Window(_) => None,
        }
    }

    pub fn window_duration(&self) -> Option<Duration> {
        match *self {
            ChunkPolicy::Count(_) => None,
            ChunkPolicy::TimeWindow { window, .. } | ChunkPolicy::Window(window) => Some(window),
        }
    }
}

/// Serializable form of a [`ChunkPolicy`]; at least one bound is required
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkConfig {
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default, with = "millis")]
    pub window: Option<Duration>,
}

impl ChunkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_items(mut self, n: usize) -> Self {
        self.max_items = Some(n);
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    pub fn policy(&self) -> Result<ChunkPolicy, ConfigError> {
        match (self.max_items, self.window) {
            (Some(n), None) => ChunkPolicy::count(n),
            (Some(n), Some(d)) => ChunkPolicy::time_window(n, d),
            (None, Some(d)) => ChunkPolicy::window(d),
            (None, None) => Err(ConfigError::UnboundedChunk),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy().map(|_| ())
    }
}

/// Configuration for bounded parallel mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub concurrency: usize,
    /// Per-transform deadline; a transform that misses it fails with `Timeout`
    #[serde(default, with = "millis")]
    pub timeout: Option<Duration>,
    /// Run each transform on its own Tokio task instead of polling it inline
    #[serde(default)]
    pub spawn_tasks: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            timeout: None,
            spawn_tasks: false,
        }
    }
}

impl ParallelConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn spawn_tasks(mut self, spawn_tasks: bool) -> Self {
        self.spawn_tasks = spawn_tasks;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("concurrency", self.concurrency)?;
        non_zero_duration("timeout", self.timeout)
    }
}

/// How the poller grows its parallelism after a non-empty iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncreaseStrategy {
    ByOne,
    Exponential,
    JumpToMax,
}

/// How the poller shrinks its parallelism after an all-empty iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetStrategy {
    ToMinimum,
    Halve,
    DecreaseByOne,
}

/// Configuration for the adaptive poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    pub min_parallelism: usize,
    pub max_parallelism: usize,
    pub increase: IncreaseStrategy,
    pub reset: ResetStrategy,
    /// Terminate after the first iteration that yields no items
    pub stop_on_empty: bool,
    /// Pause between iterations
    #[serde(default, with = "millis")]
    pub interval: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_parallelism: 1,
            max_parallelism: num_cpus::get(),
            increase: IncreaseStrategy::ByOne,
            reset: ResetStrategy::ToMinimum,
            stop_on_empty: false,
            interval: None,
        }
    }
}

impl PollConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parallelism(mut self, min: usize, max: usize) -> Self {
        self.min_parallelism = min;
        self.max_parallelism = max;
        self
    }

    pub fn increase(mut self, increase: IncreaseStrategy) -> Self {
        self.increase = increase;
        self
    }

    pub fn reset(mut self, reset: ResetStrategy) -> Self {
        self.reset = reset;
        self
    }

    pub fn stop_on_empty(mut self, stop_on_empty: bool) -> Self {
        self.stop_on_empty = stop_on_empty;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("min_parallelism", self.min_parallelism)?;
        if self.min_parallelism > self.max_parallelism {
            return Err(ConfigError::ParallelismRange {
                min: self.min_parallelism,
                max: self.max_parallelism,
            });
        }
        Ok(())
    }
}

/// Per-branch buffering for [`broadcast`](crate::broadcast::broadcast)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchBuffer {
    /// Holds at most `n` undelivered items; a full branch stalls the upstream
    Bounded(usize),
    /// Never stalls the upstream
    Unbounded,
}

/// Branch layout for a broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    pub buffers: Vec<BranchBuffer>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self::uniform(2, BranchBuffer::Bounded(16))
    }
}

impl BroadcastConfig {
    /// `branches` branches sharing the same buffering
    pub fn uniform(branches: usize, buffer: BranchBuffer) -> Self {
        Self {
            buffers: vec![buffer; branches],
        }
    }

    /// Override the buffering of a single branch
    pub fn branch(mut self, index: usize, buffer: BranchBuffer) -> Self {
        if index < self.buffers.len() {
            self.buffers[index] = buffer;
        }
        self
    }

    pub fn branches(&self) -> usize {
        self.buffers.len()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("branches", self.buffers.len())?;
        for buffer in &self.buffers {
            if let BranchBuffer::Bounded(n) = buffer {
                non_zero("buffer", *n)?;
            }
        }
        Ok(())
    }
}
