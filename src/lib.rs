pub mod error;
pub mod semaphore;
pub mod pool;

pub mod chunk;
pub mod par_map;
pub mod poll;
pub mod broadcast;

pub mod stream_configuration;
pub mod stream_performance_metrics;
pub mod bounded_stream_ext;

/// Boxed, `'static` stream produced by every combinator in this crate
pub type FlowStream<O> = futures_util::stream::BoxStream<'static, O>;

pub use bounded_stream_ext::{BoundedResultStreamExt, BoundedStreamExt};
pub use broadcast::{broadcast, try_broadcast};
pub use chunk::{chunk, chunk_n, chunk_within, Chunk};
pub use error::{ConfigError, PoolError, PoolResult, StreamError, StreamResult};
pub use par_map::{
    par_eval_map, par_eval_map_unordered, try_par_eval_map, try_par_eval_map_pooled, try_par_eval_map_unordered,
    try_par_eval_map_with, MapOrder,
};
pub use poll::{poll_adaptive, poll_adaptive_with_policy, AdaptiveScaling, IterationOutcome, ParallelismInfo, ScalingPolicy};
pub use pool::{Manager, ObjectPool, PoolStats, PooledObject};
pub use semaphore::{ConcurrencyInfo, Permit, PermitGuard, Semaphore};
