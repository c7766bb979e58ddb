//! # shardr
//!
//! **Sharded optimizer state for data-parallel training.**
//!
//! shardr splits the flattened parameter space of each parameter group into
//! equal-size sub-partitions, assigns them round-robin to the workers of a
//! data-parallel process group, and keeps full-precision master weights and
//! optimizer state only for the sub-partitions each worker owns. Gradients
//! are exchanged with one reduce-scatter per communication interval and
//! updated weights with one all-gather, so every worker still observes the
//! globally updated model after each step while holding `1/world_size` of
//! the optimizer memory.
//!
//! ## Design
//!
//! - **Partitioning is computed once**: flatten → slice → map at setup; the
//!   buffer contents mutate every step, the partitioning never does.
//! - **Seams, not backends**: the numeric update sits behind
//!   [`SubPartitionOptimizer`], collectives behind [`Communicator`]. The
//!   engine is transport- and optimizer-agnostic host code.
//! - **Elastic checkpoints**: per-worker state saved under N workers can be
//!   merged and re-sliced for M workers at load time.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use shardr::{
//!     AdamW, AdamWConfig, Buffer, DType, NoOpCommunicator, ShardedOptimizer,
//!     ShardedOptimizerConfig,
//! };
//!
//! let params = vec![vec![
//!     Buffer::from_f32(&[1.0, 2.0, 3.0, 4.0], DType::F16),
//!     Buffer::from_f32(&[5.0, 6.0, 7.0, 8.0, 9.0], DType::F16),
//! ]];
//! let mut engine = ShardedOptimizer::new(
//!     AdamW::new(AdamWConfig::default()),
//!     params,
//!     Arc::new(NoOpCommunicator),
//!     ShardedOptimizerConfig::default(),
//! )?;
//!
//! engine.set_gradient(0, 0, &[0.1; 4])?;
//! engine.set_gradient(0, 1, &[0.1; 5])?;
//! engine.reduce_scatter_gradients()?;
//! let skipped = engine.step()?;
//! assert!(!skipped);
//! # Ok::<(), shardr::Error>(())
//! ```

pub mod buffer;
pub mod comm;
pub mod distributed;
pub mod error;
pub mod optimizer;

pub use buffer::{Buffer, DType};
pub use comm::{CommError, CommResult, Communicator, NoOpCommunicator};
pub use distributed::{
    CheckpointState, ShardedOptimizer, ShardedOptimizerConfig, SubPartitionIndex,
};
pub use error::{Error, Result};
pub use optimizer::{
    AdamW, AdamWConfig, DynamicScaleArgs, Fp32SubPartition, LossScaler, NanInfChecker,
    OverflowChecker, StateValue, SubPartitionOptimizer,
};
