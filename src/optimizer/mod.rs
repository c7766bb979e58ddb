pub mod adamw;
pub mod loss_scaler;
pub mod traits;

pub use adamw::{AdamW, AdamWConfig};
pub use loss_scaler::{DynamicScaleArgs, LossScaler, LossScalerState, NanInfChecker, OverflowChecker};
pub use traits::{Fp32SubPartition, StateValue, SubPartitionOptimizer};
