//! Loss scaling and gradient overflow detection.
//!
//! Reduced-precision gradients can underflow, so the loss is multiplied by a
//! scale factor before backward and the gradients are divided by it before
//! the optimizer step. The dynamic scaler halves the scale on overflow and
//! doubles it after a window of clean steps; the static scaler keeps one
//! fixed value.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Parameters of the dynamic scaling schedule.
#[derive(Debug, Clone, Copy)]
pub struct DynamicScaleArgs {
    /// Starting loss scale.
    pub init_scale: f64,
    /// Multiplier applied on growth, divisor applied on overflow.
    pub scale_factor: f64,
    /// Consecutive clean steps required before the scale grows.
    pub scale_window: u64,
    /// Lower bound the scale never drops below.
    pub min_scale: f64,
}

impl Default for DynamicScaleArgs {
    fn default() -> Self {
        Self {
            init_scale: (1u64 << 32) as f64,
            scale_factor: 2.0,
            scale_window: 1000,
            min_scale: 1.0,
        }
    }
}

/// Static or dynamic loss scaler.
#[derive(Debug, Clone)]
pub struct LossScaler {
    cur_scale: f64,
    dynamic: bool,
    scale_factor: f64,
    scale_window: u64,
    min_scale: f64,
    consecutive_ok: u64,
}

impl LossScaler {
    /// A fixed-scale scaler; `update_scale` only resets the clean-step count.
    pub fn static_scale(scale: f64) -> Result<Self> {
        if scale <= 0.0 {
            return Err(Error::Config {
                reason: format!("loss scale must be positive, got {scale}"),
            });
        }
        Ok(Self {
            cur_scale: scale,
            dynamic: false,
            scale_factor: 1.0,
            scale_window: u64::MAX,
            min_scale: scale,
            consecutive_ok: 0,
        })
    }

    /// A dynamic scaler following `args`.
    pub fn dynamic(args: DynamicScaleArgs) -> Result<Self> {
        if args.init_scale <= 0.0 {
            return Err(Error::Config {
                reason: format!("init_scale must be positive, got {}", args.init_scale),
            });
        }
        if args.scale_factor <= 1.0 {
            return Err(Error::Config {
                reason: format!("scale_factor must be > 1.0, got {}", args.scale_factor),
            });
        }
        if args.scale_window == 0 {
            return Err(Error::Config {
                reason: "scale_window must be > 0".to_string(),
            });
        }
        Ok(Self {
            cur_scale: args.init_scale,
            dynamic: true,
            scale_factor: args.scale_factor,
            scale_window: args.scale_window,
            min_scale: args.min_scale,
            consecutive_ok: 0,
        })
    }

    /// Current loss scale. Multiply the loss by this before backward.
    pub fn loss_scale(&self) -> f64 {
        self.cur_scale
    }

    /// Overwrite the current scale.
    pub fn set_loss_scale(&mut self, scale: f64) {
        self.cur_scale = scale;
    }

    /// True when the schedule adapts to overflows.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Advance the schedule after a step.
    ///
    /// On overflow the scale is divided by the scale factor (floored at the
    /// minimum); after `scale_window` consecutive clean steps it grows by the
    /// same factor.
    pub fn update_scale(&mut self, overflow: bool) {
        if !self.dynamic {
            self.consecutive_ok = if overflow { 0 } else { self.consecutive_ok + 1 };
            return;
        }
        if overflow {
            self.cur_scale = (self.cur_scale / self.scale_factor).max(self.min_scale);
            self.consecutive_ok = 0;
        } else {
            self.consecutive_ok += 1;
            if self.consecutive_ok >= self.scale_window {
                self.cur_scale *= self.scale_factor;
                self.consecutive_ok = 0;
            }
        }
    }

    /// Snapshot for checkpointing.
    pub fn state(&self) -> LossScalerState {
        LossScalerState {
            cur_scale: self.cur_scale,
            dynamic: self.dynamic,
            scale_factor: self.scale_factor,
            scale_window: self.scale_window,
            min_scale: self.min_scale,
            consecutive_ok: self.consecutive_ok,
        }
    }

    /// Restore from a checkpointed snapshot.
    pub fn load_state(&mut self, state: &LossScalerState) {
        self.cur_scale = state.cur_scale;
        self.dynamic = state.dynamic;
        self.scale_factor = state.scale_factor;
        self.scale_window = state.scale_window;
        self.min_scale = state.min_scale;
        self.consecutive_ok = state.consecutive_ok;
    }
}

/// Serialized loss-scaler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossScalerState {
    pub cur_scale: f64,
    pub dynamic: bool,
    pub scale_factor: f64,
    pub scale_window: u64,
    pub min_scale: f64,
    pub consecutive_ok: u64,
}

/// Gradient overflow detection over host-visible gradient values.
///
/// Cross-worker agreement on the overflow flag is the transport's concern;
/// implementations here only inspect local memory.
pub trait OverflowChecker: Send + Sync {
    /// True if `values` contains an overflowed (NaN or infinite) element.
    fn check_slice(&self, values: &[f32]) -> bool;
}

/// Default checker: any non-finite value counts as overflow.
#[derive(Debug, Default, Clone, Copy)]
pub struct NanInfChecker;

impl OverflowChecker for NanInfChecker {
    fn check_slice(&self, values: &[f32]) -> bool {
        values.iter().any(|v| !v.is_finite())
    }
}
