//! AdamW over flat sub-partitions
//!
//! Implements decoupled weight decay regularization (Loshchilov & Hutter,
//! 2019) as a [`SubPartitionOptimizer`]: the reference step service behind
//! the sharding engine. First and second moment estimates live per
//! `(group, partition)` and are lazily allocated on the first step that sees
//! a gradient for that sub-partition.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::optimizer::traits::{Fp32SubPartition, StateValue, SubPartitionOptimizer};

/// AdamW configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// Per-sub-partition moment estimates
struct PartitionMoments {
    exp_avg: Vec<f32>,
    exp_avg_sq: Vec<f32>,
}

/// AdamW optimizer with decoupled weight decay, updating flat f32
/// sub-partitions in place.
pub struct AdamW {
    config: AdamWConfig,
    state: HashMap<(usize, usize), PartitionMoments>,
    timestep: u64,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            state: HashMap::new(),
            timestep: 0,
        }
    }

    /// Set the learning rate.
    pub fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    /// Reference to the config.
    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Completed optimizer steps.
    pub fn timestep(&self) -> u64 {
        self.timestep
    }
}

impl SubPartitionOptimizer for AdamW {
    fn step(&mut self, groups: &mut [Vec<Fp32SubPartition>]) -> Result<()> {
        self.timestep += 1;
        let t = self.timestep;

        let beta1 = self.config.beta1 as f32;
        let beta2 = self.config.beta2 as f32;
        let eps = self.config.eps as f32;
        let wd = self.config.weight_decay as f32;
        let lr = self.config.lr as f32;

        // Corrected step size: lr * sqrt(1 - beta2^t) / (1 - beta1^t)
        let bc1 = 1.0 - self.config.beta1.powi(t as i32);
        let bc2 = 1.0 - self.config.beta2.powi(t as i32);
        let step_size = (self.config.lr * bc2.sqrt() / bc1) as f32;

        for (group_idx, group) in groups.iter_mut().enumerate() {
            for (partition_idx, partition) in group.iter_mut().enumerate() {
                let grad = match &partition.grad {
                    Some(g) => g,
                    None => continue,
                };
                if grad.len() != partition.values.len() {
                    return Err(Error::Training {
                        reason: format!(
                            "gradient length {} != sub-partition length {} \
                             (group {group_idx}, partition {partition_idx})",
                            grad.len(),
                            partition.values.len()
                        ),
                    });
                }

                let moments = self
                    .state
                    .entry((group_idx, partition_idx))
                    .or_insert_with(|| PartitionMoments {
                        exp_avg: vec![0.0; partition.values.len()],
                        exp_avg_sq: vec![0.0; partition.values.len()],
                    });

                for i in 0..partition.values.len() {
                    let g = grad[i];
                    let m = &mut moments.exp_avg[i];
                    let v = &mut moments.exp_avg_sq[i];
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;

                    let p = &mut partition.values[i];
                    // Decoupled weight decay, then the Adam update.
                    *p -= lr * wd * *p;
                    *p -= step_size * *m / (v.sqrt() + eps);
                }
            }
        }

        Ok(())
    }

    fn state(&self, group: usize, partition: usize) -> Vec<(String, StateValue)> {
        let mut entries = vec![("step".to_string(), StateValue::Scalar(self.timestep as f64))];
        if let Some(moments) = self.state.get(&(group, partition)) {
            entries.push((
                "exp_avg".to_string(),
                StateValue::Tensor(moments.exp_avg.clone()),
            ));
            entries.push((
                "exp_avg_sq".to_string(),
                StateValue::Tensor(moments.exp_avg_sq.clone()),
            ));
        }
        entries
    }

    fn load_state(
        &mut self,
        group: usize,
        partition: usize,
        entries: &[(String, StateValue)],
    ) -> Result<()> {
        for (key, value) in entries {
            match (key.as_str(), value) {
                ("step", StateValue::Scalar(t)) => self.timestep = *t as u64,
                ("exp_avg", StateValue::Tensor(m)) => {
                    self.state
                        .entry((group, partition))
                        .or_insert_with(|| PartitionMoments {
                            exp_avg: Vec::new(),
                            exp_avg_sq: Vec::new(),
                        })
                        .exp_avg = m.clone();
                }
                ("exp_avg_sq", StateValue::Tensor(v)) => {
                    self.state
                        .entry((group, partition))
                        .or_insert_with(|| PartitionMoments {
                            exp_avg: Vec::new(),
                            exp_avg_sq: Vec::new(),
                        })
                        .exp_avg_sq = v.clone();
                }
                _ => {
                    return Err(Error::Checkpoint {
                        reason: format!("unknown optimizer state entry '{key}'"),
                    })
                }
            }
        }
        Ok(())
    }
}
