//! Group-relative advantage: each reward as a standardized deviation from its group's mean.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdvantageConfig {
    /// Divide by the sample standard deviation. When false the denominator is 1, keeping
    /// raw reward magnitudes instead of normalizing for group difficulty.
    pub scale_rewards: bool,
    /// Advantages are clipped to `±clip_bound`.
    pub clip_bound: f64,
}

impl Default for AdvantageConfig {
    fn default() -> Self {
        Self {
            scale_rewards: true,
            clip_bound: 4.0,
        }
    }
}

/// Mean and sample standard deviation of a reward group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub mean: f64,
    pub std: f64,
}

impl GroupStats {
    pub fn of(rewards: &[f64]) -> Self {
        if rewards.is_empty() {
            return Self::default();
        }
        let n = rewards.len() as f64;
        let mean = rewards.iter().sum::<f64>() / n;
        let std = if rewards.len() < 2 {
            0.0
        } else {
            let var = rewards.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
            var.sqrt()
        };
        Self { mean, std }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AdvantageCalculator {
    config: AdvantageConfig,
}

impl AdvantageCalculator {
    pub fn new(config: AdvantageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AdvantageConfig {
        &self.config
    }

    pub fn compute(&self, rewards: &[f64]) -> Vec<f64> {
        if rewards.len() < 2 {
            return vec![0.0; rewards.len()];
        }
        let stats = GroupStats::of(rewards);
        let denominator = if !self.config.scale_rewards || stats.std < f64::EPSILON {
            1.0
        } else {
            stats.std
        };
        let bound = self.config.clip_bound.abs();
        rewards
            .iter()
            .map(|r| ((r - stats.mean) / denominator).clamp(-bound, bound))
            .collect()
    }
}
