use std::collections::VecDeque;

use serde::Serialize;
use tracing::info;

const WARMUP_SAMPLES: usize = 1000;
const WARMUP_SCALE: f64 = 0.01;
const LEARNING_RATE: f64 = 0.001;
const MIN_INITIAL_VARIANCE: f64 = 0.1;
const RECENT_WINDOW: usize = 1000;
const EPSILON: f64 = 1e-8;

/// Running standardization of raw rewards.
///
/// The first `WARMUP_SAMPLES` rewards are only scaled down; their mean and
/// variance then seed an exponential moving estimate, and later rewards are
/// returned as `2·tanh(z/2)`, i.e. within (-2, 2).
#[derive(Debug, Clone)]
pub struct RewardNormalizer {
    mean: f64,
    var: f64,
    count: usize,
    warmup: Vec<f64>,
    recent: VecDeque<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RewardScaleStats {
    pub count: usize,
    pub running_mean: f64,
    pub running_std: f64,
    pub recent_mean: f64,
    pub recent_min: f64,
    pub recent_max: f64,
}

impl Default for RewardNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RewardNormalizer {
    pub fn new() -> Self {
        Self {
            mean: 0.0,
            var: 1.0,
            count: 0,
            warmup: Vec::with_capacity(WARMUP_SAMPLES),
            recent: VecDeque::with_capacity(RECENT_WINDOW),
        }
    }

    pub fn normalize(&mut self, reward: f64) -> f64 {
        if self.count < WARMUP_SAMPLES {
            self.warmup.push(reward);
            self.count += 1;
            return reward * WARMUP_SCALE;
        }
        if self.count == WARMUP_SAMPLES {
            self.initialize();
        }

        if self.recent.len() == RECENT_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(reward);
        self.count += 1;

        let delta = reward - self.mean;
        self.mean += LEARNING_RATE * delta;
        self.var = (1.0 - LEARNING_RATE) * self.var + LEARNING_RATE * delta * delta;

        let z = (reward - self.mean) / (self.var + EPSILON).sqrt();
        (z / 2.0).tanh() * 2.0
    }

    fn initialize(&mut self) {
        if self.warmup.is_empty() {
            return;
        }
        let n = self.warmup.len() as f64;
        self.mean = self.warmup.iter().sum::<f64>() / n;
        let var = self.warmup.iter().map(|r| (r - self.mean).powi(2)).sum::<f64>() / n;
        self.var = var.max(MIN_INITIAL_VARIANCE);
        info!(mean = self.mean, std = self.var.sqrt(), "Reward normalizer initialized");
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std(&self) -> f64 {
        self.var.sqrt()
    }

    pub fn is_warming_up(&self) -> bool {
        self.count < WARMUP_SAMPLES
    }

    pub fn stats(&self) -> Option<RewardScaleStats> {
        if self.recent.is_empty() {
            return None;
        }
        let n = self.recent.len() as f64;
        Some(RewardScaleStats {
            count: self.count,
            running_mean: self.mean,
            running_std: self.std(),
            recent_mean: self.recent.iter().sum::<f64>() / n,
            recent_min: self.recent.iter().copied().fold(f64::INFINITY, f64::min),
            recent_max: self.recent.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_scales_down() {
        let mut n = RewardNormalizer::new();
        assert!((n.normalize(5.0) - 0.05).abs() < 1e-12);
        assert!(n.is_warming_up());
        assert!(n.stats().is_none());
    }

    #[test]
    fn initializes_from_warmup_statistics() {
        let mut n = RewardNormalizer::new();
        for i in 0..WARMUP_SAMPLES {
            n.normalize(if i % 2 == 0 { 1.0 } else { 3.0 });
        }
        assert!(!n.is_warming_up());
        let out = n.normalize(2.0);
        // Seeded mean 2, variance 1; one EMA step barely moves either.
        assert!((n.mean() - 2.0).abs() < 1e-9);
        assert!(out.abs() < 1e-6);
    }

    #[test]
    fn variance_floor_applies_to_constant_warmup() {
        let mut n = RewardNormalizer::new();
        for _ in 0..WARMUP_SAMPLES {
            n.normalize(0.5);
        }
        n.normalize(0.5);
        assert!(n.std() >= (MIN_INITIAL_VARIANCE * (1.0 - LEARNING_RATE)).sqrt() - 1e-12);
    }

    #[test]
    fn output_bounded_after_warmup() {
        let mut n = RewardNormalizer::new();
        for i in 0..3000 {
            let r = ((i * 7919) % 200) as f64 - 100.0;
            let out = n.normalize(r);
            assert!(out.abs() < 2.0 + 1e-12 || i < WARMUP_SAMPLES);
        }
        let s = n.stats().unwrap();
        assert_eq!(s.count, 3000);
        assert!(s.recent_min >= -100.0 && s.recent_max < 100.0);
    }

    #[test]
    fn reset_returns_to_warmup() {
        let mut n = RewardNormalizer::new();
        for _ in 0..(WARMUP_SAMPLES + 5) {
            n.normalize(1.0);
        }
        n.reset();
        assert!(n.is_warming_up());
        assert_eq!(n.mean(), 0.0);
        assert_eq!(n.std(), 1.0);
    }
}
