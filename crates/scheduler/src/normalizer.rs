//! Raw observation → bounded feature conversion.
//!
//! Every named feature keeps running statistics (Welford mean/variance plus
//! min/max). Until a feature has `min_samples` observations it is scaled by a
//! fixed default constant; afterwards the transform adapts to the observed
//! distribution. Outputs are always finite and inside the kind's bound.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

use greensched_core::config::NormalizerConfig;
use greensched_core::{Counter, RunContext};
use serde::Serialize;
use tracing::{debug, error};

/// Running statistics of one feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureStat {
    pub count: u64,
    pub mean: f64,
    m2: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for FeatureStat {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl FeatureStat {
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Sample variance; zero with fewer than two observations.
    pub fn variance(&self) -> f64 {
        if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        }
    }

    pub fn std(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// How a feature is transformed, and therefore its output bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FeatureKind {
    /// Signed, unbounded (energy surplus). Output in (-1, 1).
    Signed,
    /// Non-negative, unbounded (energy stock). Output in [-1, 1].
    NonNegative,
    /// Processing capacity (MIPS). Output in [0, 1].
    Capacity,
    /// Heavy-tailed demand (task length). Output in [0, 1].
    Demand,
    /// Memory requirement. Output in [0, 1].
    Memory,
    /// Queue length. Output in [0, 1].
    Queue,
    /// Already a ratio or utilization. Clipped to [0, 1].
    Ratio,
    /// Simulation time, sine-encoded over the configured period. Output in [-1, 1].
    Cyclical,
}

impl FeatureKind {
    pub fn bounds(self) -> (f64, f64) {
        match self {
            FeatureKind::Signed | FeatureKind::NonNegative | FeatureKind::Cyclical => (-1.0, 1.0),
            _ => (0.0, 1.0),
        }
    }
}

pub struct StateNormalizer {
    config: NormalizerConfig,
    stats: HashMap<String, FeatureStat>,
    ctx: Arc<RunContext>,
}

impl StateNormalizer {
    pub fn new(config: NormalizerConfig, ctx: Arc<RunContext>) -> Self {
        Self {
            config,
            stats: HashMap::new(),
            ctx,
        }
    }

    /// Record a raw observation. Non-finite values are ignored.
    pub fn observe(&mut self, feature: &str, value: f64) {
        if !value.is_finite() {
            debug!(feature, value, "Ignoring non-finite observation");
            return;
        }
        self.stats.entry(feature.to_string()).or_default().update(value);
    }

    pub fn stats(&self, feature: &str) -> Option<&FeatureStat> {
        self.stats.get(feature)
    }

    /// Observe then normalize.
    pub fn encode(&mut self, feature: &str, kind: FeatureKind, value: f64) -> f64 {
        if !matches!(kind, FeatureKind::Ratio | FeatureKind::Cyclical) {
            self.observe(feature, value);
        }
        self.normalize(feature, kind, value)
    }

    /// Normalize `value` using the statistics collected for `feature`.
    pub fn normalize(&self, feature: &str, kind: FeatureKind, value: f64) -> f64 {
        if !value.is_finite() {
            return self.replace_non_finite(feature, value);
        }
        let adaptive = self
            .stats
            .get(feature)
            .filter(|s| s.count >= self.config.min_samples);
        let c = &self.config;

        let out = match kind {
            FeatureKind::Signed => match adaptive {
                Some(s) if s.std() > 1e-6 => ((value - s.mean) / (s.std() + 1e-8) / 2.0).tanh(),
                _ => (value / c.surplus_scale).tanh(),
            },
            FeatureKind::NonNegative => match adaptive {
                Some(s) if s.max > s.min => (value - s.min) / (s.max - s.min + 1e-8) * 2.0 - 1.0,
                _ => 2.0 / (1.0 + (-value / c.stock_scale).exp()) - 1.0,
            },
            FeatureKind::Capacity => match adaptive {
                Some(s) if s.max > 0.0 => value / s.max,
                _ => value / c.mips_scale,
            },
            FeatureKind::Demand => match adaptive {
                Some(s) if s.mean + 2.0 * s.std() > 0.0 => value / (s.mean + 2.0 * s.std()),
                _ => value / c.cpu_scale,
            },
            FeatureKind::Memory => match adaptive {
                Some(s) if s.max > 0.0 => value / s.max,
                _ => value / c.memory_scale,
            },
            FeatureKind::Queue => match adaptive {
                Some(s) => 1.0 - (-value / (s.mean.max(0.0) + 1.0)).exp(),
                None => value / c.queue_scale,
            },
            FeatureKind::Ratio => value,
            FeatureKind::Cyclical => {
                let period = c.time_period_secs;
                (2.0 * PI * value.rem_euclid(period) / period).sin()
            }
        };

        if !out.is_finite() {
            return self.replace_non_finite(feature, out);
        }
        let (lo, hi) = kind.bounds();
        out.clamp(lo, hi)
    }

    fn replace_non_finite(&self, feature: &str, value: f64) -> f64 {
        self.ctx.record(Counter::NonFiniteReplacements);
        error!(feature, value, "Non-finite feature replaced with 0.0");
        0.0
    }

    /// Dump per-feature statistics at debug level.
    pub fn log_statistics(&self) {
        let mut names: Vec<_> = self.stats.keys().collect();
        names.sort();
        for name in names {
            let s = &self.stats[name];
            debug!(
                feature = %name,
                count = s.count,
                mean = s.mean,
                std = s.std(),
                min = s.min,
                max = s.max,
                "Feature statistics"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm() -> StateNormalizer {
        StateNormalizer::new(NormalizerConfig::default(), Arc::new(RunContext::new()))
    }

    const ALL_KINDS: [FeatureKind; 8] = [
        FeatureKind::Signed,
        FeatureKind::NonNegative,
        FeatureKind::Capacity,
        FeatureKind::Demand,
        FeatureKind::Memory,
        FeatureKind::Queue,
        FeatureKind::Ratio,
        FeatureKind::Cyclical,
    ];

    #[test]
    fn welford_matches_sample_variance() {
        let mut s = FeatureStat::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            s.update(v);
        }
        assert_eq!(s.count, 8);
        assert!((s.mean - 5.0).abs() < 1e-12);
        assert!((s.variance() - 32.0 / 7.0).abs() < 1e-12);
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 9.0);
    }

    #[test]
    fn single_observation_has_zero_variance() {
        let mut s = FeatureStat::default();
        s.update(3.0);
        assert_eq!(s.variance(), 0.0);
    }

    #[test]
    fn defaults_before_threshold() {
        let n = norm();
        assert!((n.normalize("x", FeatureKind::Signed, 50_000.0) - 1.0f64.tanh()).abs() < 1e-12);
        assert_eq!(n.normalize("x", FeatureKind::NonNegative, 0.0), 0.0);
        assert_eq!(n.normalize("x", FeatureKind::Capacity, 5_000.0), 0.5);
        assert_eq!(n.normalize("x", FeatureKind::Capacity, 50_000.0), 1.0);
        assert_eq!(n.normalize("x", FeatureKind::Demand, 25_000.0), 0.25);
        assert_eq!(n.normalize("x", FeatureKind::Memory, 4096.0), 0.5);
        assert_eq!(n.normalize("x", FeatureKind::Queue, 10.0), 0.2);
    }

    #[test]
    fn ratio_is_clipped() {
        let n = norm();
        assert_eq!(n.normalize("u", FeatureKind::Ratio, 1.7), 1.0);
        assert_eq!(n.normalize("u", FeatureKind::Ratio, -0.2), 0.0);
        assert_eq!(n.normalize("u", FeatureKind::Ratio, 0.35), 0.35);
    }

    #[test]
    fn cyclical_time_encoding() {
        let n = norm();
        assert!(n.normalize("t", FeatureKind::Cyclical, 0.0).abs() < 1e-12);
        assert!((n.normalize("t", FeatureKind::Cyclical, 900.0) - 1.0).abs() < 1e-12);
        assert!((n.normalize("t", FeatureKind::Cyclical, 3600.0 + 2700.0) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn adaptive_signed_uses_z_score() {
        let mut n = norm();
        for i in 0..200 {
            n.observe("s", (i % 10) as f64 * 100.0);
        }
        let s = *n.stats("s").unwrap();
        let v = s.mean + 2.0 * s.std();
        let out = n.normalize("s", FeatureKind::Signed, v);
        assert!((out - ((2.0 * s.std()) / (s.std() + 1e-8) / 2.0).tanh()).abs() < 1e-9);
    }

    #[test]
    fn adaptive_non_negative_uses_min_max() {
        let mut n = norm();
        for i in 0..=100 {
            n.observe("stock", i as f64 * 10.0);
        }
        assert!((n.normalize("stock", FeatureKind::NonNegative, 0.0) + 1.0).abs() < 1e-9);
        assert!(n.normalize("stock", FeatureKind::NonNegative, 500.0).abs() < 1e-9);
        assert_eq!(n.normalize("stock", FeatureKind::NonNegative, 1.0e9), 1.0);
    }

    #[test]
    fn constant_stock_falls_back_to_sigmoid() {
        let mut n = norm();
        for _ in 0..150 {
            n.observe("stock", 100_000.0);
        }
        let expected = 2.0 / (1.0 + (-1.0f64).exp()) - 1.0;
        assert!((n.normalize("stock", FeatureKind::NonNegative, 100_000.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn adaptive_queue_uses_mean() {
        let mut n = norm();
        for _ in 0..100 {
            n.observe("q", 4.0);
        }
        let out = n.normalize("q", FeatureKind::Queue, 5.0);
        assert!((out - (1.0 - (-1.0f64).exp())).abs() < 1e-12);
    }

    #[test]
    fn encode_observes_before_normalizing() {
        let mut n = norm();
        n.encode("m", FeatureKind::Memory, 512.0);
        n.encode("m", FeatureKind::Ratio, 0.5);
        assert_eq!(n.stats("m").unwrap().count, 1);
    }

    #[test]
    fn nan_input_yields_zero_and_is_counted() {
        let ctx = Arc::new(RunContext::new());
        let mut n = StateNormalizer::new(NormalizerConfig::default(), ctx.clone());
        for kind in ALL_KINDS {
            assert_eq!(n.encode("nan", kind, f64::NAN), 0.0);
        }
        assert_eq!(ctx.count(Counter::NonFiniteReplacements), ALL_KINDS.len() as u64);
        assert!(n.stats("nan").is_none());
    }

    #[test]
    fn outputs_stay_in_bounds_for_extreme_inputs() {
        let mut n = norm();
        let extremes = [-1.0e300, -1.0e6, -1.0, 0.0, 1.0e-300, 1.0, 1.0e6, 1.0e300];
        // Run once cold and once after the adaptive threshold.
        for round in 0..2 {
            if round == 1 {
                for i in 0..200 {
                    for kind in ALL_KINDS {
                        n.observe(&format!("{kind:?}"), (i as f64 - 50.0) * 37.0);
                    }
                }
            }
            for kind in ALL_KINDS {
                let (lo, hi) = kind.bounds();
                for v in extremes {
                    let out = n.normalize(&format!("{kind:?}"), kind, v);
                    assert!(out.is_finite(), "{kind:?} {v} -> {out}");
                    assert!(out >= lo && out <= hi, "{kind:?} {v} -> {out}");
                }
            }
        }
    }
}
