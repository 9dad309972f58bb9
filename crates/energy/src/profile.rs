use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ProfileError;
use crate::source::{integrate, GenerationSource};

/// One recorded power reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationSample {
    pub time_secs: f64,
    pub power_watts: f64,
}

/// Time-ordered, immutable power series for one renewable source.
///
/// Timestamps are strictly increasing. Point queries interpolate linearly
/// between the surrounding samples and never extrapolate past either end.
#[derive(Debug, Clone)]
pub struct GenerationProfile {
    label: String,
    samples: Vec<GenerationSample>,
    skipped: usize,
    integration_step: f64,
}

/// Aggregate figures for startup logs and the `profile` command.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSummary {
    pub label: String,
    pub samples: usize,
    pub skipped: usize,
    pub duration_secs: f64,
    pub peak_watts: f64,
    pub mean_watts: f64,
    pub min_watts: f64,
    pub capacity_factor: f64,
    pub total_energy_joules: f64,
}

const DEFAULT_INTEGRATION_STEP: f64 = 60.0;

impl GenerationProfile {
    /// Build a profile from `(time, power)` pairs.
    ///
    /// Pairs with a non-finite field or a timestamp that does not advance past
    /// the previous accepted sample are skipped and counted. Negative power is
    /// clamped to zero. Fails only when nothing valid remains.
    pub fn load(
        label: impl Into<String>,
        samples: impl IntoIterator<Item = (f64, f64)>,
    ) -> Result<Self, ProfileError> {
        Self::load_with_skipped(label, samples, 0)
    }

    /// Like [`load`](Self::load), carrying a skip count from an earlier
    /// parsing stage.
    pub fn load_with_skipped(
        label: impl Into<String>,
        samples: impl IntoIterator<Item = (f64, f64)>,
        already_skipped: usize,
    ) -> Result<Self, ProfileError> {
        let label = label.into();
        let mut accepted: Vec<GenerationSample> = Vec::new();
        let mut skipped = already_skipped;

        for (time_secs, power_watts) in samples {
            if !time_secs.is_finite() || !power_watts.is_finite() {
                debug!(profile = %label, time_secs, power_watts, "Skipping non-finite sample");
                skipped += 1;
                continue;
            }
            if let Some(last) = accepted.last() {
                if time_secs <= last.time_secs {
                    debug!(
                        profile = %label,
                        time_secs,
                        previous = last.time_secs,
                        "Skipping out-of-order sample"
                    );
                    skipped += 1;
                    continue;
                }
            }
            accepted.push(GenerationSample {
                time_secs,
                power_watts: power_watts.max(0.0),
            });
        }

        if accepted.is_empty() {
            return Err(ProfileError::NoValidSamples { label, skipped });
        }
        if skipped > 0 {
            warn!(profile = %label, skipped, kept = accepted.len(), "Generation profile had malformed samples");
        }

        Ok(Self {
            label,
            samples: accepted,
            skipped,
            integration_step: DEFAULT_INTEGRATION_STEP,
        })
    }

    /// A profile that always reports zero generation.
    pub fn zero(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            samples: Vec::new(),
            skipped: 0,
            integration_step: DEFAULT_INTEGRATION_STEP,
        }
    }

    /// Load, falling back to [`zero`](Self::zero) when nothing valid remains.
    pub fn load_or_zero(
        label: impl Into<String>,
        samples: impl IntoIterator<Item = (f64, f64)>,
    ) -> Self {
        let label = label.into();
        match Self::load(label.clone(), samples) {
            Ok(p) => p,
            Err(e) => {
                warn!(profile = %label, error = %e, "Using zero-generation fallback");
                Self::zero(label)
            }
        }
    }

    /// Override the trapezoid sub-step (non-positive values are ignored).
    pub fn with_integration_step(mut self, step_secs: f64) -> Self {
        if step_secs.is_finite() && step_secs > 0.0 {
            self.integration_step = step_secs;
        } else {
            warn!(profile = %self.label, step_secs, "Ignoring invalid integration step");
        }
        self
    }

    pub fn samples(&self) -> &[GenerationSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Rows dropped while loading.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Time span covered by the samples.
    pub fn duration(&self) -> f64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => last.time_secs - first.time_secs,
            _ => 0.0,
        }
    }

    pub fn peak_power(&self) -> f64 {
        self.samples
            .iter()
            .map(|s| s.power_watts)
            .fold(0.0, f64::max)
    }

    pub fn min_power(&self) -> f64 {
        self.samples
            .iter()
            .map(|s| s.power_watts)
            .reduce(f64::min)
            .unwrap_or(0.0)
    }

    /// Arithmetic mean of the recorded samples.
    pub fn mean_power(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.power_watts).sum::<f64>() / self.samples.len() as f64
    }

    pub fn summary(&self) -> ProfileSummary {
        let (start, end) = match (self.samples.first(), self.samples.last()) {
            (Some(f), Some(l)) => (f.time_secs, l.time_secs),
            _ => (0.0, 0.0),
        };
        ProfileSummary {
            label: self.label.clone(),
            samples: self.samples.len(),
            skipped: self.skipped,
            duration_secs: self.duration(),
            peak_watts: self.peak_power(),
            mean_watts: self.mean_power(),
            min_watts: self.min_power(),
            capacity_factor: self.capacity_factor(),
            total_energy_joules: self.energy_over_interval(start, end),
        }
    }
}

impl GenerationSource for GenerationProfile {
    fn label(&self) -> &str {
        &self.label
    }

    fn power_at(&self, t: f64) -> f64 {
        if self.samples.is_empty() || !t.is_finite() {
            return 0.0;
        }
        // Number of samples at or before t.
        let upto = self.samples.partition_point(|s| s.time_secs <= t);
        let floor = upto.checked_sub(1).map(|i| &self.samples[i]);
        let ceiling = self.samples.get(upto);

        match (floor, ceiling) {
            (Some(f), _) if f.time_secs == t => f.power_watts,
            (Some(f), Some(c)) => {
                let span = c.time_secs - f.time_secs;
                let frac = (t - f.time_secs) / span;
                f.power_watts + (c.power_watts - f.power_watts) * frac
            }
            (Some(f), None) => f.power_watts,
            (None, Some(c)) => c.power_watts,
            (None, None) => 0.0,
        }
    }

    fn energy_over_interval(&self, t0: f64, t1: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        integrate(|t| self.power_at(t), t0, t1, self.integration_step)
    }

    fn capacity_factor(&self) -> f64 {
        let peak = self.peak_power();
        if peak <= 0.0 {
            return 0.0;
        }
        (self.mean_power() / peak).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_point() -> GenerationProfile {
        GenerationProfile::load("wind", vec![(0.0, 1000.0), (600.0, 2000.0)]).unwrap()
    }

    #[test]
    fn midpoint_interpolates_linearly() {
        let p = two_point();
        assert!((p.power_at(300.0) - 1500.0).abs() < 1e-9);
    }

    #[test]
    fn exact_sample_time_returns_sample() {
        let p = two_point();
        assert_eq!(p.power_at(0.0), 1000.0);
        assert_eq!(p.power_at(600.0), 2000.0);
    }

    #[test]
    fn no_extrapolation_past_either_end() {
        let p = two_point();
        assert_eq!(p.power_at(-50.0), 1000.0);
        assert_eq!(p.power_at(10_000.0), 2000.0);
    }

    #[test]
    fn empty_profile_reports_zero() {
        let p = GenerationProfile::zero("none");
        assert_eq!(p.power_at(10.0), 0.0);
        assert_eq!(p.energy_over_interval(0.0, 1000.0), 0.0);
        assert_eq!(p.capacity_factor(), 0.0);
    }

    #[test]
    fn constant_power_integrates_to_power_times_duration() {
        let p = GenerationProfile::load("flat", vec![(0.0, 750.0), (3600.0, 750.0)]).unwrap();
        let e = p.energy_over_interval(100.0, 3100.0);
        let expected = 750.0 * 3000.0;
        assert!(((e - expected) / expected).abs() < 1e-6);
    }

    #[test]
    fn interval_shorter_than_step() {
        let p = two_point();
        // 10 s window around t=300: power ~1500 W.
        let e = p.energy_over_interval(295.0, 305.0);
        assert!((e - 15_000.0).abs() < 1e-6);
    }

    #[test]
    fn reversed_interval_is_zero() {
        let p = two_point();
        assert_eq!(p.energy_over_interval(500.0, 100.0), 0.0);
        assert_eq!(p.energy_over_interval(100.0, 100.0), 0.0);
    }

    #[test]
    fn malformed_samples_are_skipped_and_counted() {
        let p = GenerationProfile::load(
            "mixed",
            vec![
                (0.0, 100.0),
                (f64::NAN, 5.0),
                (600.0, f64::INFINITY),
                (600.0, 200.0),
                (300.0, 50.0),
                (1200.0, 300.0),
            ],
        )
        .unwrap();
        assert_eq!(p.len(), 3);
        assert_eq!(p.skipped(), 3);
    }

    #[test]
    fn negative_power_is_clamped() {
        let p = GenerationProfile::load("neg", vec![(0.0, -40.0), (60.0, 60.0)]).unwrap();
        assert_eq!(p.samples()[0].power_watts, 0.0);
        assert_eq!(p.skipped(), 0);
    }

    #[test]
    fn all_invalid_fails_and_fallback_is_zero() {
        let err = GenerationProfile::load("bad", vec![(f64::NAN, 1.0)]).unwrap_err();
        assert!(matches!(err, ProfileError::NoValidSamples { skipped: 1, .. }));

        let p = GenerationProfile::load_or_zero("bad", vec![(f64::NAN, 1.0)]);
        assert!(p.is_empty());
        assert_eq!(p.power_at(0.0), 0.0);
    }

    #[test]
    fn summary_figures() {
        let p = GenerationProfile::load("s", vec![(0.0, 0.0), (600.0, 1000.0), (1200.0, 500.0)])
            .unwrap();
        let s = p.summary();
        assert_eq!(s.samples, 3);
        assert_eq!(s.peak_watts, 1000.0);
        assert_eq!(s.min_watts, 0.0);
        assert!((s.mean_watts - 500.0).abs() < 1e-9);
        assert!((s.capacity_factor - 0.5).abs() < 1e-9);
        assert!((s.duration_secs - 1200.0).abs() < 1e-9);
        // Piecewise linear: 300 kJ + 450 kJ.
        assert!((s.total_energy_joules - 750_000.0).abs() < 1e-6);
    }

    #[test]
    fn custom_integration_step_keeps_linear_exactness() {
        let p = two_point().with_integration_step(5.0);
        let e = p.energy_over_interval(0.0, 600.0);
        assert!((e - 900_000.0).abs() < 1e-6);
    }
}
