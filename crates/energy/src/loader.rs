//! Fixed-cadence CSV loader for generation profiles.
//!
//! The file's header names the power column; every valid data row becomes
//! one sample at `row_index × interval` seconds, converted to watts by the
//! configured unit scale.

use std::path::Path;

use greensched_core::config::ProfileConfig;
use greensched_core::{Counter, RunContext};
use tracing::{debug, info, warn};

use crate::error::ProfileError;
use crate::profile::GenerationProfile;

/// Read a profile from `path`.
pub fn load_csv(path: impl AsRef<Path>, config: &ProfileConfig) -> Result<GenerationProfile, ProfileError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let label = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("profile")
        .to_string();
    parse_csv(&label, path, &content, config)
}

/// Read a profile, substituting the zero profile on any failure.
///
/// Skipped rows are added to the run's diagnostic counters.
pub fn load_csv_or_zero(
    path: impl AsRef<Path>,
    config: &ProfileConfig,
    ctx: &RunContext,
) -> GenerationProfile {
    let path = path.as_ref();
    match load_csv(path, config) {
        Ok(profile) => {
            ctx.record_n(Counter::SkippedProfileRows, profile.skipped() as u64);
            let s = profile.summary();
            info!(
                path = %path.display(),
                samples = s.samples,
                skipped = s.skipped,
                peak_kw = s.peak_watts / 1000.0,
                mean_kw = s.mean_watts / 1000.0,
                hours = s.duration_secs / 3600.0,
                "Loaded generation profile"
            );
            profile
        }
        Err(e) => {
            if let ProfileError::NoValidSamples { skipped, .. } = &e {
                ctx.record_n(Counter::SkippedProfileRows, *skipped as u64);
            }
            warn!(path = %path.display(), error = %e, "Generation profile unavailable, using zero generation");
            GenerationProfile::zero(path.display().to_string())
        }
    }
}

/// Parse CSV `content` already read from `path`.
pub fn parse_csv(
    label: &str,
    path: &Path,
    content: &str,
    config: &ProfileConfig,
) -> Result<GenerationProfile, ProfileError> {
    let mut lines = content.lines();
    let header = lines
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| ProfileError::EmptyFile(path.to_path_buf()))?;

    let column = header
        .split(',')
        .position(|name| name.trim().trim_matches('"').eq_ignore_ascii_case(&config.column))
        .ok_or_else(|| ProfileError::MissingColumn {
            column: config.column.clone(),
            path: path.to_path_buf(),
        })?;

    let mut samples = Vec::new();
    let mut skipped = 0usize;
    let mut suspicious = 0usize;

    for (line_no, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let Some(raw) = line.split(',').nth(column) else {
            debug!(line = line_no + 2, "Row too short for power column");
            skipped += 1;
            continue;
        };
        let raw = raw.trim().trim_matches('"');
        let value: f64 = match raw.parse() {
            Ok(v) if f64::is_finite(v) => v,
            _ => {
                debug!(line = line_no + 2, value = raw, "Unparsable power value");
                skipped += 1;
                continue;
            }
        };

        let watts = value * config.unit_scale;
        if watts > config.warn_above_watts {
            suspicious += 1;
        }
        let time_secs = samples.len() as f64 * config.interval_secs;
        samples.push((time_secs, watts));
    }

    if suspicious > 0 {
        warn!(
            profile = label,
            count = suspicious,
            threshold_w = config.warn_above_watts,
            "Generation samples above plausibility threshold"
        );
    }

    GenerationProfile::load_with_skipped(label, samples, skipped)
}
