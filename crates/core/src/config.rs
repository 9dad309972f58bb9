use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_opt(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable env override");
            None
        }
    }
}

// ── Top-level config ──────────────────────────────────────────

/// Run configuration, typically parsed from TOML and then overridden by
/// `GREENSCHED_*` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GreenConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub reward: RewardConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub profile: ProfileConfig,
}

impl GreenConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides, for runs without a config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `GREENSCHED_SECTION_KEY` overrides `section.key`.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_opt("GREENSCHED_ORACLE_URL") {
            self.oracle.url = v;
        }
        if let Some(v) = env_parse("GREENSCHED_ORACLE_TIMEOUT_MS") {
            self.oracle.timeout_ms = v;
        }
        if let Some(v) = env_parse("GREENSCHED_ORACLE_SEED") {
            self.oracle.seed = Some(v);
        }
        if let Some(v) = env_opt("GREENSCHED_PROFILE_COLUMN") {
            self.profile.column = v;
        }
        if let Some(v) = env_parse("GREENSCHED_PROFILE_INTERVAL_SECS") {
            self.profile.interval_secs = v;
        }
        if let Some(v) = env_parse("GREENSCHED_LEDGER_BALANCE_TOLERANCE") {
            self.ledger.balance_tolerance_joules = v;
        }
        if let Some(v) = env_parse("GREENSCHED_LEDGER_VALIDATION_INTERVAL") {
            self.ledger.validation_interval = v;
        }
        if let Some(v) = env_parse("GREENSCHED_NORMALIZER_MIN_SAMPLES") {
            self.normalizer.min_samples = v;
        }
        if let Some(v) = env_parse("GREENSCHED_REWARD_LOCAL_NORMALIZE") {
            self.reward.local.normalize = v;
        }
    }

    /// Reject values that would make the ledger or reward math meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.ledger;
        positive("ledger.update_threshold_secs", l.update_threshold_secs)?;
        positive("ledger.integration_step_secs", l.integration_step_secs)?;
        non_negative("ledger.balance_tolerance_joules", l.balance_tolerance_joules)?;
        non_negative("ledger.prediction_lookahead_secs", l.prediction_lookahead_secs)?;
        if l.validation_interval == 0 {
            return Err(ConfigError::invalid("ledger.validation_interval", "must be at least 1"));
        }

        let n = &self.normalizer;
        for (field, v) in [
            ("normalizer.surplus_scale", n.surplus_scale),
            ("normalizer.stock_scale", n.stock_scale),
            ("normalizer.mips_scale", n.mips_scale),
            ("normalizer.cpu_scale", n.cpu_scale),
            ("normalizer.memory_scale", n.memory_scale),
            ("normalizer.queue_scale", n.queue_scale),
            ("normalizer.time_period_secs", n.time_period_secs),
        ] {
            positive(field, v)?;
        }

        let g = &self.reward.global;
        positive("reward.global.time_scale_secs", g.time_scale_secs)?;
        if !(g.ema_alpha > 0.0 && g.ema_alpha <= 1.0) {
            return Err(ConfigError::invalid(
                "reward.global.ema_alpha",
                format!("must be in (0, 1], got {}", g.ema_alpha),
            ));
        }
        for (field, v) in [
            ("reward.global.w_system", g.w_system),
            ("reward.global.w_target", g.w_target),
            ("reward.global.w_time", g.w_time),
        ] {
            finite(field, v)?;
        }

        let lr = &self.reward.local;
        positive("reward.local.time_scale_secs", lr.time_scale_secs)?;
        positive("reward.local.energy_scale", lr.energy_scale)?;
        for (field, v) in [
            ("reward.local.a_wait", lr.a_wait),
            ("reward.local.a_exec", lr.a_exec),
            ("reward.local.a_energy", lr.a_energy),
            ("reward.local.a_green", lr.a_green),
        ] {
            finite(field, v)?;
        }

        if self.oracle.timeout_ms == 0 {
            return Err(ConfigError::invalid("oracle.timeout_ms", "must be positive"));
        }
        if self.oracle.url.is_empty() {
            return Err(ConfigError::invalid("oracle.url", "must not be empty"));
        }

        positive("profile.interval_secs", self.profile.interval_secs)?;
        positive("profile.unit_scale", self.profile.unit_scale)?;
        if self.profile.column.is_empty() {
            return Err(ConfigError::invalid("profile.column", "must not be empty"));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  ledger:      threshold={}s, tolerance={}J, validate_every={}, step={}s",
            self.ledger.update_threshold_secs,
            self.ledger.balance_tolerance_joules,
            self.ledger.validation_interval,
            self.ledger.integration_step_secs
        );
        tracing::info!("  normalizer:  min_samples={}", self.normalizer.min_samples);
        tracing::info!(
            "  reward:      global=({}, {}, {}) alpha={}, local=({}, {}, {}, {}) normalize={}",
            self.reward.global.w_system,
            self.reward.global.w_target,
            self.reward.global.w_time,
            self.reward.global.ema_alpha,
            self.reward.local.a_wait,
            self.reward.local.a_exec,
            self.reward.local.a_energy,
            self.reward.local.a_green,
            self.reward.local.normalize
        );
        tracing::info!(
            "  oracle:      url={}, timeout={}ms, seed={}",
            self.oracle.url,
            self.oracle.timeout_ms,
            self.oracle
                .seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "(entropy)".into())
        );
        tracing::info!(
            "  profile:     column={}, interval={}s, unit_scale={}",
            self.profile.column,
            self.profile.interval_secs,
            self.profile.unit_scale
        );
    }
}

fn finite(field: &'static str, v: f64) -> Result<(), ConfigError> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be finite, got {v}")))
    }
}

fn positive(field: &'static str, v: f64) -> Result<(), ConfigError> {
    if v.is_finite() && v > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be positive, got {v}")))
    }
}

fn non_negative(field: &'static str, v: f64) -> Result<(), ConfigError> {
    if v.is_finite() && v >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be non-negative, got {v}")))
    }
}

// ── Ledger ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Elapsed time at or below which accrue/consume are no-ops.
    #[serde(default = "default_update_threshold")]
    pub update_threshold_secs: f64,
    /// Allowed absolute balance residual.
    #[serde(default = "default_balance_tolerance")]
    pub balance_tolerance_joules: f64,
    /// Run the balance check every this many consume calls.
    #[serde(default = "default_validation_interval")]
    pub validation_interval: u64,
    /// Maximum trapezoid sub-step for interval integration.
    #[serde(default = "default_integration_step")]
    pub integration_step_secs: f64,
    /// Horizon used by generation forecasts.
    #[serde(default = "default_prediction_lookahead")]
    pub prediction_lookahead_secs: f64,
}

fn default_update_threshold() -> f64 { 0.01 }
fn default_balance_tolerance() -> f64 { 0.01 }
fn default_validation_interval() -> u64 { 100 }
fn default_integration_step() -> f64 { 60.0 }
fn default_prediction_lookahead() -> f64 { 3600.0 }

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            update_threshold_secs: default_update_threshold(),
            balance_tolerance_joules: default_balance_tolerance(),
            validation_interval: default_validation_interval(),
            integration_step_secs: default_integration_step(),
            prediction_lookahead_secs: default_prediction_lookahead(),
        }
    }
}

// ── State normalizer ──────────────────────────────────────────

/// Fallback scales used until a feature has `min_samples` observations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig {
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
    #[serde(default = "default_surplus_scale")]
    pub surplus_scale: f64,
    #[serde(default = "default_stock_scale")]
    pub stock_scale: f64,
    #[serde(default = "default_mips_scale")]
    pub mips_scale: f64,
    #[serde(default = "default_cpu_scale")]
    pub cpu_scale: f64,
    #[serde(default = "default_memory_scale")]
    pub memory_scale: f64,
    #[serde(default = "default_queue_scale")]
    pub queue_scale: f64,
    #[serde(default = "default_time_period")]
    pub time_period_secs: f64,
}

fn default_min_samples() -> u64 { 100 }
fn default_surplus_scale() -> f64 { 50_000.0 }
fn default_stock_scale() -> f64 { 100_000.0 }
fn default_mips_scale() -> f64 { 10_000.0 }
fn default_cpu_scale() -> f64 { 100_000.0 }
fn default_memory_scale() -> f64 { 8192.0 }
fn default_queue_scale() -> f64 { 50.0 }
fn default_time_period() -> f64 { 3600.0 }

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            surplus_scale: default_surplus_scale(),
            stock_scale: default_stock_scale(),
            mips_scale: default_mips_scale(),
            cpu_scale: default_cpu_scale(),
            memory_scale: default_memory_scale(),
            queue_scale: default_queue_scale(),
            time_period_secs: default_time_period(),
        }
    }
}

// ── Rewards ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewardConfig {
    #[serde(default)]
    pub global: GlobalRewardConfig,
    #[serde(default)]
    pub local: LocalRewardConfig,
}

/// Weights for the site-selection reward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRewardConfig {
    /// Weight of the system-wide green ratio.
    #[serde(default = "default_w_system")]
    pub w_system: f64,
    /// Weight of the target's improvement over its baseline.
    #[serde(default = "default_w_target")]
    pub w_target: f64,
    /// Weight of the completion-time penalty.
    #[serde(default = "default_w_time")]
    pub w_time: f64,
    #[serde(default = "default_reward_time_scale")]
    pub time_scale_secs: f64,
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
}

fn default_w_system() -> f64 { 0.6 }
fn default_w_target() -> f64 { 0.2 }
fn default_w_time() -> f64 { 0.2 }
fn default_reward_time_scale() -> f64 { 100.0 }
fn default_ema_alpha() -> f64 { 0.05 }

impl Default for GlobalRewardConfig {
    fn default() -> Self {
        Self {
            w_system: default_w_system(),
            w_target: default_w_target(),
            w_time: default_w_time(),
            time_scale_secs: default_reward_time_scale(),
            ema_alpha: default_ema_alpha(),
        }
    }
}

/// Weights for the host-selection reward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalRewardConfig {
    #[serde(default = "default_a_wait")]
    pub a_wait: f64,
    #[serde(default = "default_a_exec")]
    pub a_exec: f64,
    #[serde(default = "default_a_energy")]
    pub a_energy: f64,
    #[serde(default = "default_a_green")]
    pub a_green: f64,
    #[serde(default = "default_reward_time_scale")]
    pub time_scale_secs: f64,
    #[serde(default = "default_energy_scale")]
    pub energy_scale: f64,
    /// Standardize local rewards with a running normalizer before submission.
    #[serde(default)]
    pub normalize: bool,
}

fn default_a_wait() -> f64 { 0.4 }
fn default_a_exec() -> f64 { 0.4 }
fn default_a_energy() -> f64 { 0.2 }
fn default_a_green() -> f64 { 0.1 }
fn default_energy_scale() -> f64 { 1.0 }

impl Default for LocalRewardConfig {
    fn default() -> Self {
        Self {
            a_wait: default_a_wait(),
            a_exec: default_a_exec(),
            a_energy: default_a_energy(),
            a_green: default_a_green(),
            time_scale_secs: default_reward_time_scale(),
            energy_scale: default_energy_scale(),
            normalize: false,
        }
    }
}

// ── Oracle ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_url")]
    pub url: String,
    #[serde(default = "default_oracle_timeout")]
    pub timeout_ms: u64,
    /// Seed for the fallback policy. `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_oracle_url() -> String { "http://localhost:5000".into() }
fn default_oracle_timeout() -> u64 { 5000 }

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            url: default_oracle_url(),
            timeout_ms: default_oracle_timeout(),
            seed: None,
        }
    }
}

// ── Generation profile ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Header name of the power column (matched case-insensitively).
    #[serde(default = "default_profile_column")]
    pub column: String,
    /// Spacing between consecutive valid rows.
    #[serde(default = "default_profile_interval")]
    pub interval_secs: f64,
    /// Multiplier from file units to watts (kW by default).
    #[serde(default = "default_unit_scale")]
    pub unit_scale: f64,
    /// Samples above this many watts are kept but logged as suspicious.
    #[serde(default = "default_warn_above")]
    pub warn_above_watts: f64,
}

fn default_profile_column() -> String { "OT".into() }
fn default_profile_interval() -> f64 { 600.0 }
fn default_unit_scale() -> f64 { 1000.0 }
fn default_warn_above() -> f64 { 10_000_000.0 }

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            column: default_profile_column(),
            interval_secs: default_profile_interval(),
            unit_scale: default_unit_scale(),
            warn_above_watts: default_warn_above(),
        }
    }
}
