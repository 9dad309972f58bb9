//! Rewards computed when a decision's task completes.

use std::collections::HashMap;
use std::sync::Arc;

use greensched_core::config::{GlobalRewardConfig, LocalRewardConfig};
use greensched_core::{Counter, RunContext, Tier};
use greensched_energy::Usage;
use tracing::{debug, error};

use crate::reward_scale::RewardNormalizer;
use crate::tracker::PendingDecision;

/// What a strategy sees at completion time.
#[derive(Debug, Clone, Copy)]
pub struct RewardInput<'a> {
    pub pending: &'a PendingDecision,
    pub completed_at: f64,
    pub wait_time: f64,
    pub exec_time: f64,
    /// System-wide usage at completion.
    pub system_now: Usage,
    /// Usage of the decision's target site at completion.
    pub target_now: Usage,
}

impl RewardInput<'_> {
    /// Seconds between decision and completion, never negative.
    pub fn duration(&self) -> f64 {
        non_negative(self.completed_at - self.pending.decided_at)
    }
}

pub trait RewardStrategy: Send {
    fn tier(&self) -> Tier;

    fn compute(&mut self, input: &RewardInput<'_>) -> f64;

    /// Forget any state carried between decisions.
    fn reset(&mut self);
}

fn non_negative(v: f64) -> f64 {
    if v.is_finite() { v.max(0.0) } else { 0.0 }
}

fn ratio_or_zero(delta: Usage) -> f64 {
    if delta.total_used > 0.0 {
        (delta.green_used / delta.total_used).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn sanitize(reward: f64, tier: Tier, ctx: &RunContext) -> f64 {
    if reward.is_finite() {
        reward
    } else {
        ctx.record(Counter::NonFiniteReplacements);
        error!(%tier, reward, "Non-finite reward replaced with 0.0");
        0.0
    }
}

// ── EMA baseline ────────────────────────────────────────────────────

/// Per-target exponential moving average of the green ratio.
#[derive(Debug, Clone)]
pub struct EmaBaseline {
    alpha: f64,
    values: HashMap<usize, f64>,
}

impl EmaBaseline {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            values: HashMap::new(),
        }
    }

    pub fn get(&self, target: usize) -> f64 {
        self.values.get(&target).copied().unwrap_or(0.0)
    }

    /// Fold `ratio` into the target's average. Returns `(old, new)`.
    pub fn update(&mut self, target: usize, ratio: f64) -> (f64, f64) {
        let old = self.get(target);
        let new = (1.0 - self.alpha) * old + self.alpha * ratio;
        self.values.insert(target, new);
        (old, new)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

// ── Global ──────────────────────────────────────────────────────────

/// Site-selection reward: system green ratio over the decision window, the
/// target's ratio against its running baseline, and a completion-time penalty.
pub struct GlobalReward {
    config: GlobalRewardConfig,
    baseline: EmaBaseline,
    ctx: Arc<RunContext>,
}

impl GlobalReward {
    pub fn new(config: GlobalRewardConfig, ctx: Arc<RunContext>) -> Self {
        Self {
            baseline: EmaBaseline::new(config.ema_alpha),
            config,
            ctx,
        }
    }

    pub fn baseline(&self) -> &EmaBaseline {
        &self.baseline
    }
}

impl RewardStrategy for GlobalReward {
    fn tier(&self) -> Tier {
        Tier::Global
    }

    fn compute(&mut self, input: &RewardInput<'_>) -> f64 {
        let c = &self.config;
        let time_penalty = (input.duration() / c.time_scale_secs).min(1.0);

        let ratio_sys = ratio_or_zero(input.system_now.delta_since(&input.pending.system_usage));
        let ratio_target = ratio_or_zero(input.target_now.delta_since(&input.pending.target_usage));
        let (baseline_old, baseline_new) = self.baseline.update(input.pending.action, ratio_target);

        let reward = c.w_system * ratio_sys + c.w_target * (ratio_target - baseline_old)
            - c.w_time * time_penalty;
        debug!(
            task = %input.pending.task.id,
            target = input.pending.action,
            ratio_sys,
            ratio_target,
            baseline_old,
            baseline_new,
            time_penalty,
            reward,
            "Global reward"
        );
        sanitize(reward, Tier::Global, &self.ctx)
    }

    fn reset(&mut self) {
        self.baseline.clear();
    }
}

// ── Local ───────────────────────────────────────────────────────────

/// Host-selection reward: penalties for waiting, execution time and energy
/// drawn at the site, with a bonus for the green share of that energy.
pub struct LocalReward {
    config: LocalRewardConfig,
    scale: Option<RewardNormalizer>,
    ctx: Arc<RunContext>,
}

impl LocalReward {
    pub fn new(config: LocalRewardConfig, ctx: Arc<RunContext>) -> Self {
        let scale = config.normalize.then(RewardNormalizer::new);
        Self { config, scale, ctx }
    }

    pub fn scale(&self) -> Option<&RewardNormalizer> {
        self.scale.as_ref()
    }
}

impl RewardStrategy for LocalReward {
    fn tier(&self) -> Tier {
        Tier::Local
    }

    fn compute(&mut self, input: &RewardInput<'_>) -> f64 {
        let c = &self.config;
        let energy_scale = c.energy_scale.max(1e-9);

        let wait_penalty = (non_negative(input.wait_time) / c.time_scale_secs).min(1.0);
        let exec_penalty = (non_negative(input.exec_time) / c.time_scale_secs).min(1.0);
        let delta = input.target_now.delta_since(&input.pending.target_usage);
        let energy_penalty = (non_negative(delta.total_used) / energy_scale).min(1.0);
        let green_bonus = (non_negative(delta.green_used) / energy_scale).min(1.0);

        let raw = -c.a_wait * wait_penalty - c.a_exec * exec_penalty - c.a_energy * energy_penalty
            + c.a_green * green_bonus;
        let raw = sanitize(raw, Tier::Local, &self.ctx);
        debug!(
            task = %input.pending.task.id,
            wait_penalty,
            exec_penalty,
            energy_penalty,
            green_bonus,
            reward = raw,
            "Local reward"
        );
        match self.scale.as_mut() {
            Some(scale) => scale.normalize(raw),
            None => raw,
        }
    }

    fn reset(&mut self) {
        if let Some(scale) = self.scale.as_mut() {
            scale.reset();
        }
    }
}
