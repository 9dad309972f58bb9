//! State vectors for the two decision tiers.

use greensched_core::{Counter, RunContext, SiteId, Tier};
use greensched_energy::site::system_usage;
use greensched_energy::Site;
use tracing::{error, warn};

use crate::engine::{HostObservation, SiteObservation, TaskObservation};
use crate::normalizer::{FeatureKind, StateNormalizer};

/// Everything a feature set may read at one scheduling point.
#[derive(Debug, Clone, Copy)]
pub struct FeatureInput<'a> {
    pub now: f64,
    pub sites: &'a [Site],
    /// Observations indexed like `sites`. Missing entries read as empty.
    pub site_obs: &'a [SiteObservation],
    /// Site being scheduled into. Set for local decisions only.
    pub target: Option<SiteId>,
    /// Hosts of `target`.
    pub hosts: &'a [HostObservation],
    pub task: &'a TaskObservation,
}

impl FeatureInput<'_> {
    fn site_obs(&self, index: usize) -> SiteObservation {
        self.site_obs.get(index).copied().unwrap_or_default()
    }

    fn target_site(&self) -> Option<&Site> {
        let id = self.target?;
        self.sites.iter().find(|s| s.id() == id)
    }
}

/// Builds the state vector for one tier.
pub trait FeatureSet: Send {
    fn name(&self) -> &'static str;

    fn dimension(&self, site_count: usize, host_count: usize) -> usize;

    fn build(&self, input: &FeatureInput<'_>, normalizer: &mut StateNormalizer) -> Vec<f64>;

    /// Largest magnitude a well-formed entry can take.
    fn max_abs(&self) -> f64 {
        1.0
    }
}

// ── Global ──────────────────────────────────────────────────────────

/// Site-selection state: per site `[surplus, stock, mips, utilization,
/// queue]`, then task length and memory, time of day and the system green
/// ratio.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalFeatures;

const PER_SITE: usize = 5;
const GLOBAL_TAIL: usize = 4;

impl FeatureSet for GlobalFeatures {
    fn name(&self) -> &'static str {
        "global"
    }

    fn dimension(&self, site_count: usize, _host_count: usize) -> usize {
        PER_SITE * site_count + GLOBAL_TAIL
    }

    fn build(&self, input: &FeatureInput<'_>, n: &mut StateNormalizer) -> Vec<f64> {
        let mut state = Vec::with_capacity(self.dimension(input.sites.len(), 0));

        for (i, site) in input.sites.iter().enumerate() {
            match site.ledger() {
                Some(ledger) => {
                    let obs = input.site_obs(i);
                    state.push(n.encode("site.surplus", FeatureKind::Signed, ledger.last_tick_surplus()));
                    state.push(n.encode("site.stock", FeatureKind::NonNegative, ledger.current_stock()));
                    state.push(n.encode("site.mips", FeatureKind::Capacity, obs.mips));
                    state.push(n.encode("site.utilization", FeatureKind::Ratio, obs.cpu_utilization));
                    state.push(n.encode("site.queue", FeatureKind::Queue, obs.queue_length as f64));
                }
                // Grid-only sites look saturated so the policy learns to avoid them.
                None => state.extend_from_slice(&[0.0, 0.0, 0.0, 1.0, 1.0]),
            }
        }

        state.push(n.encode("task.length", FeatureKind::Demand, input.task.length_mi));
        state.push(n.encode("task.memory", FeatureKind::Memory, input.task.memory_mb()));
        state.push(n.encode("time", FeatureKind::Cyclical, input.now));

        let usage = system_usage(input.sites);
        let ratio = if usage.total_used > 0.0 {
            usage.green_used / usage.total_used
        } else {
            0.0
        };
        state.push(n.encode("system.green_ratio", FeatureKind::Ratio, ratio));
        state
    }

    fn max_abs(&self) -> f64 {
        10.0
    }
}

// ── Local ───────────────────────────────────────────────────────────

/// Host-selection state: per host `[mips, utilization, free ram, free
/// bandwidth, active, vm count, site green ratio]`, then task length,
/// memory, bandwidth and priority, the site queue and the site load.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFeatures;

const PER_HOST: usize = 7;
const LOCAL_TAIL: usize = 6;

impl FeatureSet for LocalFeatures {
    fn name(&self) -> &'static str {
        "local"
    }

    fn dimension(&self, _site_count: usize, host_count: usize) -> usize {
        PER_HOST * host_count + LOCAL_TAIL
    }

    fn build(&self, input: &FeatureInput<'_>, n: &mut StateNormalizer) -> Vec<f64> {
        let mut state = Vec::with_capacity(self.dimension(0, input.hosts.len()));
        let site = input.target_site();
        let green_ratio = site.and_then(Site::ledger).map_or(0.0, |l| l.green_ratio());

        for host in input.hosts {
            state.push(n.encode("host.mips", FeatureKind::Capacity, host.mips));
            state.push(n.encode("host.utilization", FeatureKind::Ratio, host.cpu_utilization));
            state.push(host.free_ram_ratio());
            state.push(host.free_bw_ratio());
            state.push(if host.active { 1.0 } else { 0.0 });
            state.push((host.vm_count as f64 / 10.0).min(1.0));
            state.push(green_ratio);
        }

        state.push(n.encode("task.length", FeatureKind::Demand, input.task.length_mi));
        state.push(n.encode("task.memory", FeatureKind::Memory, input.task.memory_mb()));
        state.push((input.task.bandwidth_units() / 1000.0).clamp(0.0, 1.0));
        state.push(n.encode("task.priority", FeatureKind::Ratio, input.task.priority / 10.0));

        let obs = input
            .target
            .and_then(|id| input.sites.iter().position(|s| s.id() == id))
            .map(|i| input.site_obs(i))
            .unwrap_or_default();
        state.push(n.encode("site.queue", FeatureKind::Queue, obs.queue_length as f64));
        let load = if site.is_some_and(Site::is_green) { obs.load } else { 0.5 };
        state.push(n.encode("site.load", FeatureKind::Ratio, load));
        state
    }
}

/// Replace non-finite entries with 0.0 and report out-of-range ones.
/// Returns the number of replaced entries.
pub fn validate_state(state: &mut [f64], max_abs: f64, ctx: &RunContext, tier: Tier) -> usize {
    let mut replaced = 0;
    for (i, v) in state.iter_mut().enumerate() {
        if !v.is_finite() {
            error!(%tier, index = i, value = *v, "Non-finite state entry replaced with 0.0");
            ctx.record(Counter::NonFiniteReplacements);
            *v = 0.0;
            replaced += 1;
        } else if v.abs() > max_abs {
            warn!(%tier, index = i, value = *v, max_abs, "State entry out of range");
        }
    }
    replaced
}
