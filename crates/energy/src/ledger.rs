//! Per-site green/brown energy accounting.
//!
//! Generation accrues into a green stock; consumption draws from the stock
//! first and records any shortfall as brown (grid) energy. Every public
//! operation holds the ledger's lock for its whole duration, so accrue and
//! consume calls may interleave freely across call stacks.
//!
//! Balance invariant, checked every `validation_interval` consume calls:
//!
//! ```text
//! initial_stock + cumulative_generated - cumulative_green_consumed - green_stock ≈ 0
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use greensched_core::config::LedgerConfig;
use greensched_core::{Counter, RunContext, SiteId};
use serde::Serialize;
use tracing::{debug, warn};

use crate::source::GenerationSource;

/// Mutable accounting state of one ledger. All energies are in joules,
/// all times in simulation seconds.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerState {
    pub initial_stock: f64,
    pub green_stock: f64,
    pub cumulative_generated: f64,
    pub cumulative_green_consumed: f64,
    pub cumulative_brown_consumed: f64,
    pub cumulative_surplus: f64,
    pub last_generation_update: f64,
    pub last_consumption_update: f64,
    pub generation_scaling: f64,
    /// Generation accrued since the previous effective consume call.
    pub generated_since_consume: f64,
    pub last_tick_generation: f64,
    pub last_tick_demand: f64,
    pub last_tick_green: f64,
    pub last_tick_brown: f64,
    pub last_tick_surplus: f64,
    pub consume_calls: u64,
    /// Scaled energy contributed by each source, in source order.
    pub contributions: Vec<f64>,
}

impl LedgerState {
    fn new(initial_stock: f64, sources: usize) -> Self {
        Self {
            initial_stock,
            green_stock: initial_stock,
            cumulative_generated: 0.0,
            cumulative_green_consumed: 0.0,
            cumulative_brown_consumed: 0.0,
            cumulative_surplus: 0.0,
            last_generation_update: 0.0,
            last_consumption_update: 0.0,
            generation_scaling: 1.0,
            generated_since_consume: 0.0,
            last_tick_generation: 0.0,
            last_tick_demand: 0.0,
            last_tick_green: 0.0,
            last_tick_brown: 0.0,
            last_tick_surplus: 0.0,
            consume_calls: 0,
            contributions: vec![0.0; sources],
        }
    }

    fn total_consumed(&self) -> f64 {
        self.cumulative_green_consumed + self.cumulative_brown_consumed
    }

    fn residual(&self) -> f64 {
        self.initial_stock + self.cumulative_generated - self.cumulative_green_consumed - self.green_stock
    }
}

/// Result of one consume call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ConsumptionSplit {
    pub energy_demand: f64,
    pub green_used: f64,
    pub brown_used: f64,
    /// Generation since the previous consume minus this call's demand.
    pub surplus: f64,
}

/// Outcome of a balance check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BalanceReport {
    pub residual: f64,
    pub tolerance: f64,
    pub within_tolerance: bool,
}

/// Cumulative green and total consumption, used for reward deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Usage {
    pub green_used: f64,
    pub total_used: f64,
}

impl Usage {
    pub fn delta_since(&self, earlier: &Usage) -> Usage {
        Usage {
            green_used: self.green_used - earlier.green_used,
            total_used: self.total_used - earlier.total_used,
        }
    }
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            green_used: self.green_used + rhs.green_used,
            total_used: self.total_used + rhs.total_used,
        }
    }
}

/// Coarse availability level of a site's green energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GreenStatus {
    /// Stock above 80% of initial and currently generating.
    Abundant,
    /// Stock above 30% of initial, or currently generating.
    Sufficient,
    /// Some stock left.
    Low,
    Depleted,
}

pub struct EnergyLedger {
    site: SiteId,
    sources: Vec<Arc<dyn GenerationSource>>,
    config: LedgerConfig,
    ctx: Arc<RunContext>,
    state: Mutex<LedgerState>,
}

impl std::fmt::Debug for EnergyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnergyLedger")
            .field("site", &self.site)
            .field("sources", &self.sources.iter().map(|s| s.label()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn sanitize_energy(v: f64) -> f64 {
    if v.is_finite() { v.max(0.0) } else { 0.0 }
}

impl EnergyLedger {
    /// Create a ledger with `initial_stock` joules of green energy.
    pub fn new(
        site: SiteId,
        sources: Vec<Arc<dyn GenerationSource>>,
        initial_stock: f64,
        config: LedgerConfig,
        ctx: Arc<RunContext>,
    ) -> Self {
        let initial_stock = sanitize_energy(initial_stock);
        let state = LedgerState::new(initial_stock, sources.len());
        Self {
            site,
            sources,
            config,
            ctx,
            state: Mutex::new(state),
        }
    }

    /// Convenience constructor taking the initial stock in kWh.
    pub fn with_initial_kwh(
        site: SiteId,
        sources: Vec<Arc<dyn GenerationSource>>,
        initial_kwh: f64,
        config: LedgerConfig,
        ctx: Arc<RunContext>,
    ) -> Self {
        Self::new(site, sources, initial_kwh * JOULES_PER_KWH, config, ctx)
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    pub fn sources(&self) -> &[Arc<dyn GenerationSource>] {
        &self.sources
    }

    // A panic while holding the lock cannot leave the state half-updated in
    // a way later calls could not cope with, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the multiplier applied to all generation. Invalid factors fall
    /// back to 1.0.
    pub fn set_scaling_factor(&self, factor: f64) {
        let factor = if factor.is_finite() && factor > 0.0 {
            factor
        } else {
            warn!(site = %self.site, factor, "Invalid generation scaling factor, using 1.0");
            1.0
        };
        self.lock().generation_scaling = factor;
    }

    // ── Accrual and consumption ──────────────────────────────────

    /// Add generation over `[last_generation_update, now]` to the stock.
    ///
    /// Returns the energy added. Calls at or within the update threshold of
    /// the previous accrual are no-ops.
    pub fn accrue_generation(&self, now: f64) -> f64 {
        if !now.is_finite() {
            warn!(site = %self.site, "Ignoring accrual at non-finite time");
            return 0.0;
        }
        let mut st = self.lock();
        let last = st.last_generation_update;
        let elapsed = now - last;
        if elapsed <= self.config.update_threshold_secs {
            return 0.0;
        }

        let scaling = st.generation_scaling;
        let mut added = 0.0;
        for (i, source) in self.sources.iter().enumerate() {
            let e = sanitize_energy(source.energy_over_interval(last, now)) * scaling;
            st.contributions[i] += e;
            added += e;
        }

        st.green_stock += added;
        st.cumulative_generated += added;
        st.generated_since_consume += added;
        st.last_generation_update = now;

        debug!(site = %self.site, from = last, to = now, joules = added, "Accrued generation");
        added
    }

    /// Draw `demand_watts` over `[last_consumption_update, now]`, green first.
    pub fn consume(&self, now: f64, demand_watts: f64) -> ConsumptionSplit {
        if !now.is_finite() {
            warn!(site = %self.site, "Ignoring consumption at non-finite time");
            return ConsumptionSplit::default();
        }
        let demand_watts = if demand_watts.is_finite() && demand_watts >= 0.0 {
            demand_watts
        } else {
            warn!(site = %self.site, demand_watts, "Clamping invalid power demand to 0");
            0.0
        };

        let mut st = self.lock();
        let elapsed = now - st.last_consumption_update;
        if elapsed <= self.config.update_threshold_secs {
            return ConsumptionSplit::default();
        }

        let energy_demand = demand_watts * elapsed;
        let split = apply_demand(&mut st, energy_demand);
        st.last_consumption_update = now;
        st.consume_calls += 1;

        if st.consume_calls % self.config.validation_interval.max(1) == 0 {
            self.check_balance(&st);
        }
        split
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn current_stock(&self) -> f64 {
        self.lock().green_stock
    }

    /// Share of all consumption served green. 1.0 before anything was consumed.
    pub fn green_ratio(&self) -> f64 {
        let st = self.lock();
        let total = st.total_consumed();
        if total > 0.0 {
            st.cumulative_green_consumed / total
        } else {
            1.0
        }
    }

    /// Share of the last tick's demand that was served green.
    pub fn instant_green_ratio(&self) -> f64 {
        let st = self.lock();
        if st.last_tick_demand > 0.0 {
            st.last_tick_green / st.last_tick_demand
        } else {
            1.0
        }
    }

    /// Last tick's generation over its demand, capped at 1.
    pub fn self_sufficiency(&self) -> f64 {
        let st = self.lock();
        if st.last_tick_demand > 0.0 {
            (st.last_tick_generation / st.last_tick_demand).min(1.0)
        } else {
            1.0
        }
    }

    pub fn usage(&self) -> Usage {
        let st = self.lock();
        Usage {
            green_used: st.cumulative_green_consumed,
            total_used: st.total_consumed(),
        }
    }

    pub fn last_tick_surplus(&self) -> f64 {
        self.lock().last_tick_surplus
    }

    pub fn cumulative_surplus(&self) -> f64 {
        self.lock().cumulative_surplus
    }

    /// Copy of the full accounting state.
    pub fn snapshot(&self) -> LedgerState {
        self.lock().clone()
    }

    /// Energy each source has contributed so far, labeled.
    pub fn contributions(&self) -> Vec<(String, f64)> {
        let st = self.lock();
        self.sources
            .iter()
            .zip(st.contributions.iter())
            .map(|(s, e)| (s.label().to_string(), *e))
            .collect()
    }

    // ── Forecasts ────────────────────────────────────────────────

    /// Scaled generation power at `now`, summed over sources.
    pub fn current_power(&self, now: f64) -> f64 {
        let scaling = self.lock().generation_scaling;
        self.sources.iter().map(|s| sanitize_energy(s.power_at(now))).sum::<f64>() * scaling
    }

    /// Scaled power forecast `lookahead` seconds ahead (configured default if `None`).
    pub fn predicted_generation(&self, now: f64, lookahead: Option<f64>) -> f64 {
        let lookahead = lookahead.unwrap_or(self.config.prediction_lookahead_secs);
        let scaling = self.lock().generation_scaling;
        self.sources
            .iter()
            .map(|s| sanitize_energy(s.predicted_power(now, lookahead)))
            .sum::<f64>()
            * scaling
    }

    /// Green energy expected to be left at `until` if the site keeps drawing
    /// `demand_watts` from `now`.
    pub fn predict_availability(&self, now: f64, until: f64, demand_watts: f64) -> f64 {
        let st = self.lock();
        if !(now.is_finite() && until.is_finite()) || until <= now {
            return st.green_stock;
        }
        let generation: f64 = self
            .sources
            .iter()
            .map(|s| sanitize_energy(s.energy_over_interval(now, until)))
            .sum::<f64>()
            * st.generation_scaling;
        let consumption = sanitize_energy(demand_watts) * (until - now);
        (st.green_stock + generation - consumption).max(0.0)
    }

    pub fn status(&self, now: f64) -> GreenStatus {
        let power = self.current_power(now);
        let st = self.lock();
        let stock_ratio = if st.initial_stock > 0.0 {
            st.green_stock / st.initial_stock
        } else if st.green_stock > 0.0 {
            1.0
        } else {
            0.0
        };

        if stock_ratio > 0.8 && power > 0.0 {
            GreenStatus::Abundant
        } else if stock_ratio > 0.3 || power > 0.0 {
            GreenStatus::Sufficient
        } else if st.green_stock > 0.0 {
            GreenStatus::Low
        } else {
            GreenStatus::Depleted
        }
    }

    // ── Balance ──────────────────────────────────────────────────

    /// Check the balance invariant now. Violations are logged and counted,
    /// never fatal.
    pub fn validate_balance(&self) -> BalanceReport {
        let st = self.lock();
        self.check_balance(&st)
    }

    fn check_balance(&self, st: &LedgerState) -> BalanceReport {
        let residual = st.residual();
        let tolerance = self.config.balance_tolerance_joules;
        let within_tolerance = residual.abs() <= tolerance;
        if !within_tolerance {
            self.ctx.record(Counter::BalanceViolations);
            warn!(
                site = %self.site,
                residual,
                tolerance,
                initial = st.initial_stock,
                generated = st.cumulative_generated,
                green_consumed = st.cumulative_green_consumed,
                stock = st.green_stock,
                "Energy balance violated"
            );
        }
        BalanceReport {
            residual,
            tolerance,
            within_tolerance,
        }
    }

    /// Restore the ledger to a fresh state at an episode boundary.
    pub fn reset(&self, initial_stock: f64) {
        let mut st = self.lock();
        let scaling = st.generation_scaling;
        *st = LedgerState::new(sanitize_energy(initial_stock), self.sources.len());
        st.generation_scaling = scaling;
    }
}

pub const JOULES_PER_KWH: f64 = 3_600_000.0;

fn apply_demand(st: &mut LedgerState, energy_demand: f64) -> ConsumptionSplit {
    let green_used = energy_demand.min(st.green_stock.max(0.0));
    let brown_used = energy_demand - green_used;
    st.green_stock = (st.green_stock - green_used).max(0.0);
    st.cumulative_green_consumed += green_used;
    st.cumulative_brown_consumed += brown_used;

    let surplus = st.generated_since_consume - energy_demand;
    st.cumulative_surplus += surplus;
    st.last_tick_generation = st.generated_since_consume;
    st.generated_since_consume = 0.0;
    st.last_tick_demand = energy_demand;
    st.last_tick_green = green_used;
    st.last_tick_brown = brown_used;
    st.last_tick_surplus = surplus;

    ConsumptionSplit {
        energy_demand,
        green_used,
        brown_used,
        surplus,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::GenerationProfile;

    fn flat(watts: f64) -> Arc<dyn GenerationSource> {
        Arc::new(GenerationProfile::load("flat", vec![(0.0, watts), (1.0e6, watts)]).unwrap())
    }

    fn ledger(sources: Vec<Arc<dyn GenerationSource>>, stock: f64) -> EnergyLedger {
        EnergyLedger::new(
            SiteId(0),
            sources,
            stock,
            LedgerConfig::default(),
            Arc::new(RunContext::new()),
        )
    }

    #[test]
    fn consume_splits_green_then_brown() {
        let l = ledger(vec![], 300.0);
        let split = l.consume(1.0, 500.0);
        assert!((split.green_used - 300.0).abs() < 1e-9);
        assert!((split.brown_used - 200.0).abs() < 1e-9);
        assert_eq!(l.current_stock(), 0.0);
    }

    #[test]
    fn surplus_accumulates_per_tick() {
        let l = ledger(vec![flat(10.0)], 0.0);
        assert!((l.accrue_generation(10.0) - 100.0).abs() < 1e-9);
        let first = l.consume(10.0, 8.0);
        assert!((first.surplus - 20.0).abs() < 1e-9);
        assert!((l.accrue_generation(15.0) - 50.0).abs() < 1e-9);
        let second = l.consume(20.0, 8.0);
        assert!((second.surplus + 30.0).abs() < 1e-9);
        assert!((l.cumulative_surplus() + 10.0).abs() < 1e-9);
    }

    #[test]
    fn accrue_within_threshold_is_noop() {
        let l = ledger(vec![flat(1000.0)], 0.0);
        l.accrue_generation(5.0);
        let before = l.current_stock();
        assert_eq!(l.accrue_generation(5.005), 0.0);
        assert_eq!(l.accrue_generation(4.0), 0.0);
        assert_eq!(l.current_stock(), before);
    }

    #[test]
    fn consume_within_threshold_is_noop() {
        let l = ledger(vec![], 1000.0);
        l.consume(1.0, 10.0);
        let split = l.consume(1.001, 10.0);
        assert_eq!(split, ConsumptionSplit::default());
        assert_eq!(l.snapshot().consume_calls, 1);
    }

    #[test]
    fn invalid_demand_is_clamped_to_zero() {
        let l = ledger(vec![], 50.0);
        let split = l.consume(2.0, f64::NAN);
        assert_eq!(split.energy_demand, 0.0);
        let split = l.consume(4.0, -10.0);
        assert_eq!(split.energy_demand, 0.0);
        assert_eq!(l.current_stock(), 50.0);
    }

    #[test]
    fn non_finite_time_is_ignored() {
        let l = ledger(vec![flat(10.0)], 0.0);
        assert_eq!(l.accrue_generation(f64::INFINITY), 0.0);
        assert_eq!(l.consume(f64::NAN, 10.0), ConsumptionSplit::default());
        assert_eq!(l.snapshot().last_generation_update, 0.0);
    }

    #[test]
    fn green_ratio_defaults_to_one() {
        let l = ledger(vec![], 0.0);
        assert_eq!(l.green_ratio(), 1.0);
        l.consume(10.0, 1.0);
        assert_eq!(l.green_ratio(), 0.0);
    }

    #[test]
    fn green_ratio_mixes() {
        let l = ledger(vec![], 30.0);
        l.consume(10.0, 10.0); // 100 J demand, 30 green
        assert!((l.green_ratio() - 0.3).abs() < 1e-9);
        assert!((l.instant_green_ratio() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn scaling_factor_multiplies_generation() {
        let l = ledger(vec![flat(10.0)], 0.0);
        l.set_scaling_factor(2.5);
        assert!((l.accrue_generation(4.0) - 100.0).abs() < 1e-9);
        assert!((l.current_power(1.0) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_scaling_factor_falls_back_to_one() {
        let l = ledger(vec![flat(10.0)], 0.0);
        l.set_scaling_factor(-3.0);
        assert_eq!(l.snapshot().generation_scaling, 1.0);
        l.set_scaling_factor(f64::NAN);
        assert_eq!(l.snapshot().generation_scaling, 1.0);
    }

    #[test]
    fn balance_holds_after_mixed_operations() {
        let l = ledger(vec![flat(5.0)], 200.0);
        for i in 1..=50 {
            let t = i as f64 * 3.0;
            l.accrue_generation(t);
            l.consume(t + 1.0, 12.0);
        }
        let report = l.validate_balance();
        assert!(report.within_tolerance, "residual {}", report.residual);
    }

    #[test]
    fn periodic_validation_counts_violations() {
        let ctx = Arc::new(RunContext::new());
        let cfg = LedgerConfig {
            validation_interval: 2,
            ..LedgerConfig::default()
        };
        let l = EnergyLedger::new(SiteId(3), vec![], 100.0, cfg, ctx.clone());
        // Corrupt the state to force a residual.
        l.lock().green_stock = 500.0;
        l.consume(1.0, 1.0);
        assert_eq!(ctx.count(Counter::BalanceViolations), 0);
        l.consume(2.0, 1.0);
        assert_eq!(ctx.count(Counter::BalanceViolations), 1);
        assert!(!l.validate_balance().within_tolerance);
    }

    #[test]
    fn zero_validation_interval_checks_every_call() {
        let ctx = Arc::new(RunContext::new());
        let cfg = LedgerConfig {
            validation_interval: 0,
            ..LedgerConfig::default()
        };
        let l = EnergyLedger::new(SiteId(4), vec![], 100.0, cfg, ctx.clone());
        l.lock().green_stock = 500.0;
        l.consume(1.0, 1.0);
        assert_eq!(ctx.count(Counter::BalanceViolations), 1);
        l.consume(2.0, 1.0);
        assert_eq!(ctx.count(Counter::BalanceViolations), 2);
    }

    #[test]
    fn contributions_are_tracked_per_source() {
        let l = ledger(vec![flat(10.0), flat(30.0)], 0.0);
        l.accrue_generation(10.0);
        let c = l.contributions();
        assert_eq!(c.len(), 2);
        assert!((c[0].1 - 100.0).abs() < 1e-9);
        assert!((c[1].1 - 300.0).abs() < 1e-9);
    }

    #[test]
    fn self_sufficiency_caps_at_one() {
        let l = ledger(vec![flat(10.0)], 0.0);
        assert_eq!(l.self_sufficiency(), 1.0);
        l.accrue_generation(10.0);
        l.consume(10.0, 20.0); // 100 J generated, 200 J demanded
        assert!((l.self_sufficiency() - 0.5).abs() < 1e-9);
        l.accrue_generation(20.0);
        l.consume(20.0, 1.0);
        assert_eq!(l.self_sufficiency(), 1.0);
    }

    #[test]
    fn availability_prediction() {
        let l = ledger(vec![flat(10.0)], 1000.0);
        // 1000 + 10 W × 100 s - 5 W × 100 s
        assert!((l.predict_availability(0.0, 100.0, 5.0) - 1500.0).abs() < 1e-6);
        assert_eq!(l.predict_availability(0.0, 1.0e5, 1.0e6), 0.0);
        assert_eq!(l.predict_availability(50.0, 10.0, 5.0), 1000.0);
    }

    #[test]
    fn predicted_generation_uses_lookahead() {
        let p: Arc<dyn GenerationSource> =
            Arc::new(GenerationProfile::load("ramp", vec![(0.0, 0.0), (3600.0, 3600.0)]).unwrap());
        let l = ledger(vec![p], 0.0);
        assert!((l.predicted_generation(0.0, None) - 3600.0).abs() < 1e-9);
        assert!((l.predicted_generation(0.0, Some(1800.0)) - 1800.0).abs() < 1e-9);
    }

    #[test]
    fn status_levels() {
        let l = ledger(vec![], 1000.0);
        assert_eq!(l.status(0.0), GreenStatus::Sufficient);
        l.consume(1.0, 800.0);
        assert_eq!(l.status(1.0), GreenStatus::Low);
        l.consume(2.0, 800.0);
        assert_eq!(l.status(2.0), GreenStatus::Depleted);

        let sunny = ledger(vec![flat(10.0)], 1000.0);
        assert_eq!(sunny.status(0.0), GreenStatus::Abundant);
    }

    #[test]
    fn reset_restores_fresh_state_and_keeps_scaling() {
        let l = ledger(vec![flat(10.0)], 100.0);
        l.set_scaling_factor(2.0);
        l.accrue_generation(10.0);
        l.consume(10.0, 5.0);
        l.reset(400.0);
        let s = l.snapshot();
        assert_eq!(s.green_stock, 400.0);
        assert_eq!(s.cumulative_generated, 0.0);
        assert_eq!(s.consume_calls, 0);
        assert_eq!(s.generation_scaling, 2.0);
        assert_eq!(l.green_ratio(), 1.0);
    }

    #[test]
    fn kwh_constructor_converts() {
        let l = EnergyLedger::with_initial_kwh(
            SiteId(0),
            vec![],
            2.0,
            LedgerConfig::default(),
            Arc::new(RunContext::new()),
        );
        assert_eq!(l.current_stock(), 7_200_000.0);
    }

    #[test]
    fn usage_delta() {
        let l = ledger(vec![], 100.0);
        let before = l.usage();
        l.consume(10.0, 20.0);
        let d = l.usage().delta_since(&before);
        assert!((d.green_used - 100.0).abs() < 1e-9);
        assert!((d.total_used - 200.0).abs() < 1e-9);
    }
}
