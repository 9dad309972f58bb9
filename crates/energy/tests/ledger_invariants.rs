use std::sync::Arc;

use greensched_core::config::LedgerConfig;
use greensched_core::{Counter, RunContext, SiteId};
use greensched_energy::{EnergyLedger, GenerationProfile, GenerationSource, SolarModel};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn wind_profile() -> Arc<dyn GenerationSource> {
    let samples: Vec<(f64, f64)> = (0..144)
        .map(|i| {
            let t = i as f64 * 600.0;
            (t, 2000.0 + 1500.0 * (t / 7200.0).sin())
        })
        .collect();
    Arc::new(GenerationProfile::load("wind", samples).unwrap())
}

fn ledger(ctx: Arc<RunContext>, stock: f64) -> EnergyLedger {
    EnergyLedger::new(
        SiteId(0),
        vec![wind_profile(), Arc::new(SolarModel::new("pv", 50_000.0))],
        stock,
        LedgerConfig::default(),
        ctx,
    )
}

#[test]
fn randomized_interleaving_keeps_balance_and_non_negative_stock() {
    let ctx = Arc::new(RunContext::new());
    let l = ledger(ctx.clone(), 250_000.0);
    let mut rng = StdRng::seed_from_u64(7);
    let mut now = 0.0;

    for _ in 0..5_000 {
        now += rng.gen_range(0.0..120.0);
        if rng.gen_bool(0.5) {
            l.accrue_generation(now);
        } else {
            let demand = rng.gen_range(0.0..8_000.0);
            l.consume(now, demand);
        }
        assert!(l.current_stock() >= 0.0);
    }

    let report = l.validate_balance();
    assert!(report.within_tolerance, "residual {}", report.residual);
    assert_eq!(ctx.count(Counter::BalanceViolations), 0);

    let s = l.snapshot();
    assert!(s.cumulative_green_consumed <= s.initial_stock + s.cumulative_generated + 0.01);
}

#[test]
fn out_of_order_and_garbage_inputs_never_break_invariants() {
    let ctx = Arc::new(RunContext::new());
    let l = ledger(ctx.clone(), 1_000.0);
    let mut rng = StdRng::seed_from_u64(99);

    for i in 0..2_000 {
        let now = match i % 7 {
            0 => f64::NAN,
            1 => -rng.gen_range(0.0..100.0),
            _ => rng.gen_range(0.0..86_400.0),
        };
        let demand = match i % 5 {
            0 => f64::INFINITY,
            1 => -500.0,
            _ => rng.gen_range(0.0..3_000.0),
        };
        l.accrue_generation(now);
        l.consume(now, demand);
        assert!(l.current_stock() >= 0.0);
        assert!(l.current_stock().is_finite());
    }
    assert!(l.validate_balance().within_tolerance);
}

#[test]
fn concurrent_callers_serialize_on_the_ledger_lock() {
    let ctx = Arc::new(RunContext::new());
    let l = Arc::new(ledger(ctx.clone(), 10_000.0));

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let l = Arc::clone(&l);
            std::thread::spawn(move || {
                for step in 0..500 {
                    let now = (step * 4 + worker) as f64 * 2.0;
                    if worker % 2 == 0 {
                        l.accrue_generation(now);
                    } else {
                        l.consume(now, 1_500.0);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert!(l.current_stock() >= 0.0);
    assert!(l.validate_balance().within_tolerance);
}

#[test]
fn zero_profile_site_runs_fully_brown() {
    let ctx = Arc::new(RunContext::new());
    let l = EnergyLedger::new(
        SiteId(1),
        vec![Arc::new(GenerationProfile::zero("missing"))],
        0.0,
        LedgerConfig::default(),
        ctx,
    );
    for i in 1..=10 {
        let t = i as f64 * 60.0;
        l.accrue_generation(t);
        l.consume(t, 100.0);
    }
    let s = l.snapshot();
    assert_eq!(s.cumulative_green_consumed, 0.0);
    assert!((s.cumulative_brown_consumed - 60_000.0).abs() < 1e-6);
    assert_eq!(l.green_ratio(), 0.0);
}
