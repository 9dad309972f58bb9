mod cli;
mod sim;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::{info, warn};

use greensched_core::config::{load_dotenv, ProfileConfig};
use greensched_core::{GreenConfig, RunContext, SiteId};
use greensched_energy::loader::{load_csv, load_csv_or_zero};
use greensched_energy::{EnergyLedger, GenerationSource, Site, SolarModel};
use greensched_oracle::{HttpOracle, Oracle, ResilientOracle};
use greensched_scheduler::{CompletionSender, EngineView, HierarchicalScheduler};

use crate::cli::{CliArgs, Command};
use crate::sim::SyntheticEngine;

const JOULES_PER_KWH: f64 = 3.6e6;
const SIM_INITIAL_KWH: f64 = 1.0;
const SIM_SOLAR_PEAK_WATTS: f64 = 20_000.0;
const ARRIVAL_GAP_SECS: f64 = 30.0;
const DRAIN_STEP_SECS: f64 = 60.0;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    load_dotenv();
    let args = CliArgs::parse();

    let config = match &args.config {
        Some(path) => GreenConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => GreenConfig::from_env().context("invalid environment configuration")?,
    };
    config.log_summary();

    let ctx = Arc::new(RunContext::new());
    match args.command {
        Command::Profile { csv, column, interval } => profile(&csv, &config, column, interval)?,
        Command::Replay {
            csv,
            peak_watts,
            initial_kwh,
            demand_watts,
            hours,
            step,
            seed,
        } => replay(
            &config,
            &ctx,
            csv.as_deref(),
            ReplayPlan {
                peak_watts,
                initial_kwh,
                demand_watts,
                hours,
                step,
                seed,
            },
        )?,
        Command::Simulate {
            sites,
            green_sites,
            hosts,
            tasks,
            episodes,
            csv,
            seed,
        } => simulate(
            &config,
            &ctx,
            SimPlan {
                sites,
                green_sites,
                hosts,
                tasks,
                episodes,
                csv,
                seed,
            },
        )?,
        Command::OracleHealth => oracle_health(&config)?,
    }

    ctx.log_summary();
    Ok(())
}

// ── profile ─────────────────────────────────────────────────────────

fn profile(csv: &Path, config: &GreenConfig, column: Option<String>, interval: Option<f64>) -> Result<()> {
    let mut profile_config: ProfileConfig = config.profile.clone();
    if let Some(c) = column {
        profile_config.column = c;
    }
    if let Some(i) = interval {
        profile_config.interval_secs = i;
    }
    let profile = load_csv(csv, &profile_config)
        .with_context(|| format!("failed to load profile {}", csv.display()))?;
    println!("{}", serde_json::to_string_pretty(&profile.summary())?);
    Ok(())
}

// ── replay ──────────────────────────────────────────────────────────

struct ReplayPlan {
    peak_watts: f64,
    initial_kwh: f64,
    demand_watts: f64,
    hours: f64,
    step: f64,
    seed: u64,
}

fn generation_source(csv: Option<&Path>, peak_watts: f64, config: &GreenConfig, ctx: &RunContext) -> Arc<dyn GenerationSource> {
    let step = config.ledger.integration_step_secs;
    match csv {
        Some(path) => Arc::new(load_csv_or_zero(path, &config.profile, ctx).with_integration_step(step)),
        None => Arc::new(SolarModel::new("solar", peak_watts).with_integration_step(step)),
    }
}

fn replay(config: &GreenConfig, ctx: &Arc<RunContext>, csv: Option<&Path>, plan: ReplayPlan) -> Result<()> {
    if !(plan.step > 0.0) || !(plan.hours > 0.0) {
        bail!("step and hours must be positive");
    }
    let source = generation_source(csv, plan.peak_watts, config, ctx);
    let ledger = EnergyLedger::with_initial_kwh(
        SiteId(0),
        vec![source],
        plan.initial_kwh,
        config.ledger.clone(),
        ctx.clone(),
    );

    let mut rng = StdRng::seed_from_u64(plan.seed);
    let end = plan.hours * 3600.0;
    let mut t = 0.0;
    let mut ticks = 0u64;
    while t < end {
        t = (t + plan.step).min(end);
        let demand = plan.demand_watts * rng.gen_range(0.7..1.3);
        ledger.accrue_generation(t);
        ledger.consume(t, demand);
        ticks += 1;
    }

    let balance = ledger.validate_balance();
    let usage = ledger.usage();
    info!(ticks, green_ratio = ledger.green_ratio(), "Replay finished");
    let report = json!({
        "ticks": ticks,
        "state": ledger.snapshot(),
        "balance": balance,
        "green_ratio": ledger.green_ratio(),
        "self_sufficiency": ledger.self_sufficiency(),
        "usage": usage,
        "status": ledger.status(t),
        "predicted_generation_joules": ledger.predicted_generation(t, None),
        "contributions": ledger.contributions(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !balance.within_tolerance {
        warn!(residual = balance.residual, "Ledger balance drifted beyond tolerance");
    }
    Ok(())
}

// ── simulate ────────────────────────────────────────────────────────

struct SimPlan {
    sites: usize,
    green_sites: usize,
    hosts: usize,
    tasks: usize,
    episodes: usize,
    csv: Option<PathBuf>,
    seed: u64,
}

fn simulate(config: &GreenConfig, ctx: &Arc<RunContext>, plan: SimPlan) -> Result<()> {
    if plan.hosts == 0 {
        bail!("sites need at least one host");
    }
    let source = generation_source(plan.csv.as_deref(), SIM_SOLAR_PEAK_WATTS, config, ctx);
    let sites: Vec<Site> = (0..plan.sites)
        .map(|i| {
            if i < plan.green_sites {
                Site::green(Arc::new(EnergyLedger::with_initial_kwh(
                    SiteId(i),
                    vec![source.clone()],
                    SIM_INITIAL_KWH,
                    config.ledger.clone(),
                    ctx.clone(),
                )))
            } else {
                Site::plain(SiteId(i))
            }
        })
        .collect();

    let http = HttpOracle::new(&config.oracle).context("failed to build oracle client")?;
    let oracle = ResilientOracle::new(Arc::new(http), ctx.clone(), config.oracle.seed);
    let mut scheduler = HierarchicalScheduler::new(sites, oracle, config, ctx.clone())?;
    let mut engine = SyntheticEngine::new(plan.sites, plan.hosts, plan.seed);
    let tx = scheduler.completion_sender();

    for _ in 0..plan.episodes {
        engine.reset();
        for ledger in scheduler.sites().iter().filter_map(Site::ledger) {
            ledger.reset(SIM_INITIAL_KWH * JOULES_PER_KWH);
        }
        scheduler.begin_episode(Some(plan.tasks), engine.now());

        for _ in 0..plan.tasks {
            engine.advance(ARRIVAL_GAP_SECS);
            step(&mut scheduler, &mut engine, &tx)?;

            let task = engine.next_task();
            let now = engine.now();
            let Some(site) = scheduler.schedule_global(&task, now, &engine) else {
                continue;
            };
            let Some(host) = scheduler.schedule_local(&task, site, now, &engine) else {
                scheduler.withdraw(task.id);
                continue;
            };
            engine.submit(&task, site, host);
        }
        scheduler.finalize_submissions();

        while !engine.idle() {
            engine.advance(DRAIN_STEP_SECS);
            step(&mut scheduler, &mut engine, &tx)?;
        }

        let summary = scheduler.end_episode(&engine);
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

/// One engine tick: energy accounting, then completions.
fn step(scheduler: &mut HierarchicalScheduler, engine: &mut SyntheticEngine, tx: &CompletionSender) -> Result<()> {
    scheduler.advance_energy(&*engine);
    for event in engine.collect_finished() {
        tx.notify(event)?;
    }
    scheduler.drain_completions(&*engine);
    Ok(())
}

// ── oracle-health ───────────────────────────────────────────────────

fn oracle_health(config: &GreenConfig) -> Result<()> {
    let oracle = HttpOracle::new(&config.oracle)?;
    match oracle.health() {
        Ok(()) => {
            println!("oracle at {} is healthy", oracle.base_url());
            Ok(())
        }
        Err(e) => bail!("oracle at {} is unreachable: {e}", oracle.base_url()),
    }
}
