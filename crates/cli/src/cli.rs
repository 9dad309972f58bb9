use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Green-aware scheduling toolkit.
///
/// Inspects generation profiles, replays energy ledgers and runs synthetic
/// scheduling episodes against the policy server.
#[derive(Parser, Debug)]
#[command(name = "greensched", about = "Green-aware two-tier scheduling toolkit")]
pub struct CliArgs {
    /// TOML config file (environment and .env are used when omitted)
    #[arg(long, global = true, env = "GREENSCHED_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load a generation CSV and print its summary as JSON
    Profile {
        csv: PathBuf,

        /// Power column override
        #[arg(long)]
        column: Option<String>,

        /// Seconds between rows override
        #[arg(long)]
        interval: Option<f64>,
    },

    /// Drive one ledger through accrue/consume ticks and report its balance
    Replay {
        /// Generation CSV; a clear-sky solar model is used when omitted
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Peak of the solar model, watts
        #[arg(long, default_value = "5000")]
        peak_watts: f64,

        /// Initial green stock, kWh
        #[arg(long, default_value = "1")]
        initial_kwh: f64,

        /// Mean power demand, watts
        #[arg(long, default_value = "2000")]
        demand_watts: f64,

        /// Simulated span, hours
        #[arg(long, default_value = "24")]
        hours: f64,

        /// Tick length, seconds
        #[arg(long, default_value = "60")]
        step: f64,

        /// Seed for the demand jitter
        #[arg(long, default_value = "1")]
        seed: u64,
    },

    /// Run synthetic scheduling episodes against the policy server
    Simulate {
        /// Number of sites
        #[arg(long, default_value = "3")]
        sites: usize,

        /// How many of the sites are green-aware
        #[arg(long, default_value = "2")]
        green_sites: usize,

        /// Hosts per site
        #[arg(long, default_value = "4")]
        hosts: usize,

        /// Tasks per episode
        #[arg(long, default_value = "50")]
        tasks: usize,

        #[arg(long, default_value = "1")]
        episodes: usize,

        /// Generation CSV shared by green sites; solar model when omitted
        #[arg(long)]
        csv: Option<PathBuf>,

        #[arg(long, default_value = "7")]
        seed: u64,
    },

    /// Check that the policy server answers
    OracleHealth,
}
