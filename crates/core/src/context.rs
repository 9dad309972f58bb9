//! Per-run context shared by ledgers, trackers and the oracle client.
//!
//! Holds the run identity, the current episode number and the diagnostic
//! counters that the error paths bump instead of aborting the run.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

const COUNTER_SLOTS: usize = 8;

/// Diagnostic events counted over the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    /// Oracle unreachable or timed out; a random action was used.
    DegradedOracleCalls,
    /// Action index outside the candidate range; the task stayed unassigned.
    SkippedDecisions,
    /// Completion for a task with no pending decision.
    MissingCompletions,
    /// A second decision recorded for a task that was still in flight.
    DuplicateDecisions,
    /// NaN or infinite reward/feature replaced with 0.0.
    NonFiniteReplacements,
    /// Ledger balance residual above tolerance.
    BalanceViolations,
    /// Malformed generation profile rows.
    SkippedProfileRows,
    /// Experience or lifecycle call the oracle rejected.
    SubmissionFailures,
}

impl Counter {
    pub const ALL: [Counter; COUNTER_SLOTS] = [
        Counter::DegradedOracleCalls,
        Counter::SkippedDecisions,
        Counter::MissingCompletions,
        Counter::DuplicateDecisions,
        Counter::NonFiniteReplacements,
        Counter::BalanceViolations,
        Counter::SkippedProfileRows,
        Counter::SubmissionFailures,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Counter::DegradedOracleCalls => "degraded_oracle_calls",
            Counter::SkippedDecisions => "skipped_decisions",
            Counter::MissingCompletions => "missing_completions",
            Counter::DuplicateDecisions => "duplicate_decisions",
            Counter::NonFiniteReplacements => "non_finite_replacements",
            Counter::BalanceViolations => "balance_violations",
            Counter::SkippedProfileRows => "skipped_profile_rows",
            Counter::SubmissionFailures => "submission_failures",
        }
    }
}

#[derive(Debug)]
pub struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    episode: AtomicU64,
    counters: [AtomicU64; COUNTER_SLOTS],
}

/// Point-in-time copy of a [`RunContext`], suitable for logging or JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub episode: u64,
    pub counters: Vec<(Counter, u64)>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            episode: AtomicU64::new(0),
            counters: Default::default(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn episode(&self) -> u64 {
        self.episode.load(Ordering::Relaxed)
    }

    /// Move to the next episode and return its number (first episode is 1).
    pub fn advance_episode(&self) -> u64 {
        self.episode.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record(&self, counter: Counter) {
        self.counters[counter.slot()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_n(&self, counter: Counter, n: u64) {
        self.counters[counter.slot()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn count(&self, counter: Counter) -> u64 {
        self.counters[counter.slot()].load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            episode: self.episode(),
            counters: Counter::ALL.iter().map(|c| (*c, self.count(*c))).collect(),
        }
    }

    /// Log every non-zero counter.
    pub fn log_summary(&self) {
        tracing::info!(run_id = %self.run_id, episode = self.episode(), "Run diagnostics:");
        for counter in Counter::ALL {
            let n = self.count(counter);
            if n > 0 {
                tracing::info!("  {:<26} {}", counter.name(), n);
            }
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}
