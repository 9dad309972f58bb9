use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use greensched_core::{Counter, RunContext, SiteId, TaskId, Tier};
use greensched_energy::Usage;
use tracing::{debug, error, info, warn};

use crate::engine::TaskObservation;

/// A decision waiting for its task to finish.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDecision {
    pub task: TaskObservation,
    pub tier: Tier,
    /// Chosen site for global decisions; the site scheduled into for local ones.
    pub site: Option<SiteId>,
    pub state: Vec<f64>,
    pub action: usize,
    pub decided_at: f64,
    /// System-wide usage when the decision was made.
    pub system_usage: Usage,
    /// Usage of the target site when the decision was made.
    pub target_usage: Usage,
    pub log_prob: f64,
    pub value: f64,
}

/// Outcome of resolving a pending decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub decision: PendingDecision,
    /// True for the single terminal resolution of the episode.
    pub done: bool,
}

/// Completion bookkeeping for one episode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeProgress {
    pub expected: Option<usize>,
    pub completed: usize,
    pub ending: bool,
    pub done_emitted: bool,
}

impl EpisodeProgress {
    /// Count one resolution and report whether it is the terminal one.
    fn on_resolved(&mut self) -> bool {
        self.completed += 1;
        if self.done_emitted {
            return false;
        }
        let all_in = self.expected.is_some_and(|n| self.completed >= n);
        if all_in || self.ending {
            self.done_emitted = true;
            return true;
        }
        false
    }
}

/// Pending decisions of one tier, keyed by task.
///
/// Removal is atomic under the map lock, so a task is resolved at most once
/// no matter how many completion events arrive for it.
pub struct DecisionTracker {
    tier: Tier,
    site: Option<SiteId>,
    pending: Mutex<HashMap<TaskId, PendingDecision>>,
    progress: Mutex<EpisodeProgress>,
    ctx: Arc<RunContext>,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DecisionTracker {
    pub fn global(ctx: Arc<RunContext>) -> Self {
        Self::new(Tier::Global, None, ctx)
    }

    pub fn local(site: SiteId, ctx: Arc<RunContext>) -> Self {
        Self::new(Tier::Local, Some(site), ctx)
    }

    fn new(tier: Tier, site: Option<SiteId>, ctx: Arc<RunContext>) -> Self {
        Self {
            tier,
            site,
            pending: Mutex::new(HashMap::new()),
            progress: Mutex::new(EpisodeProgress::default()),
            ctx,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn site(&self) -> Option<SiteId> {
        self.site
    }

    /// Store a decision. A second decision for a task still in flight is a
    /// bug upstream; it is logged and replaces the first.
    pub fn record(&self, decision: PendingDecision) {
        let task = decision.task.id;
        let previous = relock(&self.pending).insert(task, decision);
        if let Some(prev) = previous {
            self.ctx.record(Counter::DuplicateDecisions);
            error!(
                tier = %self.tier,
                %task,
                previous_action = prev.action,
                previous_at = prev.decided_at,
                "Duplicate decision for in-flight task, overwriting"
            );
        } else {
            debug!(tier = %self.tier, %task, "Decision recorded");
        }
    }

    /// Remove and return the decision for `task`.
    ///
    /// Returns `None` when nothing is pending, which also covers a repeated
    /// completion for an already resolved task.
    pub fn resolve(&self, task: TaskId) -> Option<Resolved> {
        let decision = relock(&self.pending).remove(&task);
        let Some(decision) = decision else {
            self.ctx.record(Counter::MissingCompletions);
            warn!(tier = %self.tier, %task, "Completion for task with no pending decision");
            return None;
        };
        let done = relock(&self.progress).on_resolved();
        if done {
            info!(tier = %self.tier, site = ?self.site, %task, "Terminal decision of episode resolved");
        }
        Some(Resolved { decision, done })
    }

    pub fn contains(&self, task: TaskId) -> bool {
        relock(&self.pending).contains_key(&task)
    }

    pub fn pending_len(&self) -> usize {
        relock(&self.pending).len()
    }

    pub fn progress(&self) -> EpisodeProgress {
        relock(&self.progress).clone()
    }

    /// Fix the expected completion count. Returns true when every expected
    /// decision has already resolved without a terminal one, so the caller
    /// owes the policy a terminal signal.
    pub fn set_expected(&self, expected: usize) -> bool {
        let mut progress = relock(&self.progress);
        progress.expected = Some(expected);
        !progress.done_emitted && progress.completed >= expected
    }

    /// Take the episode's terminal flag if no resolution has carried it yet.
    pub fn claim_terminal(&self) -> bool {
        let mut progress = relock(&self.progress);
        !std::mem::replace(&mut progress.done_emitted, true)
    }

    /// Drop a pending decision whose task will never run. Does not count as
    /// a resolution.
    pub fn discard(&self, task: TaskId) -> Option<PendingDecision> {
        let decision = relock(&self.pending).remove(&task);
        if decision.is_some() {
            debug!(tier = %self.tier, %task, "Pending decision withdrawn");
        }
        decision
    }

    /// Mark the episode as ending; the next resolution is terminal.
    pub fn signal_ending(&self) {
        relock(&self.progress).ending = true;
    }

    /// Start a new episode. Anything still pending is discarded.
    pub fn reset_episode(&self, expected: Option<usize>) {
        let dropped = {
            let mut pending = relock(&self.pending);
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            warn!(tier = %self.tier, site = ?self.site, dropped, "Discarding unresolved decisions");
        }
        *relock(&self.progress) = EpisodeProgress {
            expected,
            ..EpisodeProgress::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(task: u64, action: usize) -> PendingDecision {
        PendingDecision {
            task: TaskObservation::new(TaskId(task), 1000.0),
            tier: Tier::Global,
            site: Some(SiteId(action)),
            state: vec![0.0; 3],
            action,
            decided_at: 10.0,
            system_usage: Usage::default(),
            target_usage: Usage::default(),
            log_prob: -0.7,
            value: 0.0,
        }
    }

    #[test]
    fn resolves_exactly_once() {
        let ctx = Arc::new(RunContext::new());
        let t = DecisionTracker::global(ctx.clone());
        t.record(decision(1, 2));
        assert!(t.contains(TaskId(1)));

        let r = t.resolve(TaskId(1)).unwrap();
        assert_eq!(r.decision.action, 2);
        assert!(t.resolve(TaskId(1)).is_none());
        assert_eq!(ctx.count(Counter::MissingCompletions), 1);
        assert_eq!(t.progress().completed, 1);
    }

    #[test]
    fn duplicate_overwrites_and_counts() {
        let ctx = Arc::new(RunContext::new());
        let t = DecisionTracker::global(ctx.clone());
        t.record(decision(4, 0));
        t.record(decision(4, 1));
        assert_eq!(t.pending_len(), 1);
        assert_eq!(ctx.count(Counter::DuplicateDecisions), 1);
        assert_eq!(t.resolve(TaskId(4)).unwrap().decision.action, 1);
    }

    #[test]
    fn done_when_expected_reached_once() {
        let t = DecisionTracker::local(SiteId(0), Arc::new(RunContext::new()));
        t.reset_episode(Some(2));
        for task in 0..3 {
            t.record(decision(task, 0));
        }
        assert!(!t.resolve(TaskId(0)).unwrap().done);
        assert!(t.resolve(TaskId(1)).unwrap().done);
        assert!(!t.resolve(TaskId(2)).unwrap().done);
    }

    #[test]
    fn ending_signal_marks_next_resolution() {
        let t = DecisionTracker::global(Arc::new(RunContext::new()));
        t.record(decision(1, 0));
        t.record(decision(2, 0));
        assert!(!t.resolve(TaskId(1)).unwrap().done);
        t.signal_ending();
        assert!(t.resolve(TaskId(2)).unwrap().done);
    }

    #[test]
    fn late_expected_count_reports_owed_terminal() {
        let t = DecisionTracker::local(SiteId(1), Arc::new(RunContext::new()));
        t.record(decision(1, 0));
        assert!(!t.resolve(TaskId(1)).unwrap().done);

        assert!(t.set_expected(1));
        assert!(t.claim_terminal());
        assert!(!t.claim_terminal());
        assert!(!t.set_expected(1));
    }

    #[test]
    fn expected_count_not_yet_reached_owes_nothing() {
        let t = DecisionTracker::global(Arc::new(RunContext::new()));
        t.record(decision(1, 0));
        t.record(decision(2, 0));
        t.resolve(TaskId(1));
        assert!(!t.set_expected(2));
        assert!(t.resolve(TaskId(2)).unwrap().done);
        assert!(!t.claim_terminal());
    }

    #[test]
    fn discard_does_not_count_as_resolution() {
        let ctx = Arc::new(RunContext::new());
        let t = DecisionTracker::global(ctx.clone());
        t.record(decision(6, 1));
        assert_eq!(t.discard(TaskId(6)).map(|d| d.action), Some(1));
        assert!(t.discard(TaskId(6)).is_none());
        assert_eq!(t.pending_len(), 0);
        assert_eq!(t.progress().completed, 0);
        assert_eq!(ctx.count(Counter::MissingCompletions), 0);
    }

    #[test]
    fn reset_clears_pending_and_progress() {
        let t = DecisionTracker::global(Arc::new(RunContext::new()));
        t.record(decision(1, 0));
        t.signal_ending();
        t.reset_episode(Some(5));
        assert_eq!(t.pending_len(), 0);
        let p = t.progress();
        assert_eq!(p.expected, Some(5));
        assert!(!p.ending);
        assert_eq!(p.completed, 0);
    }

    #[test]
    fn concurrent_resolution_yields_one_winner() {
        let t = Arc::new(DecisionTracker::global(Arc::new(RunContext::new())));
        t.record(decision(9, 1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = t.clone();
                std::thread::spawn(move || t.resolve(TaskId(9)).is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
