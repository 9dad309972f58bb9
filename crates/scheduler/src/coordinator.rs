use std::sync::Arc;

use greensched_core::{Counter, GreenConfig, RunContext, SiteId, TaskId, Tier};
use greensched_energy::site::system_usage;
use greensched_energy::Site;
use greensched_oracle::{ActionRequest, ActionResponse, EpisodeMetrics, Experience, ResilientOracle};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, warn};

use crate::engine::{CompletionEvent, CompletionSender, EngineView, SiteObservation, TaskObservation};
use crate::error::SchedulerError;
use crate::features::{validate_state, FeatureInput, FeatureSet, GlobalFeatures, LocalFeatures};
use crate::normalizer::StateNormalizer;
use crate::reward::{GlobalReward, LocalReward, RewardInput, RewardStrategy};
use crate::tracker::{DecisionTracker, PendingDecision, Resolved};

/// State encoding and reward for one tier.
struct Pipeline {
    tier: Tier,
    features: Box<dyn FeatureSet>,
    reward: Box<dyn RewardStrategy>,
    normalizer: StateNormalizer,
    reward_sum: f64,
    resolved: usize,
}

impl Pipeline {
    fn state(&mut self, input: &FeatureInput<'_>, ctx: &RunContext) -> Vec<f64> {
        let mut state = self.features.build(input, &mut self.normalizer);
        validate_state(&mut state, self.features.max_abs(), ctx, self.tier);
        state
    }
}

/// End-of-episode report.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeSummary {
    pub metrics: EpisodeMetrics,
    pub local_reward: f64,
    pub resolved_global: usize,
    pub resolved_local: usize,
    /// Decisions still pending when the episode closed.
    pub unresolved: usize,
}

/// Two-tier scheduler: a global decision picks the site, a local decision
/// picks the host inside it. Both tiers share the oracle and the completion
/// channel but keep separate trackers, normalizers and reward strategies.
pub struct HierarchicalScheduler {
    sites: Vec<Site>,
    oracle: ResilientOracle,
    ctx: Arc<RunContext>,
    global_tracker: DecisionTracker,
    local_trackers: Vec<DecisionTracker>,
    global: Pipeline,
    local: Pipeline,
    completions: CompletionSender,
    inbox: UnboundedReceiver<CompletionEvent>,
    /// Global decisions recorded this episode.
    global_assigned: usize,
    /// Local decisions recorded per site this episode.
    assigned: Vec<usize>,
    /// Latest non-terminal experience per tracker, submitted once the next
    /// one arrives or the episode's terminal resolution is known. Slot 0 is
    /// the global tier, slot `i + 1` the local tier of site `i`.
    held: Vec<Option<Experience>>,
    episode_start: f64,
    last_completion: f64,
}

impl HierarchicalScheduler {
    pub fn new(
        sites: Vec<Site>,
        oracle: ResilientOracle,
        config: &GreenConfig,
        ctx: Arc<RunContext>,
    ) -> Result<Self, SchedulerError> {
        if sites.is_empty() {
            return Err(SchedulerError::NoSites);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let local_trackers = sites
            .iter()
            .map(|s| DecisionTracker::local(s.id(), ctx.clone()))
            .collect();

        info!(
            sites = sites.len(),
            green_sites = sites.iter().filter(|s| s.is_green()).count(),
            "Hierarchical scheduler ready"
        );

        Ok(Self {
            global_assigned: 0,
            assigned: vec![0; sites.len()],
            held: vec![None; sites.len() + 1],
            global: Pipeline {
                tier: Tier::Global,
                features: Box::new(GlobalFeatures),
                reward: Box::new(GlobalReward::new(config.reward.global.clone(), ctx.clone())),
                normalizer: StateNormalizer::new(config.normalizer.clone(), ctx.clone()),
                reward_sum: 0.0,
                resolved: 0,
            },
            local: Pipeline {
                tier: Tier::Local,
                features: Box::new(LocalFeatures),
                reward: Box::new(LocalReward::new(config.reward.local.clone(), ctx.clone())),
                normalizer: StateNormalizer::new(config.normalizer.clone(), ctx.clone()),
                reward_sum: 0.0,
                resolved: 0,
            },
            global_tracker: DecisionTracker::global(ctx.clone()),
            local_trackers,
            completions: CompletionSender(tx),
            inbox: rx,
            sites,
            oracle,
            ctx,
            episode_start: 0.0,
            last_completion: 0.0,
        })
    }

    pub fn with_global_features(mut self, features: Box<dyn FeatureSet>) -> Self {
        self.global.features = features;
        self
    }

    pub fn with_local_features(mut self, features: Box<dyn FeatureSet>) -> Self {
        self.local.features = features;
        self
    }

    pub fn with_global_reward(mut self, reward: Box<dyn RewardStrategy>) -> Self {
        self.global.reward = reward;
        self
    }

    pub fn with_local_reward(mut self, reward: Box<dyn RewardStrategy>) -> Self {
        self.local.reward = reward;
        self
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    pub fn global_reward_sum(&self) -> f64 {
        self.global.reward_sum
    }

    pub fn local_reward_sum(&self) -> f64 {
        self.local.reward_sum
    }

    pub fn global_tracker(&self) -> &DecisionTracker {
        &self.global_tracker
    }

    pub fn local_tracker(&self, site: SiteId) -> Option<&DecisionTracker> {
        self.position(site).map(|i| &self.local_trackers[i])
    }

    /// Handle for the engine to report finished tasks.
    pub fn completion_sender(&self) -> CompletionSender {
        self.completions.clone()
    }

    fn position(&self, site: SiteId) -> Option<usize> {
        self.sites.iter().position(|s| s.id() == site)
    }

    fn tracker_at(&self, slot: usize) -> &DecisionTracker {
        match slot {
            0 => &self.global_tracker,
            i => &self.local_trackers[i - 1],
        }
    }

    fn observe_sites(&self, view: &dyn EngineView) -> Vec<SiteObservation> {
        self.sites.iter().map(|s| view.site_observation(s.id())).collect()
    }

    // ── Episode lifecycle ───────────────────────────────────────────

    /// Reset per-episode state and tell the oracle a new episode starts.
    /// Returns the new episode number.
    pub fn begin_episode(&mut self, expected_tasks: Option<usize>, now: f64) -> u64 {
        let stale = self.discard_inbox();
        if stale > 0 {
            warn!(stale, "Dropping completions left over from previous episode");
        }
        self.release_all();

        let episode = self.ctx.advance_episode();
        self.global_tracker.reset_episode(expected_tasks);
        for tracker in &self.local_trackers {
            tracker.reset_episode(None);
        }
        self.global_assigned = 0;
        self.assigned.iter_mut().for_each(|n| *n = 0);
        for pipeline in [&mut self.global, &mut self.local] {
            pipeline.reward_sum = 0.0;
            pipeline.resolved = 0;
        }
        self.episode_start = now;
        self.last_completion = now;

        self.oracle.start_episode();
        info!(episode, expected_tasks = ?expected_tasks, "Episode started");
        episode
    }

    fn discard_inbox(&mut self) -> usize {
        let mut n = 0;
        while self.inbox.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    /// Accrue generation and draw each site's current power up to the
    /// engine clock.
    pub fn advance_energy(&self, view: &dyn EngineView) {
        let now = view.now();
        for site in &self.sites {
            site.tick(now, view.power_draw(site.id()));
        }
    }

    /// Fix every tracker's expected count to the decisions it recorded,
    /// once no more tasks will be submitted. A tier whose decisions all
    /// resolved already gets its held experience released as terminal.
    pub fn finalize_submissions(&mut self) {
        let mut owed = Vec::new();
        if self.global_tracker.set_expected(self.global_assigned) {
            owed.push(0);
        }
        for (i, (tracker, &n)) in self.local_trackers.iter().zip(&self.assigned).enumerate() {
            if tracker.set_expected(n) {
                owed.push(i + 1);
            }
        }
        debug!(global = self.global_assigned, local = ?self.assigned, "Expected completions fixed");
        for slot in owed {
            self.release_terminal(slot);
        }
    }

    /// Forget the global decision of a task that will not be submitted,
    /// e.g. because no host could be chosen for it.
    pub fn withdraw(&mut self, task: TaskId) -> bool {
        if self.global_tracker.discard(task).is_none() {
            return false;
        }
        self.global_assigned = self.global_assigned.saturating_sub(1);
        info!(%task, "Task withdrawn before submission");
        true
    }

    /// Raise the external "episode ending" signal on every tier.
    pub fn signal_episode_end(&self) {
        self.global_tracker.signal_ending();
        for tracker in &self.local_trackers {
            tracker.signal_ending();
        }
    }

    /// Drain outstanding completions, report metrics and close the episode.
    /// Each tier's last held experience is submitted as terminal unless a
    /// resolution already carried the flag.
    pub fn end_episode(&mut self, view: &dyn EngineView) -> EpisodeSummary {
        self.drain_completions(view);
        self.release_all();

        let episode = self.ctx.episode();
        let mut metrics = EpisodeMetrics {
            episode,
            total_reward: self.global.reward_sum,
            makespan: (self.last_completion - self.episode_start).max(0.0),
            ..EpisodeMetrics::default()
        };
        for ledger in self.sites.iter().filter_map(Site::ledger) {
            let s = ledger.snapshot();
            metrics.total_initial += s.initial_stock;
            metrics.green_used += s.cumulative_green_consumed;
            metrics.total_used += s.cumulative_green_consumed + s.cumulative_brown_consumed;
            metrics.total_green_energy_resource += s.initial_stock + s.cumulative_generated;
            metrics.total_surplus += s.cumulative_surplus;
        }
        metrics.green_ratio = ratio(metrics.green_used, metrics.total_used);
        metrics.green_utilization = ratio(metrics.green_used, metrics.total_green_energy_resource);

        let unresolved = self.global_tracker.pending_len()
            + self.local_trackers.iter().map(DecisionTracker::pending_len).sum::<usize>();
        if unresolved > 0 {
            warn!(episode, unresolved, "Episode closed with unresolved decisions");
        }

        self.global.normalizer.log_statistics();
        self.local.normalizer.log_statistics();
        self.oracle.log_episode_metrics(&metrics);
        self.oracle.end_episode();

        info!(
            episode,
            green_ratio = metrics.green_ratio,
            total_reward = metrics.total_reward,
            makespan = metrics.makespan,
            resolved_global = self.global.resolved,
            resolved_local = self.local.resolved,
            "Episode finished"
        );

        EpisodeSummary {
            metrics,
            local_reward: self.local.reward_sum,
            resolved_global: self.global.resolved,
            resolved_local: self.local.resolved,
            unresolved,
        }
    }

    // ── Decisions ───────────────────────────────────────────────────

    /// Pick the site for `task`. `None` leaves the task unassigned.
    pub fn schedule_global(
        &mut self,
        task: &TaskObservation,
        now: f64,
        view: &dyn EngineView,
    ) -> Option<SiteId> {
        let site_obs = self.observe_sites(view);
        let input = FeatureInput {
            now,
            sites: &self.sites,
            site_obs: &site_obs,
            target: None,
            hosts: &[],
            task,
        };
        let state = self.global.state(&input, &self.ctx);
        let request = ActionRequest::global(state, self.sites.len());
        let (action, response) = self.decide(&request, task.id)?;

        let site = self.sites[action].id();
        self.global_tracker.record(PendingDecision {
            task: *task,
            tier: Tier::Global,
            site: Some(site),
            state: request.state,
            action,
            decided_at: now,
            system_usage: system_usage(&self.sites),
            target_usage: self.sites[action].usage(),
            log_prob: response.log_prob,
            value: response.value,
        });
        self.global_assigned += 1;
        debug!(task = %task.id, %site, "Global decision");
        Some(site)
    }

    /// Pick the host inside `site` for `task`. Returns the host index.
    pub fn schedule_local(
        &mut self,
        task: &TaskObservation,
        site: SiteId,
        now: f64,
        view: &dyn EngineView,
    ) -> Option<usize> {
        let Some(pos) = self.position(site) else {
            self.ctx.record(Counter::SkippedDecisions);
            error!(task = %task.id, %site, "Local decision for unknown site");
            return None;
        };
        let site_obs = self.observe_sites(view);
        let hosts = view.hosts(site);
        let input = FeatureInput {
            now,
            sites: &self.sites,
            site_obs: &site_obs,
            target: Some(site),
            hosts: &hosts,
            task,
        };
        let state = self.local.state(&input, &self.ctx);
        let request = ActionRequest::local(site, state, hosts.len());
        let (action, response) = self.decide(&request, task.id)?;

        self.local_trackers[pos].record(PendingDecision {
            task: *task,
            tier: Tier::Local,
            site: Some(site),
            state: request.state,
            action,
            decided_at: now,
            system_usage: system_usage(&self.sites),
            target_usage: self.sites[pos].usage(),
            log_prob: response.log_prob,
            value: response.value,
        });
        self.assigned[pos] += 1;
        debug!(task = %task.id, %site, host = action, "Local decision");
        Some(action)
    }

    /// Query the oracle and range-check its answer.
    fn decide(
        &self,
        request: &ActionRequest,
        task: TaskId,
    ) -> Option<(usize, ActionResponse)> {
        let decision = match self.oracle.decide(request) {
            Ok(d) => d,
            Err(e) => {
                self.ctx.record(Counter::SkippedDecisions);
                error!(tier = %request.tier, %task, error = %e, "No decision possible");
                return None;
            }
        };
        let action = decision.response.action;
        match usize::try_from(action) {
            Ok(a) if a < request.action_count => Some((a, decision.response)),
            _ => {
                self.ctx.record(Counter::SkippedDecisions);
                error!(
                    tier = %request.tier,
                    %task,
                    action,
                    valid = request.action_count,
                    "Action out of range, task left unassigned"
                );
                None
            }
        }
    }

    // ── Experience hand-off ─────────────────────────────────────────

    fn hand_off(&mut self, slot: Option<usize>, experience: Experience) {
        let Some(slot) = slot else {
            self.oracle.submit(&experience);
            return;
        };
        if let Some(previous) = self.held[slot].take() {
            self.oracle.submit(&previous);
        }
        if experience.done {
            self.oracle.submit(&experience);
        } else {
            self.held[slot] = Some(experience);
        }
    }

    fn release_terminal(&mut self, slot: usize) {
        let Some(mut experience) = self.held[slot].take() else {
            return;
        };
        if self.tracker_at(slot).claim_terminal() {
            experience.done = true;
            info!(tier = %experience.tier, site = ?experience.site, "Held experience released as terminal");
        }
        self.oracle.submit(&experience);
    }

    fn release_all(&mut self) {
        for slot in 0..self.held.len() {
            self.release_terminal(slot);
        }
    }

    // ── Completions ─────────────────────────────────────────────────

    /// Resolve every queued completion. Returns the number of tier
    /// resolutions performed.
    pub fn drain_completions(&mut self, view: &dyn EngineView) -> usize {
        let mut resolved = 0;
        while let Ok(event) = self.inbox.try_recv() {
            resolved += self.complete(event, view);
        }
        resolved
    }

    fn complete(&mut self, event: CompletionEvent, view: &dyn EngineView) -> usize {
        let mut resolved = 0;

        if let Some(r) = self.global_tracker.resolve(event.task_id) {
            self.finish(Tier::Global, r, &event, view);
            resolved += 1;
        }

        let local = self
            .local_trackers
            .iter()
            .find(|t| t.contains(event.task_id))
            .and_then(|t| t.resolve(event.task_id));
        if let Some(r) = local {
            self.finish(Tier::Local, r, &event, view);
            resolved += 1;
        }
        resolved
    }

    fn finish(&mut self, tier: Tier, resolved: Resolved, event: &CompletionEvent, view: &dyn EngineView) {
        let Resolved { decision, done } = resolved;
        let task = decision.task.id;

        let completed_at = if event.completed_at < decision.decided_at {
            warn!(
                %tier,
                %task,
                decided_at = decision.decided_at,
                completed_at = event.completed_at,
                "Completion precedes decision, clamping"
            );
            decision.decided_at
        } else {
            event.completed_at
        };
        self.last_completion = self.last_completion.max(completed_at);

        let target_pos = decision.site.and_then(|s| self.position(s));
        let target_now = target_pos.map(|i| self.sites[i].usage()).unwrap_or_default();
        let input = RewardInput {
            pending: &decision,
            completed_at,
            wait_time: event.wait_time,
            exec_time: event.exec_time,
            system_now: system_usage(&self.sites),
            target_now,
        };

        let site_obs = self.observe_sites(view);
        let pipeline = match tier {
            Tier::Global => &mut self.global,
            Tier::Local => &mut self.local,
        };
        let reward = pipeline.reward.compute(&input);

        let hosts = match (tier, decision.site) {
            (Tier::Local, Some(site)) => view.hosts(site),
            _ => Vec::new(),
        };
        let next_input = FeatureInput {
            now: completed_at,
            sites: &self.sites,
            site_obs: &site_obs,
            target: if tier == Tier::Local { decision.site } else { None },
            hosts: &hosts,
            task: &decision.task,
        };
        let next_state = pipeline.state(&next_input, &self.ctx);
        pipeline.reward_sum += reward;
        pipeline.resolved += 1;

        let experience = Experience {
            tier,
            site: if tier == Tier::Local { decision.site } else { None },
            state: decision.state,
            action: decision.action,
            reward,
            next_state,
            done,
            log_prob: decision.log_prob,
            value: decision.value,
        };
        let slot = match tier {
            Tier::Global => Some(0),
            Tier::Local => target_pos.map(|i| i + 1),
        };
        self.hand_off(slot, experience);
        debug!(%tier, %task, reward, done, "Experience recorded");
    }
}

fn ratio(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole
    } else {
        0.0
    }
}
