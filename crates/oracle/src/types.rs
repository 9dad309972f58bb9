use greensched_core::{SiteId, Tier};
use serde::{Deserialize, Serialize};

/// A request for one decision.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub tier: Tier,
    /// Site whose hosts are being chosen from. `None` for global decisions.
    pub site: Option<SiteId>,
    pub state: Vec<f64>,
    /// Number of valid actions; the policy should answer in `0..action_count`.
    pub action_count: usize,
}

impl ActionRequest {
    pub fn global(state: Vec<f64>, action_count: usize) -> Self {
        Self {
            tier: Tier::Global,
            site: None,
            state,
            action_count,
        }
    }

    pub fn local(site: SiteId, state: Vec<f64>, action_count: usize) -> Self {
        Self {
            tier: Tier::Local,
            site: Some(site),
            state,
            action_count,
        }
    }
}

/// The policy's answer. `action` is signed because a misbehaving policy may
/// send anything; range checks happen at the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub action: i64,
    #[serde(default)]
    pub log_prob: f64,
    #[serde(default)]
    pub value: f64,
}

/// One resolved decision ready for training.
#[derive(Debug, Clone, PartialEq)]
pub struct Experience {
    pub tier: Tier,
    pub site: Option<SiteId>,
    pub state: Vec<f64>,
    pub action: usize,
    pub reward: f64,
    pub next_state: Vec<f64>,
    pub done: bool,
    pub log_prob: f64,
    pub value: f64,
}

/// Body of `POST /select_action_local`.
#[derive(Debug, Serialize, Deserialize)]
pub struct LocalActionBody {
    pub broker_id: String,
    pub state: Vec<f64>,
}

/// Body of `POST /store_experience` and `POST /store_experience_local`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExperienceBody {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub broker_id: Option<String>,
    pub state: Vec<f64>,
    pub action: usize,
    pub reward: f64,
    #[serde(rename = "nextState")]
    pub next_state: Vec<f64>,
    pub done: bool,
    pub log_prob: f64,
    pub value: f64,
}

impl From<&Experience> for ExperienceBody {
    fn from(e: &Experience) -> Self {
        Self {
            broker_id: e.site.map(broker_id),
            state: e.state.clone(),
            action: e.action,
            reward: e.reward,
            next_state: e.next_state.clone(),
            done: e.done,
            log_prob: e.log_prob,
            value: e.value,
        }
    }
}

/// Identifier the policy server uses for a site's local agent.
pub fn broker_id(site: SiteId) -> String {
    site.0.to_string()
}

/// Per-episode aggregate sent to `POST /log_episode_metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeMetrics {
    pub episode: u64,
    /// Sum of initial green stock over all green sites, J.
    pub total_initial: f64,
    pub green_used: f64,
    pub total_used: f64,
    /// Green share of all consumption.
    pub green_ratio: f64,
    /// Green consumption over all green energy made available.
    #[serde(rename = "ratio")]
    pub green_utilization: f64,
    pub total_reward: f64,
    /// Initial stock plus everything generated, J.
    pub total_green_energy_resource: f64,
    pub total_surplus: f64,
    pub makespan: f64,
}
