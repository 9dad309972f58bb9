//! Two-tier green-aware scheduling: state encoding, pending-decision
//! tracking, reward resolution and the coordinator that ties them to the
//! external policy.

pub mod coordinator;
pub mod engine;
pub mod error;
pub mod features;
pub mod normalizer;
pub mod reward;
pub mod reward_scale;
pub mod tracker;

pub use coordinator::{EpisodeSummary, HierarchicalScheduler};
pub use engine::{CompletionEvent, CompletionSender, EngineView, HostObservation, SiteObservation, TaskObservation};
pub use error::SchedulerError;
pub use features::{FeatureInput, FeatureSet, GlobalFeatures, LocalFeatures};
pub use normalizer::{FeatureKind, FeatureStat, StateNormalizer};
pub use reward::{EmaBaseline, GlobalReward, LocalReward, RewardInput, RewardStrategy};
pub use reward_scale::RewardNormalizer;
pub use tracker::{DecisionTracker, EpisodeProgress, PendingDecision, Resolved};
