use std::sync::{Arc, Mutex, PoisonError};

use greensched_core::{Counter, RunContext};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, warn};

use crate::error::OracleError;
use crate::types::{ActionRequest, ActionResponse, EpisodeMetrics, Experience};
use crate::Oracle;

/// An action together with how it was obtained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub response: ActionResponse,
    /// True when the oracle failed and a uniform-random action was used.
    pub degraded: bool,
}

/// Wraps an [`Oracle`] so that no call ever fails the run.
///
/// Action requests that fail fall back to a uniform-random action with
/// zero log-probability and value. Every other call logs its error and
/// counts it in the run context.
pub struct ResilientOracle {
    inner: Arc<dyn Oracle>,
    ctx: Arc<RunContext>,
    rng: Mutex<StdRng>,
}

impl ResilientOracle {
    pub fn new(inner: Arc<dyn Oracle>, ctx: Arc<RunContext>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            inner,
            ctx,
            rng: Mutex::new(rng),
        }
    }

    pub fn inner(&self) -> &Arc<dyn Oracle> {
        &self.inner
    }

    /// Ask the oracle, falling back to a random action on any failure.
    ///
    /// Fails only when there is nothing to choose from.
    pub fn decide(&self, request: &ActionRequest) -> Result<Decision, OracleError> {
        if request.action_count == 0 {
            return Err(OracleError::EmptyActionSpace);
        }
        match self.inner.select_action(request) {
            Ok(response) => Ok(Decision {
                response,
                degraded: false,
            }),
            Err(e) => {
                let action = self
                    .rng
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .gen_range(0..request.action_count);
                self.ctx.record(Counter::DegradedOracleCalls);
                warn!(
                    tier = %request.tier,
                    error = %e,
                    action,
                    "Oracle unavailable, using random action"
                );
                Ok(Decision {
                    response: ActionResponse {
                        action: action as i64,
                        log_prob: 0.0,
                        value: 0.0,
                    },
                    degraded: true,
                })
            }
        }
    }

    /// Submit an experience; returns whether the oracle accepted it.
    pub fn submit(&self, experience: &Experience) -> bool {
        self.report("store_experience", self.inner.store_experience(experience))
    }

    pub fn start_episode(&self) -> bool {
        self.report("start_episode", self.inner.start_episode())
    }

    pub fn end_episode(&self) -> bool {
        self.report("end_episode", self.inner.end_episode())
    }

    pub fn log_episode_metrics(&self, metrics: &EpisodeMetrics) -> bool {
        self.report("log_episode_metrics", self.inner.log_episode_metrics(metrics))
    }

    pub fn trigger_train(&self) -> bool {
        self.report("trigger_train", self.inner.trigger_train())
    }

    fn report(&self, call: &'static str, result: Result<(), OracleError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                self.ctx.record(Counter::SubmissionFailures);
                error!(call, error = %e, "Oracle call failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greensched_core::SiteId;

    struct Down;

    impl Oracle for Down {
        fn select_action(&self, _: &ActionRequest) -> Result<ActionResponse, OracleError> {
            Err(OracleError::Parse("down".into()))
        }
        fn store_experience(&self, _: &Experience) -> Result<(), OracleError> {
            Err(OracleError::Parse("down".into()))
        }
        fn start_episode(&self) -> Result<(), OracleError> {
            Err(OracleError::Parse("down".into()))
        }
        fn end_episode(&self) -> Result<(), OracleError> {
            Ok(())
        }
        fn log_episode_metrics(&self, _: &EpisodeMetrics) -> Result<(), OracleError> {
            Ok(())
        }
        fn health(&self) -> Result<(), OracleError> {
            Err(OracleError::Parse("down".into()))
        }
    }

    struct Fixed(i64);

    impl Oracle for Fixed {
        fn select_action(&self, _: &ActionRequest) -> Result<ActionResponse, OracleError> {
            Ok(ActionResponse {
                action: self.0,
                log_prob: -1.2,
                value: 0.3,
            })
        }
        fn store_experience(&self, _: &Experience) -> Result<(), OracleError> {
            Ok(())
        }
        fn start_episode(&self) -> Result<(), OracleError> {
            Ok(())
        }
        fn end_episode(&self) -> Result<(), OracleError> {
            Ok(())
        }
        fn log_episode_metrics(&self, _: &EpisodeMetrics) -> Result<(), OracleError> {
            Ok(())
        }
        fn health(&self) -> Result<(), OracleError> {
            Ok(())
        }
    }

    #[test]
    fn healthy_oracle_passes_through() {
        let ctx = Arc::new(RunContext::new());
        let o = ResilientOracle::new(Arc::new(Fixed(2)), ctx.clone(), Some(1));
        let d = o.decide(&ActionRequest::global(vec![0.0; 4], 3)).unwrap();
        assert!(!d.degraded);
        assert_eq!(d.response.action, 2);
        assert_eq!(d.response.log_prob, -1.2);
        assert_eq!(ctx.count(Counter::DegradedOracleCalls), 0);
    }

    #[test]
    fn failure_falls_back_to_action_in_range() {
        let ctx = Arc::new(RunContext::new());
        let o = ResilientOracle::new(Arc::new(Down), ctx.clone(), Some(42));
        for _ in 0..50 {
            let d = o.decide(&ActionRequest::local(SiteId(1), vec![0.0; 3], 5)).unwrap();
            assert!(d.degraded);
            assert!((0..5).contains(&d.response.action));
            assert_eq!(d.response.log_prob, 0.0);
            assert_eq!(d.response.value, 0.0);
        }
        assert_eq!(ctx.count(Counter::DegradedOracleCalls), 50);
    }

    #[test]
    fn fallback_is_reproducible_with_seed() {
        let ctx = Arc::new(RunContext::new());
        let a = ResilientOracle::new(Arc::new(Down), ctx.clone(), Some(9));
        let b = ResilientOracle::new(Arc::new(Down), ctx, Some(9));
        let req = ActionRequest::global(vec![], 10);
        for _ in 0..20 {
            assert_eq!(
                a.decide(&req).unwrap().response.action,
                b.decide(&req).unwrap().response.action
            );
        }
    }

    #[test]
    fn empty_action_space_is_an_error() {
        let o = ResilientOracle::new(Arc::new(Fixed(0)), Arc::new(RunContext::new()), None);
        assert!(matches!(
            o.decide(&ActionRequest::global(vec![], 0)),
            Err(OracleError::EmptyActionSpace)
        ));
    }

    #[test]
    fn failed_submissions_are_counted() {
        let ctx = Arc::new(RunContext::new());
        let o = ResilientOracle::new(Arc::new(Down), ctx.clone(), Some(0));
        assert!(!o.start_episode());
        assert!(o.end_episode());
        let exp = Experience {
            tier: greensched_core::Tier::Global,
            site: None,
            state: vec![],
            action: 0,
            reward: 0.0,
            next_state: vec![],
            done: false,
            log_prob: 0.0,
            value: 0.0,
        };
        assert!(!o.submit(&exp));
        assert_eq!(ctx.count(Counter::SubmissionFailures), 2);
    }
}
