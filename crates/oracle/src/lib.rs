//! Client side of the request/response protocol spoken with the external
//! learning policy.

pub mod error;
pub mod fallback;
pub mod http;
pub mod types;

pub use error::OracleError;
pub use fallback::{Decision, ResilientOracle};
pub use http::HttpOracle;
pub use types::*;

/// Transport to the learning policy. Every call blocks until the policy
/// answers or the transport gives up.
pub trait Oracle: Send + Sync {
    /// Ask the policy for an action index.
    fn select_action(&self, request: &ActionRequest) -> Result<ActionResponse, OracleError>;

    /// Hand one resolved (state, action, reward, next state) tuple to the policy.
    fn store_experience(&self, experience: &Experience) -> Result<(), OracleError>;

    fn start_episode(&self) -> Result<(), OracleError>;

    fn end_episode(&self) -> Result<(), OracleError>;

    fn log_episode_metrics(&self, metrics: &EpisodeMetrics) -> Result<(), OracleError>;

    fn health(&self) -> Result<(), OracleError>;

    fn trigger_train(&self) -> Result<(), OracleError> {
        Ok(())
    }

    fn clear_log(&self) -> Result<(), OracleError> {
        Ok(())
    }

    fn load_model(&self, _agent_id: &str) -> Result<(), OracleError> {
        Ok(())
    }
}
