use std::time::Duration;

use greensched_core::config::OracleConfig;
use greensched_core::Tier;
use reqwest::blocking::{Client, Response};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::OracleError;
use crate::types::{broker_id, ActionRequest, ActionResponse, EpisodeMetrics, Experience, ExperienceBody, LocalActionBody};
use crate::Oracle;

/// Blocking HTTP/JSON client for the policy server.
pub struct HttpOracle {
    client: Client,
    base_url: String,
}

impl HttpOracle {
    pub fn new(config: &OracleConfig) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post_json<B: Serialize + ?Sized>(&self, endpoint: &'static str, body: &B) -> Result<Response, OracleError> {
        debug!(endpoint, "Oracle request");
        let response = self.client.post(self.url(endpoint)).json(body).send()?;
        check_status(endpoint, response)
    }

    fn post_empty(&self, endpoint: &'static str) -> Result<(), OracleError> {
        debug!(endpoint, "Oracle request");
        let response = self.client.post(self.url(endpoint)).send()?;
        check_status(endpoint, response).map(|_| ())
    }
}

fn check_status(endpoint: &'static str, response: Response) -> Result<Response, OracleError> {
    let status = response.status().as_u16();
    if !response.status().is_success() {
        let body = response.text().unwrap_or_default();
        return Err(OracleError::Status { endpoint, status, body });
    }
    Ok(response)
}

impl Oracle for HttpOracle {
    fn select_action(&self, request: &ActionRequest) -> Result<ActionResponse, OracleError> {
        let response = match (request.tier, request.site) {
            (Tier::Local, Some(site)) => {
                let body = LocalActionBody {
                    broker_id: broker_id(site),
                    state: request.state.clone(),
                };
                self.post_json("/select_action_local", &body)?
            }
            _ => self.post_json("/select_action", &request.state)?,
        };
        let text = response.text()?;
        serde_json::from_str(&text).map_err(|e| OracleError::Parse(format!("{e}: {text}")))
    }

    fn store_experience(&self, experience: &Experience) -> Result<(), OracleError> {
        let body = ExperienceBody::from(experience);
        let endpoint = match experience.tier {
            Tier::Global => "/store_experience",
            Tier::Local => "/store_experience_local",
        };
        self.post_json(endpoint, &body).map(|_| ())
    }

    fn start_episode(&self) -> Result<(), OracleError> {
        self.post_empty("/start_episode")
    }

    fn end_episode(&self) -> Result<(), OracleError> {
        self.post_empty("/end_episode")
    }

    fn log_episode_metrics(&self, metrics: &EpisodeMetrics) -> Result<(), OracleError> {
        self.post_json("/log_episode_metrics", metrics)?;
        info!(episode = metrics.episode, "Episode metrics sent");
        Ok(())
    }

    fn health(&self) -> Result<(), OracleError> {
        let response = self.client.get(self.url("/health")).send()?;
        check_status("/health", response).map(|_| ())
    }

    fn trigger_train(&self) -> Result<(), OracleError> {
        self.post_empty("/trigger_train")
    }

    fn clear_log(&self) -> Result<(), OracleError> {
        self.post_empty("/clear_log")
    }

    fn load_model(&self, agent_id: &str) -> Result<(), OracleError> {
        self.post_json("/load_model", &serde_json::json!({ "agent_id": agent_id }))
            .map(|_| ())
    }
}
