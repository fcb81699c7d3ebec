use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;

use opsdeck_shared::api::{AgentStats, AgentStatus, ExecuteRequest, ExecuteResult};

use crate::vps_manager::VpsConfig;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    #[error("agent returned http {0}")]
    Http(StatusCode),
    #[error("malformed agent response: {0}")]
    Decode(reqwest::Error),
}

impl AgentError {
    /// Whether the remote should be considered unreachable. Only refused
    /// connections and timeouts count; an agent answering with an error
    /// status or a bad body is reachable.
    pub fn is_transport(&self) -> bool {
        match self {
            AgentError::Transport(err) => err.is_connect() || err.is_timeout(),
            _ => false,
        }
    }
}

/// HTTP client for the agent API. One shared `reqwest::Client` with the
/// connection timeout applied to every request, so an unreachable host can
/// never stall a polling cycle past the deadline.
pub struct AgentClient {
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build http client");
        Self { http }
    }

    fn url(config: &VpsConfig, endpoint: &str) -> String {
        format!("http://{}:{}{}", config.address, config.port, endpoint)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        config: &VpsConfig,
        endpoint: &str,
    ) -> Result<T, AgentError> {
        let response = self
            .http
            .get(Self::url(config, endpoint))
            .header("Authorization", format!("Bearer {}", config.api_key))
            .send()
            .await
            .map_err(AgentError::Transport)?;
        if !response.status().is_success() {
            return Err(AgentError::Http(response.status()));
        }
        response.json::<T>().await.map_err(AgentError::Decode)
    }

    /// `GET /api/status` - liveness and identity check.
    pub async fn status(&self, config: &VpsConfig) -> Result<AgentStatus, AgentError> {
        self.get_json(config, "/api/status").await
    }

    /// `GET /api/stats` - current metrics.
    pub async fn stats(&self, config: &VpsConfig) -> Result<AgentStats, AgentError> {
        self.get_json(config, "/api/stats").await
    }

    /// `POST /api/execute` - run a shell command on the agent.
    pub async fn execute(
        &self,
        config: &VpsConfig,
        command: &str,
    ) -> Result<ExecuteResult, AgentError> {
        let response = self
            .http
            .post(Self::url(config, "/api/execute"))
            .header("Authorization", format!("Bearer {}", config.api_key))
            .json(&ExecuteRequest {
                command: command.to_string(),
            })
            .send()
            .await
            .map_err(AgentError::Transport)?;
        if !response.status().is_success() {
            return Err(AgentError::Http(response.status()));
        }
        response.json::<ExecuteResult>().await.map_err(AgentError::Decode)
    }
}
