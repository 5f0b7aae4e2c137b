//! HTTP client for the bridge/auth service.
//!
//! The bridge validates browser tokens and holds the SSH credentials for the
//! local container. Modeled as a trait so the websocket dispatcher can run
//! against a stub in tests.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::agent::config::resolve_api_url;
use crate::agent::error::BridgeError;
use crate::agent::types::{AuthClaims, ContainerInfo};

/// Calls the agent makes against the bridge/auth service.
#[async_trait]
pub trait BridgeApi: Send + Sync {
    /// Ask the auth service whether `token` belongs to a live account.
    async fn validate_token(&self, token: &str) -> Result<AuthClaims, BridgeError>;

    /// Fetch the container's SSH credentials, authorized by the bridge key.
    async fn container_info(&self, bridge_key: &str) -> Result<ContainerInfo, BridgeError>;
}

/// `reqwest`-backed bridge client.
pub struct HttpBridge {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBridge {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Client pointed at the configured bridge endpoint.
    pub fn from_env() -> Self {
        Self::new(resolve_api_url(None))
    }
}

#[async_trait]
impl BridgeApi for HttpBridge {
    async fn validate_token(&self, token: &str) -> Result<AuthClaims, BridgeError> {
        let response = self
            .client
            .post(format!("{}/auth/token", self.base_url))
            .json(&json!({ "token": token }))
            .send()
            .await?
            .error_for_status()?;

        response
            .json::<AuthClaims>()
            .await
            .map_err(|e| BridgeError::Malformed(e.to_string()))
    }

    async fn container_info(&self, bridge_key: &str) -> Result<ContainerInfo, BridgeError> {
        let response = self
            .client
            .get(format!("{}/api/containers/info", self.base_url))
            .header("X-API-KEY", bridge_key)
            .send()
            .await?
            .error_for_status()?;

        response
            .json::<ContainerInfo>()
            .await
            .map_err(|e| BridgeError::Malformed(e.to_string()))
    }
}
