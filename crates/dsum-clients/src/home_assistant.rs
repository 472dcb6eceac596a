//! Home Assistant REST client.
//!
//! Covers the small slice of the REST API the pipeline needs: reading an
//! entity's state, calling services (camera snapshots, file-backed camera
//! updates) and firing events on the bus.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::providers::CameraPlatform;

/// Configuration for the Home Assistant client.
#[derive(Debug, Clone)]
pub struct HomeAssistantConfig {
    /// Base URL, e.g. `http://homeassistant.local:8123`
    pub base_url: String,
    /// Long-lived access token
    pub token: String,
    pub timeout: Duration,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8123".to_string(),
            token: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl HomeAssistantConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("HA_BASE_URL").unwrap_or_else(|_| "http://localhost:8123".to_string()),
            token: std::env::var("HA_TOKEN")
                .or_else(|_| std::env::var("SUPERVISOR_TOKEN"))
                .unwrap_or_default(),
            timeout: Duration::from_secs(
                std::env::var("HA_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

/// Entity state as returned by `GET /api/states/<entity_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default)]
    pub last_changed: Option<String>,
}

/// Client for the Home Assistant REST API.
pub struct HomeAssistantClient {
    http: Client,
    config: HomeAssistantConfig,
}

impl HomeAssistantClient {
    pub fn new(config: HomeAssistantConfig) -> ClientResult<Self> {
        if config.token.trim().is_empty() {
            return Err(ClientError::invalid_input("Home Assistant token is required"));
        }
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ClientError::Network)?;

        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> ClientResult<Self> {
        Self::new(HomeAssistantConfig::from_env())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Current state of an entity.
    pub async fn get_state(&self, entity_id: &str) -> ClientResult<EntityState> {
        let url = self.url(&format!("/api/states/{}", entity_id));
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Call `domain.service` with a JSON body.
    pub async fn call_service(&self, domain: &str, service: &str, data: &Value) -> ClientResult<()> {
        let url = self.url(&format!("/api/services/{}/{}", domain, service));
        debug!(domain, service, "Calling service");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(data)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }

    /// Fire an event on the bus.
    pub async fn fire_event(&self, event_type: &str, data: &Value) -> ClientResult<()> {
        let url = self.url(&format!("/api/events/{}", event_type));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(data)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl CameraPlatform for HomeAssistantClient {
    async fn snapshot(&self, camera_entity_id: &str, destination: &str) -> ClientResult<()> {
        self.call_service(
            "camera",
            "snapshot",
            &json!({"entity_id": camera_entity_id, "filename": destination}),
        )
        .await
    }

    async fn point_camera(&self, camera_entity_id: &str, file_path: &str) -> ClientResult<()> {
        self.call_service(
            "local_file",
            "update_file_path",
            &json!({"entity_id": camera_entity_id, "file_path": file_path}),
        )
        .await
    }
}

async fn check_status(response: reqwest::Response) -> ClientResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    warn!(status = %status, "Home Assistant request failed");
    if status.is_server_error() {
        Err(ClientError::ServiceUnavailable(format!("Home Assistant returned {}: {}", status, body)))
    } else {
        Err(ClientError::request_failed(format!("Home Assistant returned {}: {}", status, body)))
    }
}
