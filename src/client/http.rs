//! Reqwest-based client for the content service.
//!
//! Implements [`MaterialAccessGate`] and [`MaterialCatalog`] over two JSON
//! endpoints:
//! ```text
//! GET /internal/materials/{id}/access?user_id={user}  -> {"allowed": bool}
//! GET /internal/materials/{id}                        -> MaterialInfo | 404
//! ```

use crate::config::ContentServiceConfig;
use crate::policy::access::{MaterialAccessGate, MaterialCatalog};
use crate::protocol::models::MaterialInfo;
use crate::OfflineError;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use uuid::Uuid;

/// Access check response body.
#[derive(Debug, Deserialize)]
struct AccessResponse {
    allowed: bool,
}

/// Content service HTTP client.
pub struct ContentServiceClient {
    client: Client,
    base_url: String,
    user_agent: String,
    service_token: Option<String>,
}

impl ContentServiceClient {
    /// Create a client from config.
    pub fn new(config: &ContentServiceConfig) -> Result<Self, OfflineError> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OfflineError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            user_agent: build_user_agent(config),
            service_token: config.service_token.clone(),
        })
    }

    /// URL of the access check for a material.
    pub fn access_url(&self, user_id: Uuid, material_id: Uuid) -> String {
        format!(
            "{}/internal/materials/{}/access?user_id={}",
            self.base_url, material_id, user_id
        )
    }

    /// URL of a material's metadata.
    pub fn material_url(&self, material_id: Uuid) -> String {
        format!("{}/internal/materials/{}", self.base_url, material_id)
    }

    async fn fetch(&self, url: &str) -> Result<reqwest::Response, OfflineError> {
        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/json");
        if let Some(ref token) = self.service_token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .map_err(|e| OfflineError::Upstream(format!("Request failed: {}", e)))
    }
}

#[async_trait]
impl MaterialAccessGate for ContentServiceClient {
    async fn check_access(&self, user_id: Uuid, material_id: Uuid) -> Result<bool, OfflineError> {
        let response = self.fetch(&self.access_url(user_id, material_id)).await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => return Ok(false),
            s if !s.is_success() => {
                return Err(OfflineError::Upstream(format!(
                    "access check returned {}",
                    s
                )))
            }
            _ => {}
        }

        let body: AccessResponse = response
            .json()
            .await
            .map_err(|e| OfflineError::Protocol(format!("Invalid access response: {}", e)))?;
        Ok(body.allowed)
    }
}

#[async_trait]
impl MaterialCatalog for ContentServiceClient {
    async fn get(&self, material_id: Uuid) -> Result<Option<MaterialInfo>, OfflineError> {
        let response = self.fetch(&self.material_url(material_id)).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(OfflineError::Upstream(format!(
                "material lookup returned {}",
                response.status()
            )));
        }

        let info: MaterialInfo = response
            .json()
            .await
            .map_err(|e| OfflineError::Protocol(format!("Invalid material response: {}", e)))?;
        Ok(Some(info))
    }
}

/// Build a User-Agent string from config.
///
/// Format: `<product> offline-warden/<version>`
pub fn build_user_agent(config: &ContentServiceConfig) -> String {
    format!(
        "{} offline-warden/{}",
        config.user_agent_product,
        env!("CARGO_PKG_VERSION")
    )
}
