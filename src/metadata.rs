// System
use std::time::Duration;

// Third Party
use async_trait::async_trait;
use reqwest::{header::ACCEPT, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

/// Base URL of the link-local Linode Metadata Service.
const METADATA_BASE_URL: &str = "http://169.254.169.254";

/// Lifetime requested for metadata service tokens, in seconds.
const TOKEN_EXPIRY_SECONDS: u64 = 3600;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// One immutable observation of the instance metadata backing this node.
///
/// Field-wise equality is what drives change detection in the watcher: two
/// snapshots are the same instance state iff every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceSnapshot {
    pub id: u64,
    pub label: String,
    pub region: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub host_uuid: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("metadata service returned unexpected status {status} for {endpoint}")]
    UnexpectedStatus {
        endpoint: &'static str,
        status: StatusCode,
    },
    #[error("failed to obtain metadata token: {0}")]
    Token(String),
}

/// Capability to fetch the current instance metadata.
///
/// A fetch is a single round trip with no provider-side effects, so it is
/// safe to call repeatedly at whatever cadence the watcher is configured for.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self) -> Result<InstanceSnapshot, MetadataError>;
}

/// Client for the Linode Metadata Service.
///
/// Authenticates with a short-lived token (`PUT /v1/token`) which is cached
/// across fetches and re-acquired once if the service rejects it with a 401.
pub struct LinodeMetadataSource {
    http: reqwest::Client,
    base_url: String,
    token: Mutex<Option<String>>,
}

impl LinodeMetadataSource {
    pub fn new() -> Result<Self, MetadataError> {
        Self::with_base_url(METADATA_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, MetadataError> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        })
    }

    async fn acquire_token(&self) -> Result<String, MetadataError> {
        let response = self
            .http
            .put(format!("{}/v1/token", self.base_url))
            .header(
                "Metadata-Token-Expiry-Seconds",
                TOKEN_EXPIRY_SECONDS.to_string(),
            )
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MetadataError::Token(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let token = response.text().await?;
        if token.is_empty() {
            return Err(MetadataError::Token("token endpoint returned an empty body".to_string()));
        }
        debug!("Acquired a new metadata service token");
        Ok(token)
    }

    async fn get_instance(&self, token: &str) -> Result<reqwest::Response, MetadataError> {
        Ok(self
            .http
            .get(format!("{}/v1/instance", self.base_url))
            .header("Metadata-Token", token)
            .header(ACCEPT, "application/json")
            .send()
            .await?)
    }
}

#[async_trait]
impl MetadataSource for LinodeMetadataSource {
    async fn fetch(&self) -> Result<InstanceSnapshot, MetadataError> {
        let mut cached = self.token.lock().await;
        let token = match cached.as_ref() {
            Some(token) => token.clone(),
            None => {
                let token = self.acquire_token().await?;
                *cached = Some(token.clone());
                token
            }
        };

        let mut response = self.get_instance(&token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            // Token expired; re-acquire once before giving up on this fetch.
            debug!("Metadata token rejected, acquiring a fresh one");
            let token = self.acquire_token().await?;
            *cached = Some(token.clone());
            response = self.get_instance(&token).await?;
        }
        drop(cached);

        if !response.status().is_success() {
            return Err(MetadataError::UnexpectedStatus {
                endpoint: "/v1/instance",
                status: response.status(),
            });
        }
        Ok(response.json::<InstanceSnapshot>().await?)
    }
}
