//! Instance metadata discovery.
//!
//! Resolves the project id and monitored-resource labels either from the instance metadata
//! server or from configured defaults, and serves OAuth access tokens for the instance's default
//! service account.

use crate::config::MetadataConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR: &str = "Google";
const METADATA_PATH_PREFIX: &str = "computeMetadata/v1";
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity of the process for the metrics backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceMetadata {
    pub project_id: String,
    pub resource_labels: BTreeMap<String, String>,
}

impl InstanceMetadata {
    pub fn new(project_id: &str, instance_name: &str, zone: &str) -> Self {
        let resource_labels = BTreeMap::from([
            ("instance_id".to_string(), instance_name.to_string()),
            ("zone".to_string(), zone.to_string()),
        ]);
        Self {
            project_id: project_id.to_string(),
            resource_labels,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone)]
pub struct MetadataClient {
    client: reqwest::Client,
    endpoint: String,
}

impl MetadataClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to create metadata client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.endpoint, METADATA_PATH_PREFIX, path)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR)
            .send()
            .await
            .with_context(|| format!("metadata request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("metadata request to {url} was rejected"))?;
        Ok(response)
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let text = self
            .get(path)
            .await?
            .text()
            .await
            .with_context(|| format!("failed to read metadata value {path}"))?;
        Ok(text.trim().to_string())
    }

    /// Whether a metadata server answers at all.
    pub async fn is_available(&self) -> bool {
        let url = self.url("");
        match self
            .client
            .get(&url)
            .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR)
            .timeout(AVAILABILITY_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(error = %err, url = %url, "metadata server unavailable");
                false
            }
        }
    }

    pub async fn project_id(&self) -> Result<String> {
        self.get_text("project/project-id").await
    }

    pub async fn instance_name(&self) -> Result<String> {
        self.get_text("instance/name").await
    }

    pub async fn zone(&self) -> Result<String> {
        let raw = self.get_text("instance/zone").await?;
        Ok(zone_from_path(&raw).to_string())
    }

    pub async fn access_token(&self) -> Result<AccessToken> {
        self.get("instance/service-accounts/default/token")
            .await?
            .json::<AccessToken>()
            .await
            .context("failed to decode metadata access token")
    }
}

/// The zone arrives as `projects/<number>/zones/<zone>`.
fn zone_from_path(raw: &str) -> &str {
    raw.rsplit('/').next().unwrap_or(raw)
}

/// Resolve project and resource labels from the metadata server or configured defaults.
pub async fn resolve(config: &MetadataConfig, client: &MetadataClient) -> Result<InstanceMetadata> {
    if config.use_metadata_service && client.is_available().await {
        let project_id = client
            .project_id()
            .await
            .context("could not retrieve project ID from metadata service")?;
        let instance_name = client
            .instance_name()
            .await
            .context("could not retrieve instance name from metadata service")?;
        let zone = client
            .zone()
            .await
            .context("could not retrieve zone name from metadata service")?;

        info!(
            project_id = %project_id,
            instance_name = %instance_name,
            zone = %zone,
            "resolved instance metadata from metadata service"
        );
        return Ok(InstanceMetadata::new(&project_id, &instance_name, &zone));
    }

    from_defaults(config)
}

fn from_defaults(config: &MetadataConfig) -> Result<InstanceMetadata> {
    let required = [
        ("default_project_id", &config.default_project_id),
        ("default_instance_name", &config.default_instance_name),
        ("default_zone", &config.default_zone),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            anyhow::bail!("metadata service is disabled or not available, but {name} is not set");
        }
    }

    Ok(InstanceMetadata::new(
        config.default_project_id.trim(),
        config.default_instance_name.trim(),
        config.default_zone.trim(),
    ))
}
