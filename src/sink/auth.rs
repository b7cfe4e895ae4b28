//! OAuth access tokens for the Cloud Monitoring API.
//!
//! Credentials resolve the way Application Default Credentials do: a service account key file
//! when one is configured or named by `GOOGLE_APPLICATION_CREDENTIALS`, otherwise the default
//! service account of the instance metadata server. Tokens are cached and fetched again shortly
//! before they expire.

use crate::metadata::{AccessToken, MetadataClient};
use anyhow::{anyhow, bail, Context, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const MONITORING_SCOPE: &str = "https://www.googleapis.com/auth/monitoring";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME: Duration = Duration::from_secs(3600);

// Fetch a new token this long before the current one expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// The fields of a downloaded service account JSON key that the token exchange needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    key_type: String,
    client_email: String,
    #[serde(default)]
    private_key_id: Option<String>,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials file {}", path.display()))?;
        let key: ServiceAccountKey = serde_json::from_str(&raw)
            .with_context(|| format!("failed to decode credentials file {}", path.display()))?;

        if key.key_type != "service_account" {
            bail!(
                "credentials file {} has type {:?}, expected \"service_account\"",
                path.display(),
                key.key_type
            );
        }
        Ok(key)
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

enum Provider {
    ServiceAccount {
        key: ServiceAccountKey,
        signing_key: EncodingKey,
        client: reqwest::Client,
    },
    MetadataServer(MetadataClient),
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::ServiceAccount { key, .. } => {
                f.debug_tuple("ServiceAccount").field(key).finish()
            }
            Provider::MetadataServer(client) => {
                f.debug_tuple("MetadataServer").field(client).finish()
            }
        }
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN
    }
}

impl fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Supplies bearer tokens for API calls, refreshing them as they near expiry.
pub struct TokenSource {
    provider: Provider,
    cached: AsyncMutex<Option<CachedToken>>,
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("TokenSource");
        debug.field("provider", &self.provider);
        match self.cached.try_lock() {
            Ok(cached) => debug.field("cached", &*cached),
            Err(_) => debug.field("cached", &"<locked>"),
        };
        debug.finish()
    }
}

impl TokenSource {
    pub fn service_account(key: ServiceAccountKey, request_timeout: Duration) -> Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).with_context(|| {
            format!("invalid private key for service account {}", key.client_email)
        })?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to create token client")?;

        Ok(Self::with_provider(Provider::ServiceAccount {
            key,
            signing_key,
            client,
        }))
    }

    pub fn metadata_server(client: MetadataClient) -> Self {
        Self::with_provider(Provider::MetadataServer(client))
    }

    fn with_provider(provider: Provider) -> Self {
        Self {
            provider,
            cached: AsyncMutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<String> {
        let mut guard = self.cached.lock().await;
        if let Some(token) = guard.as_ref().filter(|token| token.is_fresh()) {
            return Ok(token.value.clone());
        }

        let fresh = match &self.provider {
            Provider::ServiceAccount {
                key,
                signing_key,
                client,
            } => exchange_assertion(client, key, signing_key)
                .await
                .with_context(|| {
                    format!(
                        "failed to fetch access token for service account {}",
                        key.client_email
                    )
                })?,
            Provider::MetadataServer(client) => client
                .access_token()
                .await
                .context("failed to fetch access token from metadata service")?,
        };

        debug!(expires_in = fresh.expires_in, "refreshed access token");
        let value = fresh.access_token;
        *guard = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(fresh.expires_in),
        });
        Ok(value)
    }
}

/// Trade a signed JWT assertion for an access token at the key's token endpoint.
async fn exchange_assertion(
    client: &reqwest::Client,
    key: &ServiceAccountKey,
    signing_key: &EncodingKey,
) -> Result<AccessToken> {
    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the unix epoch")?
        .as_secs();
    let claims = AssertionClaims {
        iss: &key.client_email,
        scope: MONITORING_SCOPE,
        aud: &key.token_uri,
        iat,
        exp: iat + ASSERTION_LIFETIME.as_secs(),
    };

    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();
    let assertion = jsonwebtoken::encode(&header, &claims, signing_key)
        .context("failed to sign token assertion")?;

    let response = client
        .post(&key.token_uri)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
        .send()
        .await
        .with_context(|| format!("token request to {} failed", key.token_uri))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("{} returned {status}: {body}", key.token_uri));
    }

    response
        .json::<AccessToken>()
        .await
        .context("failed to decode access token response")
}
