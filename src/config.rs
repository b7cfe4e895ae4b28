use crate::tailer::DEFAULT_MAX_READ_BYTES;
use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub tailer: TailerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    pub exporter: ExporterConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TailerConfig {
    pub access_log_path: String,
    #[serde(default = "default_rotation_check_interval_ms")]
    pub rotation_check_interval_ms: u64,
    /// Skip content already on disk at startup (DEFAULT: true)
    /// - true: start from the end of the access log; only lines written after startup count
    /// - false: read the whole file, still subject to the counter's reset time
    #[serde(default = "default_start_at_end")]
    pub start_at_end: bool,
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    #[serde(default = "default_polling_period_ms")]
    pub polling_period_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            polling_period_ms: DEFAULT_POLLING_PERIOD_MS,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExporterConfig {
    /// Cloud Monitoring API base URL, e.g. `https://monitoring.googleapis.com`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Local directory sink, used instead of `endpoint` for development.
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub create_custom_metrics: bool,
    /// Service account JSON key. Falls back to `GOOGLE_APPLICATION_CREDENTIALS`, then to the
    /// metadata server's default service account.
    #[serde(default)]
    pub credentials_file: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetadataConfig {
    #[serde(default = "default_use_metadata_service")]
    pub use_metadata_service: bool,
    #[serde(default)]
    pub default_project_id: String,
    #[serde(default)]
    pub default_instance_name: String,
    #[serde(default)]
    pub default_zone: String,
    #[serde(default = "default_metadata_endpoint")]
    pub metadata_endpoint: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            use_metadata_service: DEFAULT_USE_METADATA_SERVICE,
            default_project_id: String::new(),
            default_instance_name: String::new(),
            default_zone: String::new(),
            metadata_endpoint: DEFAULT_METADATA_ENDPOINT.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Send log output to the local syslog daemon instead of stderr.
    #[serde(default)]
    pub syslog: bool,
}

const DEFAULT_POLLING_PERIOD_MS: u64 = 30_000;
const DEFAULT_ROTATION_CHECK_INTERVAL_MS: u64 = 60_000;
const DEFAULT_START_AT_END: bool = true;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_USE_METADATA_SERVICE: bool = true;
const DEFAULT_METADATA_ENDPOINT: &str = "http://metadata.google.internal";

fn default_polling_period_ms() -> u64 {
    DEFAULT_POLLING_PERIOD_MS
}

fn default_rotation_check_interval_ms() -> u64 {
    DEFAULT_ROTATION_CHECK_INTERVAL_MS
}

fn default_start_at_end() -> bool {
    DEFAULT_START_AT_END
}

fn default_max_read_bytes() -> usize {
    DEFAULT_MAX_READ_BYTES
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_use_metadata_service() -> bool {
    DEFAULT_USE_METADATA_SERVICE
}

fn default_metadata_endpoint() -> String {
    DEFAULT_METADATA_ENDPOINT.to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tailer.access_log_path.trim().is_empty() {
            anyhow::bail!("access_log_path cannot be empty");
        }
        if self.consumer.polling_period_ms == 0 {
            anyhow::bail!("polling_period_ms must be greater than zero");
        }
        if self.tailer.max_read_bytes == 0 {
            anyhow::bail!("max_read_bytes must be greater than zero");
        }

        let has_endpoint = non_blank(&self.exporter.endpoint);
        let has_output_dir = non_blank(&self.exporter.output_dir);

        match (has_endpoint, has_output_dir) {
            (true, false) | (false, true) => {}
            (true, true) => {
                anyhow::bail!("exporter configuration must set only one of endpoint or output_dir")
            }
            (false, false) => {
                anyhow::bail!("exporter configuration requires either endpoint or output_dir")
            }
        }

        if let Some(addr) = &self.metrics.listen_addr {
            addr.parse::<SocketAddr>()
                .map_err(|err| anyhow::anyhow!("invalid metrics listen_addr {addr}: {err}"))?;
        }
        if self.logging.syslog && !cfg!(unix) {
            anyhow::bail!("logging.syslog is only supported on unix platforms");
        }
        Ok(())
    }

    pub fn access_log_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.tailer.access_log_path);
        PathBuf::from(expanded.as_ref())
    }

    pub fn polling_period(&self) -> Duration {
        Duration::from_millis(self.consumer.polling_period_ms)
    }

    pub fn rotation_check_interval(&self) -> Duration {
        Duration::from_millis(self.tailer.rotation_check_interval_ms)
    }

    pub fn metrics_listen_addr(&self) -> Option<SocketAddr> {
        self.metrics
            .listen_addr
            .as_ref()
            .and_then(|addr| addr.parse().ok())
    }
}

impl ExporterConfig {
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint
            .as_ref()
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn output_dir_path(&self) -> Option<PathBuf> {
        self.output_dir
            .as_ref()
            .filter(|dir| !dir.trim().is_empty())
            .map(|dir| {
                let expanded = shellexpand::tilde(dir);
                PathBuf::from(expanded.as_ref())
            })
    }

    pub fn credentials_path(&self) -> Option<PathBuf> {
        self.credentials_file
            .as_ref()
            .filter(|file| !file.trim().is_empty())
            .map(|file| {
                let expanded = shellexpand::tilde(file.trim());
                PathBuf::from(expanded.as_ref())
            })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn non_blank(value: &Option<String>) -> bool {
    value
        .as_ref()
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}
