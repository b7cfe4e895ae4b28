//! Wires configuration into a running exporter.

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::counter::{CumulativeCounter, StatusCounter};
use crate::metadata::{self, InstanceMetadata, MetadataClient};
use crate::sink::auth::CREDENTIALS_ENV;
use crate::sink::{
    CloudMonitoringSink, FileWriter, MetricSink, MonitoredResource, ServiceAccountKey,
    TokenSource,
};
use crate::tailer::{FileTailer, TailerOptions};
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Run the exporter until Ctrl+C or a fatal error.
pub async fn run(config: &Config) -> Result<()> {
    info!("access-log-exporter starting");

    let access_log_path = config.access_log_path();
    let tailer = FileTailer::new(&access_log_path, tailer_options(config))
        .await
        .with_context(|| format!("could not open access log {}", access_log_path.display()))?;

    let metadata_client = MetadataClient::new(&config.metadata.metadata_endpoint)?;
    let instance = metadata::resolve(&config.metadata, &metadata_client)
        .await
        .context("could not resolve instance metadata")?;

    let sink = build_metric_sink(config, &instance, metadata_client)?;
    let counter = StatusCounter::new(instance.project_id.clone(), sink);

    if config.exporter.create_custom_metrics {
        counter
            .create_descriptor()
            .await
            .context("could not create custom metric descriptor")?;
        info!("created custom metric descriptor");
    }

    let stop = CancellationToken::new();
    let mut aggregator =
        Aggregator::with_stop_token(config.polling_period(), tailer, counter, stop.clone());

    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed while waiting for shutdown signal");
            return;
        }
        info!("shutdown signal received");
        stop.cancel();
    });

    info!(
        path = %access_log_path.display(),
        project_id = %instance.project_id,
        epoch = %aggregator.counter().epoch(),
        "access-log-exporter started"
    );

    let result = aggregator.run().await;
    info!(counters = ?aggregator.counter().snapshot(), "final status code counters");
    result
}

fn tailer_options(config: &Config) -> TailerOptions {
    TailerOptions {
        rotation_check_interval: config.rotation_check_interval(),
        start_at_end: config.tailer.start_at_end,
        max_read_bytes: config.tailer.max_read_bytes,
    }
}

/// Build the metric sink selected by configuration.
///
/// Returns either a CloudMonitoringSink (for `endpoint`) or FileWriter (for `output_dir`).
pub fn build_metric_sink(
    config: &Config,
    instance: &InstanceMetadata,
    metadata_client: MetadataClient,
) -> Result<Arc<dyn MetricSink>> {
    if let Some(endpoint) = config.exporter.endpoint() {
        let tokens = token_source(config, metadata_client)?;
        let resource = MonitoredResource::gce_instance(instance.resource_labels.clone());
        let sink = CloudMonitoringSink::new(
            &endpoint,
            resource,
            tokens,
            config.exporter.request_timeout(),
        )?;

        info!(endpoint = %endpoint, "configured Cloud Monitoring sink");
        Ok(Arc::new(sink))
    } else {
        let output_dir = config
            .exporter
            .output_dir_path()
            .ok_or_else(|| {
                anyhow!("exporter configuration requires either endpoint or output_dir")
            })?;

        info!(
            output_dir = %output_dir.display(),
            "configured local file output sink"
        );

        Ok(Arc::new(FileWriter::new(output_dir)))
    }
}

/// Pick credentials in Application Default Credentials order: the configured key file, the key
/// file named by `GOOGLE_APPLICATION_CREDENTIALS`, then the metadata server.
fn token_source(config: &Config, metadata_client: MetadataClient) -> Result<TokenSource> {
    let key_path = config.exporter.credentials_path().or_else(|| {
        std::env::var_os(CREDENTIALS_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    });

    let Some(key_path) = key_path else {
        info!("using metadata server credentials");
        return Ok(TokenSource::metadata_server(metadata_client));
    };

    let key = ServiceAccountKey::from_file(&key_path)?;
    info!(
        credentials = %key_path.display(),
        client_email = %key.client_email(),
        "using service account credentials"
    );
    TokenSource::service_account(key, config.exporter.request_timeout())
}
