use super::{format_timestamp, CumulativePoint, MetricDescriptor, MetricSink};
use crate::metrics::record_sink_call;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Local sink writing one JSON document per call into `output_dir`.
#[derive(Debug, Clone)]
pub struct FileWriter {
    output_dir: PathBuf,
}

impl FileWriter {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn persist<T: Serialize>(&self, filename: String, document: &T) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir).await.with_context(|| {
            format!("failed to create directory {}", self.output_dir.display())
        })?;

        let final_path = self.output_dir.join(&filename);
        let temp_path = self
            .output_dir
            .join(format!("{}.{}.tmp", filename, Uuid::new_v4()));

        let serialized = serde_json::to_vec_pretty(document)
            .context("failed to encode document for file output")?;

        fs::write(&temp_path, &serialized)
            .await
            .with_context(|| format!("failed to write {}", temp_path.display()))?;

        fs::rename(&temp_path, &final_path).await.with_context(|| {
            format!(
                "failed to rename {} to {}",
                temp_path.display(),
                final_path.display()
            )
        })?;

        Ok(final_path)
    }

    async fn write_points(&self, project: &str, points: &[CumulativePoint]) -> Result<()> {
        if points.is_empty() {
            return Err(anyhow!("cannot write empty time series batch"));
        }

        let end_millis = points
            .iter()
            .map(|point| point.end.timestamp_millis())
            .max()
            .unwrap_or_default();
        let document = PersistedTimeSeries {
            project,
            points: points.iter().map(PersistedPoint::from).collect(),
        };

        let output = self
            .persist(format!("{}_{}.json", end_millis, Uuid::new_v4()), &document)
            .await?;
        debug!(
            points = points.len(),
            output = %output.display(),
            "persisted time series to local sink"
        );
        Ok(())
    }
}

#[async_trait]
impl MetricSink for FileWriter {
    async fn create_metric_descriptor(
        &self,
        project: &str,
        descriptor: &MetricDescriptor,
    ) -> Result<()> {
        let document = PersistedDescriptor {
            project,
            descriptor,
        };
        let result = self
            .persist(format!("descriptor_{}.json", Uuid::new_v4()), &document)
            .await
            .map(|output| {
                debug!(output = %output.display(), "persisted metric descriptor to local sink");
            });
        record_sink_call("create_metric_descriptor", &result);
        result
    }

    async fn write_time_series(&self, project: &str, points: &[CumulativePoint]) -> Result<()> {
        let result = self.write_points(project, points).await;
        record_sink_call("write_time_series", &result);
        result
    }
}

#[derive(Serialize)]
struct PersistedDescriptor<'a> {
    project: &'a str,
    descriptor: &'a MetricDescriptor,
}

#[derive(Serialize)]
struct PersistedTimeSeries<'a> {
    project: &'a str,
    points: Vec<PersistedPoint<'a>>,
}

#[derive(Serialize)]
struct PersistedPoint<'a> {
    metric_type: &'a str,
    labels: BTreeMap<&'a str, &'a str>,
    value: u64,
    start_time: String,
    end_time: String,
}

impl<'a> From<&'a CumulativePoint> for PersistedPoint<'a> {
    fn from(point: &'a CumulativePoint) -> Self {
        Self {
            metric_type: &point.metric_type,
            labels: BTreeMap::from([(point.label_key.as_str(), point.category.as_str())]),
            value: point.value,
            start_time: format_timestamp(&point.start),
            end_time: format_timestamp(&point.end),
        }
    }
}
