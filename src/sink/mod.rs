//! Metric sinks accepting descriptor registrations and cumulative time-series writes.

pub mod auth;
pub mod cloud_monitoring;
pub mod file_writer;

pub use auth::{ServiceAccountKey, TokenSource};
pub use cloud_monitoring::{CloudMonitoringSink, MonitoredResource};
pub use file_writer::FileWriter;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Destination for cumulative counter snapshots.
///
/// Calls are made sequentially from the consumer loop. Implementations must not retry: a failed
/// call is reported back and ends the loop.
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn create_metric_descriptor(&self, project: &str, descriptor: &MetricDescriptor)
        -> Result<()>;

    async fn write_time_series(&self, project: &str, points: &[CumulativePoint]) -> Result<()>;
}

#[async_trait]
impl<S: MetricSink + ?Sized> MetricSink for Arc<S> {
    async fn create_metric_descriptor(
        &self,
        project: &str,
        descriptor: &MetricDescriptor,
    ) -> Result<()> {
        (**self).create_metric_descriptor(project, descriptor).await
    }

    async fn write_time_series(&self, project: &str, points: &[CumulativePoint]) -> Result<()> {
        (**self).write_time_series(project, points).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    Cumulative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Int64,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelDescriptor {
    pub key: String,
    pub value_type: ValueType,
    pub description: String,
}

/// Shape of a custom metric as registered with the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDescriptor {
    #[serde(rename = "type")]
    pub metric_type: String,
    pub labels: Vec<LabelDescriptor>,
    pub metric_kind: MetricKind,
    pub value_type: ValueType,
    pub description: String,
}

/// One cumulative value for one category over `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CumulativePoint {
    pub metric_type: String,
    pub label_key: String,
    pub category: String,
    pub value: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub fn project_resource_name(project_id: &str) -> String {
    format!("projects/{project_id}")
}

/// RFC 3339 with nanosecond precision in UTC, as the monitoring API expects.
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}
