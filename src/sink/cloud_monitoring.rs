use super::auth::TokenSource;
use super::{
    format_timestamp, project_resource_name, CumulativePoint, MetricDescriptor, MetricSink,
};
use crate::metrics::record_sink_call;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_MONITORING_ENDPOINT: &str = "https://monitoring.googleapis.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitoredResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub labels: BTreeMap<String, String>,
}

impl MonitoredResource {
    pub fn gce_instance(labels: BTreeMap<String, String>) -> Self {
        Self {
            resource_type: "gce_instance".to_string(),
            labels,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTimeSeriesRequest<'a> {
    time_series: Vec<TimeSeries<'a>>,
}

#[derive(Serialize)]
struct TimeSeries<'a> {
    metric: Metric<'a>,
    resource: &'a MonitoredResource,
    points: Vec<Point>,
}

#[derive(Serialize)]
struct Metric<'a> {
    #[serde(rename = "type")]
    metric_type: &'a str,
    labels: BTreeMap<&'a str, &'a str>,
}

#[derive(Serialize)]
struct Point {
    interval: TimeInterval,
    value: TypedValue,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TimeInterval {
    start_time: String,
    end_time: String,
}

// INT64 values travel as decimal strings in the JSON API.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TypedValue {
    int64_value: String,
}

/// Writes metric descriptors and time series to the Cloud Monitoring v3 REST API.
pub struct CloudMonitoringSink {
    client: reqwest::Client,
    endpoint: String,
    resource: MonitoredResource,
    tokens: TokenSource,
}

impl CloudMonitoringSink {
    pub fn new(
        endpoint: &str,
        resource: MonitoredResource,
        tokens: TokenSource,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to create Cloud Monitoring client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            resource,
            tokens,
        })
    }

    fn url(&self, project: &str, collection: &str) -> String {
        format!(
            "{}/v3/{}/{}",
            self.endpoint,
            project_resource_name(project),
            collection
        )
    }

    fn build_request<'a>(&'a self, points: &'a [CumulativePoint]) -> CreateTimeSeriesRequest<'a> {
        let time_series = points
            .iter()
            .map(|point| TimeSeries {
                metric: Metric {
                    metric_type: &point.metric_type,
                    labels: BTreeMap::from([(point.label_key.as_str(), point.category.as_str())]),
                },
                resource: &self.resource,
                points: vec![Point {
                    interval: TimeInterval {
                        start_time: format_timestamp(&point.start),
                        end_time: format_timestamp(&point.end),
                    },
                    value: TypedValue {
                        int64_value: point.value.min(i64::MAX as u64).to_string(),
                    },
                }],
            })
            .collect();

        CreateTimeSeriesRequest { time_series }
    }

    async fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<()> {
        let token = self.tokens.token().await?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{url} returned {status}: {body}"));
        }
        Ok(())
    }
}

#[async_trait]
impl MetricSink for CloudMonitoringSink {
    async fn create_metric_descriptor(
        &self,
        project: &str,
        descriptor: &MetricDescriptor,
    ) -> Result<()> {
        let url = self.url(project, "metricDescriptors");
        let result = self.post_json(&url, descriptor).await;
        record_sink_call("create_metric_descriptor", &result);
        result
    }

    async fn write_time_series(&self, project: &str, points: &[CumulativePoint]) -> Result<()> {
        if points.is_empty() {
            return Err(anyhow!("cannot write empty time series batch"));
        }

        let url = self.url(project, "timeSeries");
        let request = self.build_request(points);
        let result = self.post_json(&url, &request).await;
        record_sink_call("write_time_series", &result);
        result
    }
}
