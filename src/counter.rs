//! Cumulative per-status counters anchored at a fixed epoch.

use crate::sink::{
    CumulativePoint, LabelDescriptor, MetricDescriptor, MetricKind, MetricSink, ValueType,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub const STATUS_COUNT_METRIC: &str = "custom.googleapis.com/http_response_count";
pub const STATUS_LABEL: &str = "response_code";
const STATUS_COUNT_DESCRIPTION: &str = "Cumulative count of HTTP responses by status code.";
const STATUS_LABEL_DESCRIPTION: &str = "HTTP status code of the response";

/// Counts observed during one polling period, keyed by category.
pub type DeltaMap = HashMap<String, u64>;

#[async_trait]
pub trait CumulativeCounter: Send + Sync {
    /// Records strictly before this instant are excluded from counting.
    fn epoch(&self) -> DateTime<Utc>;

    async fn merge(&mut self, delta: &DeltaMap) -> Result<()>;

    async fn create_descriptor(&self) -> Result<()>;
}

pub struct StatusCounter<S: MetricSink> {
    project_id: String,
    sink: S,
    epoch: DateTime<Utc>,
    counts: BTreeMap<String, u64>,
}

impl<S: MetricSink> StatusCounter<S> {
    pub fn new(project_id: impl Into<String>, sink: S) -> Self {
        Self::with_epoch(project_id, sink, Utc::now())
    }

    pub fn with_epoch(project_id: impl Into<String>, sink: S, epoch: DateTime<Utc>) -> Self {
        Self {
            project_id: project_id.into(),
            sink,
            epoch,
            counts: BTreeMap::new(),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts.clone()
    }

    pub fn descriptor() -> MetricDescriptor {
        MetricDescriptor {
            metric_type: STATUS_COUNT_METRIC.to_string(),
            labels: vec![LabelDescriptor {
                key: STATUS_LABEL.to_string(),
                value_type: ValueType::String,
                description: STATUS_LABEL_DESCRIPTION.to_string(),
            }],
            metric_kind: MetricKind::Cumulative,
            value_type: ValueType::Int64,
            description: STATUS_COUNT_DESCRIPTION.to_string(),
        }
    }

    fn points(&self, end: DateTime<Utc>) -> Vec<CumulativePoint> {
        self.counts
            .iter()
            .map(|(status, value)| CumulativePoint {
                metric_type: STATUS_COUNT_METRIC.to_string(),
                label_key: STATUS_LABEL.to_string(),
                category: status.clone(),
                value: *value,
                start: self.epoch,
                end,
            })
            .collect()
    }
}

#[async_trait]
impl<S: MetricSink> CumulativeCounter for StatusCounter<S> {
    fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    async fn merge(&mut self, delta: &DeltaMap) -> Result<()> {
        let mut has_delta = false;
        for (status, count) in delta {
            let total = self.counts.entry(status.clone()).or_insert(0);
            *total = total.saturating_add(*count);
            has_delta |= *count > 0;
        }

        if !has_delta {
            debug!("no new responses, skipping push");
            return Ok(());
        }

        let points = self.points(Utc::now());
        self.sink
            .write_time_series(&self.project_id, &points)
            .await
            .with_context(|| format!("failed to write {} time series", points.len()))
    }

    async fn create_descriptor(&self) -> Result<()> {
        self.sink
            .create_metric_descriptor(&self.project_id, &Self::descriptor())
            .await
            .with_context(|| format!("failed to create metric descriptor {STATUS_COUNT_METRIC}"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    /// In-memory sink recording every call.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub pushes: Arc<Mutex<Vec<(String, Vec<CumulativePoint>)>>>,
        pub descriptors: Arc<Mutex<Vec<MetricDescriptor>>>,
        pub fail: bool,
    }

    impl RecordingSink {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn push_count(&self) -> usize {
            self.pushes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MetricSink for RecordingSink {
        async fn create_metric_descriptor(
            &self,
            _project: &str,
            descriptor: &MetricDescriptor,
        ) -> Result<()> {
            if self.fail {
                anyhow::bail!("sink unavailable");
            }
            self.descriptors.lock().unwrap().push(descriptor.clone());
            Ok(())
        }

        async fn write_time_series(
            &self,
            project: &str,
            points: &[CumulativePoint],
        ) -> Result<()> {
            if self.fail {
                anyhow::bail!("sink unavailable");
            }
            self.pushes
                .lock()
                .unwrap()
                .push((project.to_string(), points.to_vec()));
            Ok(())
        }
    }

    fn delta(entries: &[(&str, u64)]) -> DeltaMap {
        entries
            .iter()
            .map(|(status, count)| (status.to_string(), *count))
            .collect()
    }

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn accumulates_and_pushes_full_snapshot() {
        let sink = RecordingSink::default();
        let mut counter = StatusCounter::with_epoch("my-project", sink.clone(), epoch());

        counter.merge(&delta(&[("200", 3), ("500", 1)])).await.unwrap();
        counter.merge(&delta(&[("200", 3), ("500", 1)])).await.unwrap();

        assert_eq!(
            counter.snapshot(),
            BTreeMap::from([("200".to_string(), 6), ("500".to_string(), 2)])
        );
        assert_eq!(sink.push_count(), 2);

        let pushes = sink.pushes.lock().unwrap();
        let (project, points) = &pushes[1];
        assert_eq!(project, "my-project");
        let values: Vec<(&str, u64)> = points
            .iter()
            .map(|point| (point.category.as_str(), point.value))
            .collect();
        assert_eq!(values, vec![("200", 6), ("500", 2)]);
    }

    #[tokio::test]
    async fn snapshot_includes_categories_missing_from_delta() {
        let sink = RecordingSink::default();
        let mut counter = StatusCounter::with_epoch("p", sink.clone(), epoch());

        counter.merge(&delta(&[("404", 2)])).await.unwrap();
        counter.merge(&delta(&[("200", 1)])).await.unwrap();

        let pushes = sink.pushes.lock().unwrap();
        let categories: Vec<&str> = pushes[1]
            .1
            .iter()
            .map(|point| point.category.as_str())
            .collect();
        assert_eq!(categories, vec!["200", "404"]);
    }

    #[tokio::test]
    async fn empty_delta_is_not_pushed() {
        let sink = RecordingSink::default();
        let mut counter = StatusCounter::with_epoch("p", sink.clone(), epoch());
        counter.merge(&delta(&[("200", 1)])).await.unwrap();

        counter.merge(&DeltaMap::new()).await.unwrap();

        assert_eq!(counter.snapshot(), BTreeMap::from([("200".to_string(), 1)]));
        assert_eq!(sink.push_count(), 1);
    }

    #[tokio::test]
    async fn all_zero_delta_merges_without_push() {
        let sink = RecordingSink::default();
        let mut counter = StatusCounter::with_epoch("p", sink.clone(), epoch());

        counter.merge(&delta(&[("301", 0)])).await.unwrap();

        assert_eq!(counter.snapshot(), BTreeMap::from([("301".to_string(), 0)]));
        assert_eq!(sink.push_count(), 0);
    }

    #[tokio::test]
    async fn totals_never_decrease() {
        let sink = RecordingSink::default();
        let mut counter = StatusCounter::with_epoch("p", sink, epoch());
        let mut previous = BTreeMap::new();

        for round in [
            delta(&[("200", 5)]),
            delta(&[("200", 0), ("502", 1)]),
            delta(&[]),
            delta(&[("200", u64::MAX)]),
            delta(&[("200", 1)]),
        ] {
            counter.merge(&round).await.unwrap();
            let current = counter.snapshot();
            for (status, value) in &previous {
                assert!(current[status] >= *value, "{status} decreased");
            }
            previous = current;
        }
        assert_eq!(previous["200"], u64::MAX);
    }

    #[tokio::test]
    async fn points_share_epoch_start_and_push_end() {
        let sink = RecordingSink::default();
        let mut counter = StatusCounter::with_epoch("p", sink.clone(), epoch());

        counter
            .merge(&delta(&[("200", 1), ("404", 1), ("500", 1)]))
            .await
            .unwrap();

        let pushes = sink.pushes.lock().unwrap();
        let points = &pushes[0].1;
        assert_eq!(points.len(), 3);
        let end = points[0].end;
        assert!(end >= epoch());
        for point in points {
            assert_eq!(point.start, epoch());
            assert_eq!(point.end, end);
            assert_eq!(point.metric_type, STATUS_COUNT_METRIC);
            assert_eq!(point.label_key, STATUS_LABEL);
        }
    }

    #[tokio::test]
    async fn push_failure_keeps_merged_state() {
        let mut counter = StatusCounter::with_epoch("p", RecordingSink::failing(), epoch());

        let err = counter.merge(&delta(&[("200", 2)])).await.unwrap_err();
        assert!(format!("{err:#}").contains("sink unavailable"));
        assert_eq!(counter.snapshot(), BTreeMap::from([("200".to_string(), 2)]));
    }

    #[tokio::test]
    async fn registers_descriptor() {
        let sink = RecordingSink::default();
        let counter = StatusCounter::with_epoch("p", sink.clone(), epoch());

        counter.create_descriptor().await.unwrap();

        let descriptors = sink.descriptors.lock().unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].metric_type, STATUS_COUNT_METRIC);
        assert_eq!(descriptors[0].metric_kind, MetricKind::Cumulative);
        assert_eq!(descriptors[0].value_type, ValueType::Int64);
        assert_eq!(descriptors[0].labels[0].key, STATUS_LABEL);
    }

    #[test]
    fn epoch_defaults_to_construction_time() {
        let before = Utc::now();
        let counter = StatusCounter::new("p", RecordingSink::default());
        assert!(counter.epoch() >= before && counter.epoch() <= Utc::now());
    }
}
