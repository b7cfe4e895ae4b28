//! Periodic consumer turning newly tailed access log lines into status code deltas.

use crate::counter::{CumulativeCounter, DeltaMap};
use crate::metrics::{LINES_TOTAL, PARSE_ERRORS_TOTAL, TICK_DURATION};
use crate::record::{line_preview, split_lines, LogRecord, LINE_PREVIEW_LIMIT};
use crate::tailer::Tailer;
use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

async fn sleep_or_cancel(duration: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

/// Drives a [`Tailer`] and a [`CumulativeCounter`] once per polling period.
///
/// Ticks run back to back on a single task: the next sleep starts only after the previous tick
/// has finished, and missed periods are not caught up.
pub struct Aggregator<T: Tailer, C: CumulativeCounter> {
    period: Duration,
    tailer: T,
    counter: C,
    stop: CancellationToken,
}

impl<T: Tailer, C: CumulativeCounter> Aggregator<T, C> {
    pub fn new(period: Duration, tailer: T, counter: C) -> Self {
        Self::with_stop_token(period, tailer, counter, CancellationToken::new())
    }

    pub fn with_stop_token(
        period: Duration,
        tailer: T,
        counter: C,
        stop: CancellationToken,
    ) -> Self {
        Self {
            period,
            tailer,
            counter,
            stop,
        }
    }

    /// Handle that stops [`Aggregator::run`] from another task.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Request shutdown. Never blocks; calling it again has no effect.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn counter(&self) -> &C {
        &self.counter
    }

    /// Run until stopped or until a tick fails.
    pub async fn run(&mut self) -> Result<()> {
        info!(period_ms = self.period.as_millis() as u64, "aggregator started");

        loop {
            if sleep_or_cancel(self.period, &self.stop).await {
                info!("aggregator stopped");
                return Ok(());
            }

            self.tick().await?;
        }
    }

    /// Read, parse and merge everything appended since the previous tick.
    pub async fn tick(&mut self) -> Result<DeltaMap> {
        let _timer = TICK_DURATION.start_timer();

        let content = self
            .tailer
            .next()
            .await
            .context("could not retrieve log content")?;

        let delta = self.count_statuses(&content);
        info!(counters = ?delta, "captured status code counters");

        self.counter
            .merge(&delta)
            .await
            .context("could not export log content")?;

        Ok(delta)
    }

    fn count_statuses(&self, content: &[u8]) -> DeltaMap {
        let epoch = self.counter.epoch();
        let mut delta = DeltaMap::new();

        for line in split_lines(content) {
            let record = match LogRecord::parse(line) {
                Ok(record) => record,
                Err(err) => {
                    warn!(
                        error = %err,
                        line = %line_preview(line, LINE_PREVIEW_LIMIT),
                        "skipping malformed access log line"
                    );
                    PARSE_ERRORS_TOTAL
                        .with_label_values(&[err.kind.metric_label()])
                        .inc();
                    LINES_TOTAL.with_label_values(&["parse_error"]).inc();
                    continue;
                }
            };

            if record.timestamp.with_timezone(&Utc) < epoch {
                debug!(timestamp = %record.timestamp, "skipping record before reset time");
                LINES_TOTAL.with_label_values(&["skipped_epoch"]).inc();
                continue;
            }

            *delta.entry(record.status).or_insert(0) += 1;
            LINES_TOTAL.with_label_values(&["counted"]).inc();
        }

        delta
    }
}
