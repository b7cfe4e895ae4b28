//! Tails an nginx JSON access log and exports cumulative HTTP response counts per status code.
//!
//! The [`aggregator::Aggregator`] reads newly appended lines from a [`tailer::Tailer`] once per
//! polling period, counts responses at or after the counter's reset time, and merges the
//! per-period deltas into a [`counter::CumulativeCounter`] that pushes snapshots to a
//! [`sink::MetricSink`].

pub mod aggregator;
pub mod config;
pub mod counter;
pub mod logging;
pub mod metadata;
pub mod metrics;
pub mod record;
pub mod runner;
pub mod sink;
pub mod tailer;

#[cfg(test)]
mod test_support;
