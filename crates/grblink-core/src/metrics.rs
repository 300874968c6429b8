//! Latency metrics aggregation
//!
//! Keeps a bounded rolling window of per-command round-trip measurements and
//! produces throughput/latency summaries with a pass/fail verdict against a
//! configurable latency budget.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{ResolvedCommand, DEFAULT_LATENCY_BUDGET_MS};

/// Measurements retained in the rolling window before eviction.
const WINDOW_CAPACITY: usize = 1000;

/// One resolved command's round-trip time. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyMeasurement {
    /// Id of the command that produced this sample.
    pub command_id: i64,
    /// Wall-clock time of resolution.
    pub resolved_at: DateTime<Utc>,
    /// Round-trip latency in milliseconds.
    pub latency_ms: f64,
}

/// Snapshot of the current metrics window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    /// Inbound message rate over the retained window.
    pub messages_per_second: f64,
    /// Mean round-trip latency over the window, ms.
    pub average_latency_ms: f64,
    /// Worst round-trip latency over the window, ms.
    pub max_latency_ms: f64,
    /// Total inbound lines processed this session (not windowed).
    pub total_messages: u64,
    /// Whether the average is within the configured budget.
    pub meets_latency_budget: bool,
    /// Lines that classified as unsolicited.
    pub unsolicited_lines: u64,
    /// Status lines that failed to parse into a snapshot.
    pub parse_anomalies: u64,
    /// Responses that matched no pending command.
    pub correlation_misses: u64,
}

/// Rolling window of latency samples plus session counters.
#[derive(Debug)]
pub struct MetricsAggregator {
    window: VecDeque<(Instant, LatencyMeasurement)>,
    budget_ms: f64,
    total_messages: u64,
    unsolicited_lines: u64,
    parse_anomalies: u64,
    correlation_misses: u64,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_BUDGET_MS)
    }
}

impl MetricsAggregator {
    /// Create an aggregator with the given average-latency budget (ms).
    pub fn new(budget_ms: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW_CAPACITY),
            budget_ms,
            total_messages: 0,
            unsolicited_lines: 0,
            parse_anomalies: 0,
            correlation_misses: 0,
        }
    }

    /// Record a resolved command's latency. Evicts the oldest sample once the
    /// window is full.
    pub fn record(&mut self, resolved: &ResolvedCommand, now: Instant) {
        if self.window.len() >= WINDOW_CAPACITY {
            self.window.pop_front();
        }
        self.window.push_back((
            now,
            LatencyMeasurement {
                command_id: resolved.id,
                resolved_at: Utc::now(),
                latency_ms: resolved.latency.as_secs_f64() * 1000.0,
            },
        ));
    }

    /// Count one processed inbound line.
    pub fn count_message(&mut self) {
        self.total_messages += 1;
    }

    /// Count an unsolicited line (banner, alarm, setting dump).
    pub fn count_unsolicited(&mut self) {
        self.unsolicited_lines += 1;
    }

    /// Count a status line that produced no snapshot.
    pub fn count_parse_anomaly(&mut self) {
        self.parse_anomalies += 1;
    }

    /// Count a response that matched no pending command.
    pub fn count_correlation_miss(&mut self) {
        self.correlation_misses += 1;
    }

    /// Latency samples currently retained.
    pub fn sample_count(&self) -> usize {
        self.window.len()
    }

    /// Summarize the current window.
    pub fn report(&self, now: Instant) -> MetricsReport {
        let count = self.window.len();
        let (sum_ms, max_ms) = self.window.iter().fold((0.0_f64, 0.0_f64), |(sum, max), (_, m)| {
            (sum + m.latency_ms, max.max(m.latency_ms))
        });
        let average_latency_ms = if count > 0 { sum_ms / count as f64 } else { 0.0 };

        // Throughput over the span of the retained window; a single sample
        // has no span, so rate needs at least two.
        let messages_per_second = match (self.window.front(), self.window.back()) {
            (Some((oldest, _)), Some(_)) if count > 1 => {
                let span = now.saturating_duration_since(*oldest).as_secs_f64();
                if span > 0.0 {
                    count as f64 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        MetricsReport {
            messages_per_second,
            average_latency_ms,
            max_latency_ms: max_ms,
            total_messages: self.total_messages,
            // An empty window trivially meets the budget.
            meets_latency_budget: average_latency_ms <= self.budget_ms,
            unsolicited_lines: self.unsolicited_lines,
            parse_anomalies: self.parse_anomalies,
            correlation_misses: self.correlation_misses,
        }
    }
}
