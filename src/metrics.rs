// Copyright 2026 ble2mqtt contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Telemetry derivation.
//!
//! Aggregates the inbound-notification and publish-completion streams into
//! bounded history buffers: per-second throughput, end-to-end latency,
//! broker cost and host resource usage.
//!
//! Latency correlation is best-effort. Inbound receipts and publish
//! completions carry no shared identifier, so a successful publish is
//! paired with the most recent recorded receipt; unconsumed receipts are
//! evicted once they exceed the stale window.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::config::MetricsConfig;

#[derive(Debug, Clone)]
pub struct ThroughputSample {
    pub timestamp: DateTime<Utc>,
    /// Notifications received during the sample period.
    pub received: u64,
    /// Successful publishes during the sample period.
    pub published: u64,
}

#[derive(Debug, Clone)]
pub struct LatencySample {
    pub timestamp: DateTime<Utc>,
    /// Epoch millis of the paired notification receipt.
    pub received_at: i64,
    /// Epoch millis of the publish completion.
    pub completed_at: i64,
    /// Milliseconds from notification receipt to publish completion.
    pub latency_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CostSample {
    pub timestamp: DateTime<Utc>,
    /// Successful publishes in the sample period.
    pub messages: u64,
    pub period_cost_usd: f64,
    pub total_cost_usd: f64,
    /// Period cost extrapolated to one day of identical periods.
    pub projected_daily_usd: f64,
}

#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub network_kbps: f64,
}

/// Monotonic counters since startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsTotals {
    pub received: u64,
    pub published: u64,
    pub failed: u64,
    pub total_cost_usd: f64,
}

struct Inner {
    throughput: VecDeque<ThroughputSample>,
    latency: VecDeque<LatencySample>,
    cost: VecDeque<CostSample>,
    resources: VecDeque<ResourceSample>,

    /// Receipt timestamps (epoch millis) awaiting a publish completion.
    receive_times: HashMap<String, i64>,
    receive_seq: u64,
    publish_started_at: Option<i64>,

    received_in_period: u64,
    published_in_period: u64,

    totals: MetricsTotals,
}

pub struct MetricsAggregator {
    config: MetricsConfig,
    inner: Mutex<Inner>,
}

impl MetricsAggregator {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                throughput: VecDeque::new(),
                latency: VecDeque::new(),
                cost: VecDeque::new(),
                resources: VecDeque::new(),
                receive_times: HashMap::new(),
                receive_seq: 0,
                publish_started_at: None,
                received_in_period: 0,
                published_in_period: 0,
                totals: MetricsTotals::default(),
            }),
        }
    }

    /// Record an inbound notification receipt.
    pub fn record_receive(&self, identity: &str) {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock();
        inner.receive_seq += 1;
        let key = format!("{}_{}_{}", identity, now, inner.receive_seq);
        inner.receive_times.insert(key, now);
        inner.received_in_period += 1;
        inner.totals.received += 1;
    }

    /// Mark the start of a publish attempt.
    pub fn record_publish_start(&self) {
        self.inner.lock().publish_started_at = Some(Utc::now().timestamp_millis());
    }

    /// Record a publish completion. A success is paired with the most
    /// recent outstanding receipt to derive an end-to-end latency sample;
    /// the consumed receipt is removed from the pairing table.
    pub fn record_publish_complete(&self, success: bool) {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock();

        if let Some(started) = inner.publish_started_at.take() {
            debug!("Publish handoff took {}ms", (now - started).max(0));
        }

        if !success {
            inner.totals.failed += 1;
            return;
        }

        inner.published_in_period += 1;
        inner.totals.published += 1;

        let newest = inner
            .receive_times
            .iter()
            .max_by_key(|entry| *entry.1)
            .map(|(key, ts)| (key.clone(), *ts));
        if let Some((key, received_at)) = newest {
            inner.receive_times.remove(&key);
            let latency_ms = (now - received_at).max(0) as u64;
            let sample = LatencySample {
                timestamp: Utc::now(),
                received_at,
                completed_at: now,
                latency_ms,
            };
            let capacity = self.config.history_capacity;
            push_bounded(&mut inner.latency, sample, capacity);
        }
    }

    /// Close the current sample period: derive throughput and cost samples
    /// and evict stale pairing entries. Called once per second.
    pub fn tick(&self) {
        let now = Utc::now();
        let capacity = self.config.history_capacity;
        let mut inner = self.inner.lock();

        let received = inner.received_in_period;
        let published = inner.published_in_period;
        inner.received_in_period = 0;
        inner.published_in_period = 0;

        push_bounded(
            &mut inner.throughput,
            ThroughputSample {
                timestamp: now,
                received,
                published,
            },
            capacity,
        );

        let period_cost = published as f64 * self.config.cost_per_message_usd;
        inner.totals.total_cost_usd += period_cost;
        let total = inner.totals.total_cost_usd;
        push_bounded(
            &mut inner.cost,
            CostSample {
                timestamp: now,
                messages: published,
                period_cost_usd: period_cost,
                total_cost_usd: total,
                projected_daily_usd: period_cost * 86_400.0,
            },
            capacity,
        );

        let horizon = now.timestamp_millis() - self.config.stale_pairing_window_ms as i64;
        let before = inner.receive_times.len();
        inner.receive_times.retain(|_, &mut ts| ts >= horizon);
        let evicted = before - inner.receive_times.len();
        if evicted > 0 {
            debug!("Evicted {} stale receive entries", evicted);
        }
    }

    /// Record a host resource sample.
    pub fn record_resource(
        &self,
        cpu_percent: f32,
        memory_used_mb: u64,
        memory_total_mb: u64,
        network_kbps: f64,
    ) {
        let sample = ResourceSample {
            timestamp: Utc::now(),
            cpu_percent,
            memory_used_mb,
            memory_total_mb,
            network_kbps,
        };
        let capacity = self.config.history_capacity;
        push_bounded(&mut self.inner.lock().resources, sample, capacity);
    }

    pub fn throughput_history(&self) -> Vec<ThroughputSample> {
        self.inner.lock().throughput.iter().cloned().collect()
    }

    pub fn latency_history(&self) -> Vec<LatencySample> {
        self.inner.lock().latency.iter().cloned().collect()
    }

    pub fn cost_history(&self) -> Vec<CostSample> {
        self.inner.lock().cost.iter().cloned().collect()
    }

    pub fn resource_history(&self) -> Vec<ResourceSample> {
        self.inner.lock().resources.iter().cloned().collect()
    }

    pub fn totals(&self) -> MetricsTotals {
        self.inner.lock().totals.clone()
    }

    pub fn average_latency_ms(&self) -> Option<u64> {
        let inner = self.inner.lock();
        if inner.latency.is_empty() {
            return None;
        }
        let sum: u64 = inner.latency.iter().map(|s| s.latency_ms).sum();
        Some(sum / inner.latency.len() as u64)
    }

    #[cfg(test)]
    fn pending_pairings(&self) -> usize {
        self.inner.lock().receive_times.len()
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, sample: T, capacity: usize) {
    if buffer.len() == capacity {
        buffer.pop_front();
    }
    buffer.push_back(sample);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(history: usize) -> MetricsAggregator {
        MetricsAggregator::new(MetricsConfig {
            history_capacity: history,
            ..MetricsConfig::default()
        })
    }

    #[test]
    fn test_history_keeps_most_recent_entries() {
        let metrics = aggregator(60);

        for period in 1..=75u64 {
            for _ in 0..period {
                metrics.record_receive("AA");
            }
            metrics.tick();
        }

        let history = metrics.throughput_history();
        assert_eq!(history.len(), 60);
        assert_eq!(history.first().unwrap().received, 16);
        assert_eq!(history.last().unwrap().received, 75);
    }

    #[test]
    fn test_period_counters_reset_each_tick() {
        let metrics = aggregator(60);

        metrics.record_receive("AA");
        metrics.record_receive("AA");
        metrics.tick();
        metrics.tick();

        let history = metrics.throughput_history();
        assert_eq!(history[0].received, 2);
        assert_eq!(history[1].received, 0);
        assert_eq!(metrics.totals().received, 2);
    }

    #[test]
    fn test_latency_pairs_with_most_recent_receive() {
        let metrics = aggregator(60);

        metrics.record_receive("AA");
        std::thread::sleep(std::time::Duration::from_millis(30));
        metrics.record_receive("BB");
        std::thread::sleep(std::time::Duration::from_millis(5));
        metrics.record_publish_complete(true);

        let latency = metrics.latency_history();
        assert_eq!(latency.len(), 1);
        // Paired with BB's receipt, so well under the 30ms gap to AA's.
        assert!(latency[0].latency_ms < 30);
        // The consumed receipt is gone, the older one still pending.
        assert_eq!(metrics.pending_pairings(), 1);
    }

    #[test]
    fn test_failed_publish_yields_no_latency_sample() {
        let metrics = aggregator(60);

        metrics.record_receive("AA");
        metrics.record_publish_complete(false);

        assert!(metrics.latency_history().is_empty());
        assert_eq!(metrics.totals().failed, 1);
        assert_eq!(metrics.totals().published, 0);
    }

    #[test]
    fn test_publish_without_receive_yields_no_latency_sample() {
        let metrics = aggregator(60);
        metrics.record_publish_complete(true);
        assert!(metrics.latency_history().is_empty());
        assert_eq!(metrics.totals().published, 1);
    }

    #[test]
    fn test_stale_pairings_evicted() {
        let metrics = MetricsAggregator::new(MetricsConfig {
            stale_pairing_window_ms: 0,
            ..MetricsConfig::default()
        });

        metrics.record_receive("AA");
        std::thread::sleep(std::time::Duration::from_millis(5));
        metrics.tick();

        assert_eq!(metrics.pending_pairings(), 0);
        metrics.record_publish_complete(true);
        assert!(metrics.latency_history().is_empty());
    }

    #[test]
    fn test_cost_accumulates_and_projects() {
        let metrics = aggregator(60);

        for _ in 0..3 {
            metrics.record_publish_complete(true);
        }
        metrics.tick();

        let cost = metrics.cost_history();
        let sample = cost.last().unwrap();
        assert_eq!(sample.messages, 3);
        assert!((sample.period_cost_usd - 0.000003).abs() < 1e-12);
        assert!((sample.projected_daily_usd - 0.000003 * 86_400.0).abs() < 1e-9);

        metrics.record_publish_complete(true);
        metrics.tick();
        let total = metrics.cost_history().last().unwrap().total_cost_usd;
        assert!((total - 0.000004).abs() < 1e-12);
    }

    #[test]
    fn test_average_latency() {
        let metrics = aggregator(60);
        assert_eq!(metrics.average_latency_ms(), None);

        metrics.record_receive("AA");
        metrics.record_publish_complete(true);
        assert!(metrics.average_latency_ms().is_some());
    }

    #[test]
    fn test_resource_history_bounded() {
        let metrics = aggregator(3);
        for i in 0..5u64 {
            metrics.record_resource(10.0, 100 + i, 8192, 0.0);
        }
        let history = metrics.resource_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap().memory_used_mb, 104);
    }
}
