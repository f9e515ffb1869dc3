use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Standard metric names recorded by the kernel.
pub mod names {
    pub const CYCLES_TOTAL: &str = "cycles_total";
    pub const CYCLE_ERRORS_TOTAL: &str = "cycle_errors_total";
    pub const CYCLE_DURATION_MS: &str = "cycle_duration_ms";
    pub const TRANSITIONS_TOTAL: &str = "transitions_total";
    pub const GUARD_DENIALS_TOTAL: &str = "guard_denials_total";
    pub const TRACKED_USERS: &str = "tracked_users";
    pub const NOTIFICATIONS_TOTAL: &str = "notifications_total";
    pub const HEARTBEAT_DISPATCHED_TOTAL: &str = "heartbeat_dispatched_total";
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time reading of one metric series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub metric_type: MetricType,
    pub value: f64,
}

struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

struct Gauge {
    // f64 bits
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn set(&self, v: f64) {
        self.value.store(v.to_bits() as i64, Ordering::Relaxed);
    }
    fn increment(&self, delta: f64) {
        loop {
            let current = self.value.load(Ordering::Relaxed);
            let next = f64::from_bits(current as u64) + delta;
            if self
                .value
                .compare_exchange_weak(
                    current,
                    next.to_bits() as i64,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed) as u64)
    }
}

/// Keeps the most recent observations only.
const HISTOGRAM_WINDOW: usize = 4_096;

struct Histogram {
    observations: Mutex<Vec<f64>>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            observations: Mutex::new(Vec::new()),
        }
    }
    fn observe(&self, value: f64) {
        let mut obs = self.observations.lock();
        if obs.len() == HISTOGRAM_WINDOW {
            obs.remove(0);
        }
        obs.push(value);
    }
    fn summary(&self) -> HistogramSummary {
        let mut obs = self.observations.lock().clone();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = obs.len();
        let sum: f64 = obs.iter().sum();
        let at = |q: f64| obs[((count as f64 * q) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum,
            p50: at(0.5),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: impl Into<String>, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.into(),
            labels: sorted,
        }
    }
}

/// Thread-safe in-process metrics keyed by name and labels.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        let counters = self.counters.read();
        if let Some(c) = counters.get(&key) {
            c.increment(n);
            return;
        }
        drop(counters);
        self.counters.write().entry(key).or_insert_with(Counter::new).increment(n);
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.set(value);
            return;
        }
        drop(gauges);
        self.gauges.write().entry(key).or_insert_with(Gauge::new).set(value);
    }

    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.increment(delta);
            return;
        }
        drop(gauges);
        self.gauges.write().entry(key).or_insert_with(Gauge::new).increment(delta);
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        let histograms = self.histograms.read();
        if let Some(h) = histograms.get(&key) {
            h.observe(value);
            return;
        }
        drop(histograms);
        self.histograms.write().entry(key).or_insert_with(Histogram::new).observe(value);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, Counter::get)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0.0, Gauge::get)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    /// Every series, sorted by name. Histograms report their p50.
    pub fn samples(&self) -> Vec<MetricSample> {
        let mut out = Vec::new();
        for (key, c) in self.counters.read().iter() {
            out.push(sample(key, MetricType::Counter, c.get() as f64));
        }
        for (key, g) in self.gauges.read().iter() {
            out.push(sample(key, MetricType::Gauge, g.get()));
        }
        for (key, h) in self.histograms.read().iter() {
            out.push(sample(key, MetricType::Histogram, h.summary().p50));
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }
}

fn sample(key: &MetricKey, metric_type: MetricType, value: f64) -> MetricSample {
    MetricSample {
        name: key.name.clone(),
        labels: key.labels.clone(),
        metric_type,
        value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basic() {
        let m = MetricsRecorder::new();
        m.counter_inc(names::CYCLES_TOTAL, &[], 1);
        m.counter_inc(names::CYCLES_TOTAL, &[], 2);
        assert_eq!(m.counter_get(names::CYCLES_TOTAL, &[]), 3);
        assert_eq!(m.counter_get("missing", &[]), 0);
    }

    #[test]
    fn labels_are_order_independent() {
        let m = MetricsRecorder::new();
        m.counter_inc("t", &[("from", "PLAN"), ("to", "DECIDE")], 1);
        m.counter_inc("t", &[("to", "DECIDE"), ("from", "PLAN")], 1);
        assert_eq!(m.counter_get("t", &[("from", "PLAN"), ("to", "DECIDE")]), 2);
        assert_eq!(m.counter_get("t", &[("from", "PLAN")]), 0);
    }

    #[test]
    fn gauge_set_and_increment() {
        let m = MetricsRecorder::new();
        m.gauge_set(names::TRACKED_USERS, &[], 5.0);
        m.gauge_inc(names::TRACKED_USERS, &[], -2.0);
        assert_eq!(m.gauge_get(names::TRACKED_USERS, &[]), 3.0);
    }

    #[test]
    fn histogram_percentiles() {
        let m = MetricsRecorder::new();
        for v in 1..=100 {
            m.histogram_observe(names::CYCLE_DURATION_MS, &[], v as f64);
        }
        let s = m.histogram_summary(names::CYCLE_DURATION_MS, &[]);
        assert_eq!(s.count, 100);
        assert_eq!(s.sum, 5050.0);
        assert_eq!(s.p50, 51.0);
        assert_eq!(s.p99, 100.0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let m = MetricsRecorder::new();
        for v in 0..(HISTOGRAM_WINDOW + 10) {
            m.histogram_observe("h", &[], v as f64);
        }
        assert_eq!(m.histogram_summary("h", &[]).count, HISTOGRAM_WINDOW as u64);
    }

    #[test]
    fn samples_cover_all_types() {
        let m = MetricsRecorder::new();
        m.counter_inc("b_counter", &[], 1);
        m.gauge_set("a_gauge", &[], 2.0);
        m.histogram_observe("c_hist", &[], 3.0);
        let samples = m.samples();
        let names: Vec<&str> = samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a_gauge", "b_counter", "c_hist"]);
        assert_eq!(samples[1].metric_type, MetricType::Counter);
    }
}
