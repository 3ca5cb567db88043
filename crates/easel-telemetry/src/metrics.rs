use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Metric names recorded by the server.
pub mod names {
    pub const CONNECTIONS_ACTIVE: &str = "connections.active";
    pub const CONNECTIONS_TOTAL: &str = "connections.total";
    pub const CONNECTIONS_REJECTED: &str = "connections.rejected";
    pub const SESSIONS_ACTIVE: &str = "sessions.active";
    pub const FRAMES_SENT: &str = "batcher.frames";
    pub const MESSAGES_BATCHED: &str = "batcher.messages";
    pub const BATCH_SIZE: &str = "batcher.run_length";
    pub const BUFFER_GROWTHS: &str = "batcher.buffer_growths";
    pub const MESSAGES_RECEIVED: &str = "dispatch.messages";
    pub const MESSAGES_DROPPED: &str = "dispatch.dropped";
    pub const ERRORS: &str = "connection.errors";
}

/// Type of metric.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// One metric value at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<HistogramSummary>,
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Gauge stored as f64 bits.
struct Gauge(AtomicU64);

impl Gauge {
    fn new() -> Self {
        Self(AtomicU64::new(0f64.to_bits()))
    }

    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Observations kept for percentile estimates. Count, sum and max cover
/// every observation; percentiles cover only the most recent window.
pub const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Default)]
struct HistogramState {
    count: u64,
    sum: f64,
    max: f64,
    recent: VecDeque<f64>,
}

/// Histogram with running totals and a bounded window of recent values.
struct Histogram {
    state: Mutex<HistogramState>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            state: Mutex::new(HistogramState {
                recent: VecDeque::with_capacity(HISTOGRAM_WINDOW),
                ..HistogramState::default()
            }),
        }
    }

    fn observe(&self, value: f64) {
        let mut state = self.state.lock();
        if state.count == 0 || value > state.max {
            state.max = value;
        }
        state.count += 1;
        state.sum += value;
        if state.recent.len() == HISTOGRAM_WINDOW {
            state.recent.pop_front();
        }
        state.recent.push_back(value);
    }

    fn summary(&self) -> HistogramSummary {
        let (count, sum, max, mut recent) = {
            let state = self.state.lock();
            let recent: Vec<f64> = state.recent.iter().copied().collect();
            (state.count, state.sum, state.max, recent)
        };
        if recent.is_empty() {
            return HistogramSummary::default();
        }
        recent.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let len = recent.len();
        let at = |q: f64| recent[((len as f64 * q) as usize).min(len - 1)];
        HistogramSummary {
            count,
            sum,
            max,
            p50: at(0.5),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

/// Metric key: name + sorted labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }
}

/// Thread-safe in-memory metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, AtomicU64>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_gauge(name, labels, |g| g.set(value));
    }

    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        self.with_gauge(name, labels, |g| g.add(delta));
    }

    fn with_gauge(&self, name: &str, labels: &[(&str, &str)], f: impl FnOnce(&Gauge)) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            f(g);
            return;
        }
        let mut gauges = self.gauges.write();
        f(gauges.entry(key).or_insert_with(Gauge::new));
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            h.observe(value);
            return;
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters
            .read()
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
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

    /// Current value of every metric, sorted by name.
    pub fn snapshot(&self) -> Vec<MetricsSnapshot> {
        let now = Utc::now().to_rfc3339();
        let mut out = Vec::new();

        for (key, counter) in self.counters.read().iter() {
            out.push(MetricsSnapshot {
                timestamp: now.clone(),
                name: key.name.clone(),
                labels: key.labels.clone(),
                metric_type: MetricType::Counter,
                value: counter.load(Ordering::Relaxed) as f64,
                summary: None,
            });
        }
        for (key, gauge) in self.gauges.read().iter() {
            out.push(MetricsSnapshot {
                timestamp: now.clone(),
                name: key.name.clone(),
                labels: key.labels.clone(),
                metric_type: MetricType::Gauge,
                value: gauge.get(),
                summary: None,
            });
        }
        for (key, histogram) in self.histograms.read().iter() {
            let summary = histogram.summary();
            out.push(MetricsSnapshot {
                timestamp: now.clone(),
                name: key.name.clone(),
                labels: key.labels.clone(),
                metric_type: MetricType::Histogram,
                value: summary.p50,
                summary: Some(summary),
            });
        }

        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basic() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::FRAMES_SENT, &[("kind", "stroke_info")], 1);
        recorder.counter_inc(names::FRAMES_SENT, &[("kind", "stroke_info")], 1);
        recorder.counter_inc(names::FRAMES_SENT, &[("kind", "chat")], 1);

        assert_eq!(recorder.counter_get(names::FRAMES_SENT, &[("kind", "stroke_info")]), 2);
        assert_eq!(recorder.counter_get(names::FRAMES_SENT, &[("kind", "chat")]), 1);
        assert_eq!(recorder.counter_get(names::FRAMES_SENT, &[("kind", "ack")]), 0);
    }

    #[test]
    fn gauge_set_and_increment() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_set(names::CONNECTIONS_ACTIVE, &[], 10.0);
        recorder.gauge_inc(names::CONNECTIONS_ACTIVE, &[], 5.0);
        recorder.gauge_inc(names::CONNECTIONS_ACTIVE, &[], -3.0);
        assert_eq!(recorder.gauge_get(names::CONNECTIONS_ACTIVE, &[]), 12.0);
    }

    #[test]
    fn histogram_percentiles() {
        let recorder = MetricsRecorder::new();
        for v in 1..=100 {
            recorder.histogram_observe(names::BATCH_SIZE, &[], v as f64);
        }
        let summary = recorder.histogram_summary(names::BATCH_SIZE, &[]);
        assert_eq!(summary.count, 100);
        assert_eq!(summary.sum, 5050.0);
        assert_eq!(summary.max, 100.0);
        assert!(summary.p50 >= 50.0 && summary.p50 <= 51.0);
        assert!(summary.p99 >= 99.0);
    }

    #[test]
    fn histogram_memory_is_bounded() {
        let histogram = Histogram::new();
        let total = HISTOGRAM_WINDOW * 10;
        for v in 0..total {
            histogram.observe(v as f64);
        }
        assert_eq!(histogram.state.lock().recent.len(), HISTOGRAM_WINDOW);

        let summary = histogram.summary();
        assert_eq!(summary.count, total as u64);
        assert_eq!(summary.max, (total - 1) as f64);
        assert_eq!(summary.sum, (0..total).map(|v| v as f64).sum::<f64>());
        // Percentiles come from the latest window only.
        assert!(summary.p50 >= (total - HISTOGRAM_WINDOW) as f64);
    }

    #[test]
    fn histogram_empty() {
        let recorder = MetricsRecorder::new();
        assert_eq!(
            recorder.histogram_summary("missing", &[]),
            HistogramSummary::default()
        );
    }

    #[test]
    fn label_ordering_independent() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("test", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("test", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(recorder.counter_get("test", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn snapshot_lists_every_metric() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc(names::MESSAGES_BATCHED, &[], 42);
        recorder.gauge_set(names::SESSIONS_ACTIVE, &[], 2.0);
        recorder.histogram_observe(names::BATCH_SIZE, &[], 7.0);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.len(), 3);
        let batched = snapshot
            .iter()
            .find(|s| s.name == names::MESSAGES_BATCHED)
            .unwrap();
        assert_eq!(batched.metric_type, MetricType::Counter);
        assert_eq!(batched.value, 42.0);
        let sizes = snapshot.iter().find(|s| s.name == names::BATCH_SIZE).unwrap();
        assert_eq!(sizes.summary.as_ref().unwrap().count, 1);
    }

    #[test]
    fn concurrent_counter_increments() {
        use std::sync::Arc;
        use std::thread;

        let recorder = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&recorder);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("concurrent", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("concurrent", &[]), 8000);
    }
}
