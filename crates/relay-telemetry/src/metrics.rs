//! In-process metrics: counters, gauges and windowed histograms keyed by
//! name plus labels.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// Observations kept per histogram.
const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// Percentiles over the most recent observations of one histogram.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

/// One series as captured by [`MetricsRecorder::snapshot`].
#[derive(Clone, Debug, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Counter total, gauge value, or histogram p50.
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<HistogramSummary>,
}

/// Everything recorded, at one instant.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub samples: Vec<MetricSample>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }
}

enum Series {
    Counter(AtomicU64),
    /// f64 bits
    Gauge(AtomicU64),
    Histogram(Mutex<VecDeque<f64>>),
}

impl Series {
    fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Histogram(_) => MetricKind::Histogram,
        }
    }
}

fn summarize(window: &VecDeque<f64>) -> HistogramSummary {
    if window.is_empty() {
        return HistogramSummary::default();
    }
    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);
    let rank = |q: f64| {
        let idx = (q * sorted.len() as f64).ceil() as usize;
        sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
    };
    HistogramSummary {
        count: sorted.len() as u64,
        p50: rank(0.50),
        p95: rank(0.95),
        max: sorted[sorted.len() - 1],
    }
}

/// Thread-safe recorder shared by every component that reports metrics.
///
/// A name is bound to the kind it was first recorded as; recording it as a
/// different kind later is ignored.
#[derive(Default)]
pub struct MetricsRecorder {
    series: RwLock<BTreeMap<SeriesKey, Series>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the series for `key`, creating it with `init` if missing.
    fn with_series(&self, key: SeriesKey, init: fn() -> Series, f: impl FnOnce(&Series)) {
        if let Some(series) = self.series.read().get(&key) {
            f(series);
            return;
        }
        let mut map = self.series.write();
        f(map.entry(key).or_insert_with(init));
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.with_series(
            SeriesKey::new(name, labels),
            || Series::Counter(AtomicU64::new(0)),
            |s| {
                if let Series::Counter(c) = s {
                    let _ = c.fetch_add(n, Ordering::Relaxed);
                }
            },
        );
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_series(
            SeriesKey::new(name, labels),
            || Series::Gauge(AtomicU64::new(0f64.to_bits())),
            |s| {
                if let Series::Gauge(g) = s {
                    g.store(value.to_bits(), Ordering::Relaxed);
                }
            },
        );
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_series(
            SeriesKey::new(name, labels),
            || Series::Histogram(Mutex::new(VecDeque::new())),
            |s| {
                if let Series::Histogram(h) = s {
                    let mut window = h.lock();
                    if window.len() == HISTOGRAM_WINDOW {
                        let _ = window.pop_front();
                    }
                    window.push_back(value);
                }
            },
        );
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        match self.series.read().get(&SeriesKey::new(name, labels)) {
            Some(Series::Counter(c)) => c.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    /// Sum of a counter across every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.series
            .read()
            .iter()
            .filter(|(k, _)| k.name == name)
            .map(|(_, s)| match s {
                Series::Counter(c) => c.load(Ordering::Relaxed),
                _ => 0,
            })
            .sum()
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        match self.series.read().get(&SeriesKey::new(name, labels)) {
            Some(Series::Histogram(h)) => summarize(&h.lock()),
            _ => HistogramSummary::default(),
        }
    }

    /// Every series, ordered by name then labels.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self
            .series
            .read()
            .iter()
            .map(|(key, series)| {
                let (value, summary) = match series {
                    Series::Counter(c) => (c.load(Ordering::Relaxed) as f64, None),
                    Series::Gauge(g) => (f64::from_bits(g.load(Ordering::Relaxed)), None),
                    Series::Histogram(h) => {
                        let summary = summarize(&h.lock());
                        (summary.p50, Some(summary))
                    }
                };
                MetricSample {
                    name: key.name.clone(),
                    kind: series.kind(),
                    labels: key.labels.iter().cloned().collect(),
                    value,
                    summary,
                }
            })
            .collect();
        MetricsSnapshot {
            taken_at: Utc::now(),
            samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_by_label() {
        let m = MetricsRecorder::new();
        m.counter_inc("sessions.finished", &[("status", "completed")], 1);
        m.counter_inc("sessions.finished", &[("status", "completed")], 1);
        m.counter_inc("sessions.finished", &[("status", "failed")], 1);

        assert_eq!(m.counter_get("sessions.finished", &[("status", "completed")]), 2);
        assert_eq!(m.counter_get("sessions.finished", &[("status", "timed_out")]), 0);
        assert_eq!(m.counter_total("sessions.finished"), 3);
    }

    #[test]
    fn label_order_does_not_matter() {
        let m = MetricsRecorder::new();
        m.counter_inc("x", &[("a", "1"), ("b", "2")], 1);
        m.counter_inc("x", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(m.counter_get("x", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn name_keeps_its_first_kind() {
        let m = MetricsRecorder::new();
        m.counter_inc("agents.online", &[], 3);
        m.gauge_set("agents.online", &[], 10.0);
        assert_eq!(m.counter_get("agents.online", &[]), 3);
        assert_eq!(m.snapshot().samples[0].kind, MetricKind::Counter);
    }

    #[test]
    fn histogram_percentiles() {
        let m = MetricsRecorder::new();
        for v in 1..=100 {
            m.histogram_observe("session.duration_ms", &[], v as f64);
        }
        let s = m.histogram_summary("session.duration_ms", &[]);
        assert_eq!(s.count, 100);
        assert_eq!(s.p50, 50.0);
        assert_eq!(s.p95, 95.0);
        assert_eq!(s.max, 100.0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let m = MetricsRecorder::new();
        for v in 0..(HISTOGRAM_WINDOW + 10) {
            m.histogram_observe("h", &[], v as f64);
        }
        let s = m.histogram_summary("h", &[]);
        assert_eq!(s.count, HISTOGRAM_WINDOW as u64);
        assert_eq!(s.max, (HISTOGRAM_WINDOW + 9) as f64);
        assert_eq!(m.histogram_summary("missing", &[]), HistogramSummary::default());
    }

    #[test]
    fn snapshot_is_ordered_and_serializable() {
        let m = MetricsRecorder::new();
        m.counter_inc("messages.routed", &[("kind", "response")], 42);
        m.gauge_set("agents.online", &[], 5.0);
        m.histogram_observe("session.duration_ms", &[], 120.0);

        let snap = m.snapshot();
        let names: Vec<&str> = snap.samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["agents.online", "messages.routed", "session.duration_ms"]);
        assert_eq!(snap.samples[0].value, 5.0);
        assert_eq!(snap.samples[2].summary.unwrap().count, 1);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["samples"][0]["kind"], "gauge");
        assert!(json["samples"][0].get("labels").is_none());
        assert_eq!(json["samples"][1]["labels"]["kind"], "response");
    }

    #[test]
    fn concurrent_increments() {
        use std::sync::Arc;

        let m = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.counter_inc("c", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.counter_get("c", &[]), 8000);
    }
}
