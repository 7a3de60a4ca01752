//! In-process metrics: counters, gauges and histograms with a snapshot API and
//! a line-oriented text exposition.
//!
//! A single [`MetricsCollector`] is constructed at startup and shared via
//! [`Arc`] with every component that reports (cache, retry executor,
//! middleware). Series are keyed by metric name and a sorted label set, so two
//! calls with the same labels in a different order hit the same series.
//!
//! # Examples
//!
//! ```
//! use hostgate::metrics::MetricsCollector;
//!
//! let metrics = MetricsCollector::new();
//! metrics.inc("errors_total");
//! metrics.observe_histogram("lat", 1.0, &[]);
//! metrics.observe_histogram("lat", 3.0, &[]);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.counter("errors_total", &[]), Some(1));
//! assert_eq!(snapshot.histogram("lat", &[]).map(|h| h.avg), Some(2.0));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

/// A sorted label set.
pub type Labels = BTreeMap<String, String>;

/// Default histogram bucket upper bounds, in seconds.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Builds a [`Labels`] map from borrowed pairs.
pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

#[derive(Debug)]
struct HistogramFamily {
    buckets: Vec<f64>,
    series: BTreeMap<Labels, Vec<f64>>,
}

impl HistogramFamily {
    fn new(buckets: Vec<f64>) -> Self {
        Self {
            buckets,
            series: BTreeMap::new(),
        }
    }
}

/// Thread-safe metrics store.
///
/// Counters are atomics so the hot increment path only takes a read lock once
/// the series exists. Gauges and histograms take a short write lock.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<BTreeMap<String, BTreeMap<Labels, Arc<AtomicU64>>>>,
    gauges: RwLock<BTreeMap<String, BTreeMap<Labels, f64>>>,
    histograms: RwLock<BTreeMap<String, HistogramFamily>>,
    help: RwLock<HashMap<String, String>>,
}

impl MetricsCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches help text rendered on the `# HELP` line of `name`.
    pub fn describe(&self, name: &str, help: &str) {
        let mut map = self.help.write().unwrap_or_else(|e| e.into_inner());
        map.insert(name.to_owned(), help.to_owned());
    }

    /// Fixes the bucket bounds of histogram `name`.
    ///
    /// Has no effect once the histogram has recorded its first observation
    /// under the default buckets; bounds never change mid-life.
    pub fn register_histogram(&self, name: &str, buckets: &[f64]) {
        let mut map = self.histograms.write().unwrap_or_else(|e| e.into_inner());
        let mut bounds = buckets.to_vec();
        bounds.sort_by(f64::total_cmp);
        map.entry(name.to_owned())
            .or_insert_with(|| HistogramFamily::new(bounds));
    }

    /// Increments counter `name` by one with no labels.
    pub fn inc(&self, name: &str) {
        self.increment_counter(name, &[], 1);
    }

    /// Adds `delta` to the counter identified by `name` and `labels`.
    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)], delta: u64) {
        let key = self::labels(labels);
        {
            let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
            if let Some(value) = counters.get(name).and_then(|series| series.get(&key)) {
                value.fetch_add(delta, Ordering::Relaxed);
                return;
            }
        }

        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        counters
            .entry(name.to_owned())
            .or_default()
            .entry(key)
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Sets gauge `name` to `value`. Last write wins.
    pub fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let mut gauges = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        gauges
            .entry(name.to_owned())
            .or_default()
            .insert(self::labels(labels), value);
    }

    /// Records one observation in histogram `name`.
    pub fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let mut histograms = self.histograms.write().unwrap_or_else(|e| e.into_inner());
        histograms
            .entry(name.to_owned())
            .or_insert_with(|| HistogramFamily::new(DEFAULT_BUCKETS.to_vec()))
            .series
            .entry(self::labels(labels))
            .or_default()
            .push(value);
    }

    /// Removes every metric. Help text is kept.
    pub fn clear(&self) {
        self.counters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.gauges.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.histograms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Captures the current state of every series.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut samples = Vec::new();

        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        for (name, series) in counters.iter() {
            for (labels, value) in series {
                samples.push(MetricSample {
                    name: name.clone(),
                    kind: MetricKind::Counter,
                    labels: labels.clone(),
                    value: SampleValue::Counter(value.load(Ordering::Relaxed)),
                });
            }
        }
        drop(counters);

        let gauges = self.gauges.read().unwrap_or_else(|e| e.into_inner());
        for (name, series) in gauges.iter() {
            for (labels, value) in series {
                samples.push(MetricSample {
                    name: name.clone(),
                    kind: MetricKind::Gauge,
                    labels: labels.clone(),
                    value: SampleValue::Gauge(*value),
                });
            }
        }
        drop(gauges);

        let histograms = self.histograms.read().unwrap_or_else(|e| e.into_inner());
        for (name, family) in histograms.iter() {
            for (labels, values) in &family.series {
                samples.push(MetricSample {
                    name: name.clone(),
                    kind: MetricKind::Histogram,
                    labels: labels.clone(),
                    value: SampleValue::Histogram(HistogramStats::from_values(values)),
                });
            }
        }

        MetricsSnapshot { metrics: samples }
    }

    /// Renders every metric in the text exposition format.
    ///
    /// Each metric name gets one `# HELP` and one `# TYPE` line followed by a
    /// sample line per label set. Histograms render cumulative
    /// `_bucket{le="..."}` lines ending with `+Inf`, then `_sum` and `_count`.
    pub fn export(&self) -> String {
        let help = self.help.read().unwrap_or_else(|e| e.into_inner());
        let help_for = |name: &str| help.get(name).cloned().unwrap_or_else(|| name.to_owned());
        let mut out = String::new();

        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        for (name, series) in counters.iter() {
            write_header(&mut out, name, &help_for(name), MetricKind::Counter);
            for (labels, value) in series {
                let _ = writeln!(
                    out,
                    "{name}{} {}",
                    format_labels(labels, None),
                    value.load(Ordering::Relaxed)
                );
            }
        }
        drop(counters);

        let gauges = self.gauges.read().unwrap_or_else(|e| e.into_inner());
        for (name, series) in gauges.iter() {
            write_header(&mut out, name, &help_for(name), MetricKind::Gauge);
            for (labels, value) in series {
                let _ = writeln!(out, "{name}{} {value}", format_labels(labels, None));
            }
        }
        drop(gauges);

        let histograms = self.histograms.read().unwrap_or_else(|e| e.into_inner());
        for (name, family) in histograms.iter() {
            if family.series.is_empty() {
                continue;
            }
            write_header(&mut out, name, &help_for(name), MetricKind::Histogram);
            for (labels, values) in &family.series {
                for bound in &family.buckets {
                    let count = values.iter().filter(|v| **v <= *bound).count();
                    let le = bound.to_string();
                    let _ = writeln!(
                        out,
                        "{name}_bucket{} {count}",
                        format_labels(labels, Some(&le))
                    );
                }
                let _ = writeln!(
                    out,
                    "{name}_bucket{} {}",
                    format_labels(labels, Some("+Inf")),
                    values.len()
                );
                let sum: f64 = values.iter().sum();
                let _ = writeln!(out, "{name}_sum{} {sum}", format_labels(labels, None));
                let _ = writeln!(
                    out,
                    "{name}_count{} {}",
                    format_labels(labels, None),
                    values.len()
                );
            }
        }

        out
    }
}

fn write_header(out: &mut String, name: &str, help: &str, kind: MetricKind) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {}", kind.as_str());
}

// Renders `{k="v",...}`, appending `le` last when given. Empty sets render as "".
fn format_labels(labels: &Labels, le: Option<&str>) -> String {
    if labels.is_empty() && le.is_none() {
        return String::new();
    }
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect();
    if let Some(le) = le {
        parts.push(format!("le=\"{le}\""));
    }
    format!("{{{}}}", parts.join(","))
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Summary statistics over a histogram's full observation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramStats {
    fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                count: 0,
                sum: 0.0,
                avg: 0.0,
                min: 0.0,
                max: 0.0,
            };
        }
        let sum: f64 = values.iter().sum();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            count: values.len() as u64,
            sum,
            avg: sum / values.len() as f64,
            min,
            max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SampleValue {
    Counter(u64),
    Gauge(f64),
    Histogram(HistogramStats),
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub labels: Labels,
    pub value: SampleValue,
}

/// Point-in-time copy of every series in a [`MetricsCollector`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub metrics: Vec<MetricSample>,
}

impl MetricsSnapshot {
    fn find(&self, name: &str, labels: &[(&str, &str)]) -> Option<&SampleValue> {
        let key = self::labels(labels);
        self.metrics
            .iter()
            .find(|m| m.name == name && m.labels == key)
            .map(|m| &m.value)
    }

    /// Value of one counter series; `None` when the series was never touched.
    ///
    /// # Examples
    ///
    /// ```
    /// use hostgate::metrics::MetricsCollector;
    ///
    /// let metrics = MetricsCollector::new();
    /// metrics.increment_counter("calls_total", &[("tool", "ping")], 2);
    ///
    /// let snapshot = metrics.snapshot();
    /// assert_eq!(snapshot.counter("calls_total", &[("tool", "ping")]), Some(2));
    /// assert_eq!(snapshot.counter("calls_total", &[]), None);
    /// ```
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        match self.find(name, labels)? {
            SampleValue::Counter(v) => Some(*v),
            _ => None,
        }
    }

    /// Last value set on one gauge series.
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        match self.find(name, labels)? {
            SampleValue::Gauge(v) => Some(*v),
            _ => None,
        }
    }

    /// Summary statistics of one histogram series.
    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramStats> {
        match self.find(name, labels)? {
            SampleValue::Histogram(stats) => Some(*stats),
            _ => None,
        }
    }

    /// Sum of a counter across all of its label sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.metrics
            .iter()
            .filter(|m| m.name == name)
            .filter_map(|m| match m.value {
                SampleValue::Counter(v) => Some(v),
                _ => None,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let metrics = MetricsCollector::new();
        metrics.inc("errors_total");
        metrics.inc("errors_total");
        metrics.inc("errors_total");
        assert_eq!(metrics.snapshot().counter("errors_total", &[]), Some(3));
    }

    #[test]
    fn counter_delta_and_labels_are_independent() {
        let metrics = MetricsCollector::new();
        metrics.increment_counter("calls", &[("method", "a")], 2);
        metrics.increment_counter("calls", &[("method", "b")], 5);
        let snap = metrics.snapshot();
        assert_eq!(snap.counter("calls", &[("method", "a")]), Some(2));
        assert_eq!(snap.counter("calls", &[("method", "b")]), Some(5));
        assert_eq!(snap.counter("calls", &[]), None);
        assert_eq!(snap.counter_total("calls"), 7);
    }

    #[test]
    fn label_order_does_not_matter() {
        let metrics = MetricsCollector::new();
        metrics.increment_counter("c", &[("a", "1"), ("b", "2")], 1);
        metrics.increment_counter("c", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(metrics.snapshot().counter("c", &[("a", "1"), ("b", "2")]), Some(2));
    }

    #[test]
    fn gauge_last_write_wins() {
        let metrics = MetricsCollector::new();
        metrics.set_gauge("size", 10.0, &[]);
        metrics.set_gauge("size", 4.0, &[]);
        assert_eq!(metrics.snapshot().gauge("size", &[]), Some(4.0));
    }

    #[test]
    fn histogram_stats() {
        let metrics = MetricsCollector::new();
        metrics.observe_histogram("lat", 1.0, &[]);
        metrics.observe_histogram("lat", 3.0, &[]);
        let stats = metrics.snapshot().histogram("lat", &[]).unwrap();
        assert_eq!(
            stats,
            HistogramStats {
                count: 2,
                sum: 4.0,
                avg: 2.0,
                min: 1.0,
                max: 3.0,
            }
        );
    }

    #[test]
    fn clear_resets_everything() {
        let metrics = MetricsCollector::new();
        metrics.inc("a");
        metrics.set_gauge("b", 1.0, &[]);
        metrics.observe_histogram("c", 1.0, &[]);
        metrics.clear();
        assert!(metrics.snapshot().metrics.is_empty());
        assert!(metrics.export().is_empty());
    }

    #[test]
    fn export_counter_and_gauge() {
        let metrics = MetricsCollector::new();
        metrics.describe("requests_total", "Total requests");
        metrics.increment_counter("requests_total", &[("method", "ping")], 2);
        metrics.set_gauge("cache_entries", 3.0, &[]);

        let text = metrics.export();
        assert!(text.contains("# HELP requests_total Total requests\n"));
        assert!(text.contains("# TYPE requests_total counter\n"));
        assert!(text.contains("requests_total{method=\"ping\"} 2\n"));
        assert!(text.contains("# HELP cache_entries cache_entries\n"));
        assert!(text.contains("# TYPE cache_entries gauge\n"));
        assert!(text.contains("cache_entries 3\n"));
    }

    #[test]
    fn export_one_header_per_name() {
        let metrics = MetricsCollector::new();
        metrics.increment_counter("calls", &[("method", "a")], 1);
        metrics.increment_counter("calls", &[("method", "b")], 1);
        let text = metrics.export();
        assert_eq!(text.matches("# TYPE calls counter").count(), 1);
        assert_eq!(text.matches("# HELP calls").count(), 1);
    }

    #[test]
    fn export_histogram_buckets_are_cumulative() {
        let metrics = MetricsCollector::new();
        metrics.register_histogram("lat", &[1.0, 5.0]);
        metrics.observe_histogram("lat", 0.5, &[("m", "x")]);
        metrics.observe_histogram("lat", 2.0, &[("m", "x")]);
        metrics.observe_histogram("lat", 9.0, &[("m", "x")]);

        let text = metrics.export();
        assert!(text.contains("# TYPE lat histogram\n"));
        assert!(text.contains("lat_bucket{m=\"x\",le=\"1\"} 1\n"));
        assert!(text.contains("lat_bucket{m=\"x\",le=\"5\"} 2\n"));
        assert!(text.contains("lat_bucket{m=\"x\",le=\"+Inf\"} 3\n"));
        assert!(text.contains("lat_sum{m=\"x\"} 11.5\n"));
        assert!(text.contains("lat_count{m=\"x\"} 3\n"));
    }

    #[test]
    fn export_escapes_label_values() {
        let metrics = MetricsCollector::new();
        metrics.increment_counter("c", &[("v", "a\"b")], 1);
        assert!(metrics.export().contains("c{v=\"a\\\"b\"} 1\n"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_sum_exactly() {
        let metrics = Arc::new(MetricsCollector::new());

        let tasks: Vec<_> = (0..8)
            .map(|task| {
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    let worker = task.to_string();
                    for _ in 0..1_000 {
                        metrics.inc("calls_total");
                        metrics.increment_counter("per_worker_total", &[("worker", &worker)], 1);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.counter("calls_total", &[]), Some(8_000));
        assert_eq!(snap.counter("per_worker_total", &[("worker", "3")]), Some(1_000));
        assert_eq!(snap.counter_total("per_worker_total"), 8_000);
    }
}
