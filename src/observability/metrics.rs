//! In-memory metric store and smoothing helpers

use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::time::Duration;
use tracing::info;

use super::sink::{MetricKind, MetricsSink, Tags};

/// Weight of the newest sample in every moving average
pub const SMOOTHING_ALPHA: f64 = 0.1;

/// Exponential moving average; the first sample seeds the average
pub fn smooth(previous: Option<f64>, sample: f64) -> f64 {
    match previous {
        Some(avg) => SMOOTHING_ALPHA * sample + (1.0 - SMOOTHING_ALPHA) * avg,
        None => sample,
    }
}

pub fn smooth_duration(previous: Option<Duration>, sample: Duration) -> Duration {
    let secs = smooth(previous.map(|d| d.as_secs_f64()), sample.as_secs_f64());
    Duration::from_secs_f64(secs.max(0.0))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    tags: Tags,
}

#[derive(Debug, Clone)]
struct Series {
    kind: MetricKind,
    value: f64,
    samples: u64,
}

/// Metrics sink that keeps every series in memory
///
/// Counters accumulate, gauges keep the last value and histograms keep a
/// running sum plus sample count.
#[derive(Debug, Default)]
pub struct HubMetrics {
    series: DashMap<SeriesKey, Series>,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of one series
    pub fn value(&self, name: &str, tags: &Tags) -> Option<f64> {
        let key = SeriesKey {
            name: name.to_string(),
            tags: tags.clone(),
        };
        self.series.get(&key).map(|s| s.value)
    }

    /// Sum of a metric across all tag sets
    pub fn counter(&self, name: &str) -> f64 {
        self.series
            .iter()
            .filter(|e| e.key().name == name)
            .map(|e| e.value().value)
            .sum()
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    fn sorted(&self) -> BTreeMap<SeriesKey, Series> {
        self.series
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Human-readable totals per metric name
    pub fn summary(&self) -> String {
        let mut totals: BTreeMap<String, (f64, u64)> = BTreeMap::new();
        for (key, series) in self.sorted() {
            let entry = totals.entry(key.name).or_insert((0.0, 0));
            entry.0 += series.value;
            entry.1 += series.samples;
        }

        let mut out = String::from("\n=== CONCORD METRICS ===\n");
        for (name, (value, samples)) in totals {
            let _ = writeln!(out, "{}: {} ({} samples)", name, value, samples);
        }
        out.push_str("=======================\n");
        out
    }

    /// Export in Prometheus text format
    pub fn prometheus(&self) -> String {
        let sorted = self.sorted();
        let mut out = String::new();
        let mut typed: BTreeSet<String> = BTreeSet::new();

        for (key, series) in &sorted {
            let name = format!("concord_{}", key.name);
            if typed.insert(name.clone()) {
                let kind = match series.kind {
                    MetricKind::Counter => "counter",
                    MetricKind::Gauge => "gauge",
                    MetricKind::Histogram => "summary",
                };
                let _ = writeln!(out, "# TYPE {} {}", name, kind);
            }

            let labels = render_labels(&key.tags);
            match series.kind {
                MetricKind::Histogram => {
                    let _ = writeln!(out, "{}_sum{} {}", name, labels, series.value);
                    let _ = writeln!(out, "{}_count{} {}", name, labels, series.samples);
                }
                _ => {
                    let _ = writeln!(out, "{}{} {}", name, labels, series.value);
                }
            }
        }
        out
    }

    pub fn log_summary(&self) {
        info!("{}", self.summary());
    }
}

fn render_labels(tags: &Tags) -> String {
    if tags.is_empty() {
        return String::new();
    }
    let inner: Vec<String> = tags
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", inner.join(","))
}

impl MetricsSink for HubMetrics {
    fn record_metric(&self, kind: MetricKind, name: &str, value: f64, tags: &Tags) {
        let key = SeriesKey {
            name: name.to_string(),
            tags: tags.clone(),
        };
        let mut series = self.series.entry(key).or_insert(Series {
            kind,
            value: 0.0,
            samples: 0,
        });
        series.samples += 1;
        match kind {
            MetricKind::Counter | MetricKind::Histogram => series.value += value,
            MetricKind::Gauge => series.value = value,
        }
    }
}
