use std::collections::BTreeMap;
use tracing::debug;

/// Metric tags, ordered so exported series are stable
pub type Tags = BTreeMap<String, String>;

/// Build a tag map from borrowed pairs
pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// Destination for metrics emitted by the hub, consensus and workflow engines
#[cfg_attr(test, mockall::automock)]
pub trait MetricsSink: Send + Sync {
    fn record_metric(&self, kind: MetricKind, name: &str, value: f64, tags: &Tags);
}

/// Writes every metric as a debug event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record_metric(&self, kind: MetricKind, name: &str, value: f64, tags: &Tags) {
        debug!(
            target: "concord::metrics",
            "{} {} = {} {:?}",
            kind.as_str(),
            name,
            value,
            tags
        );
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record_metric(&self, _kind: MetricKind, _name: &str, _value: f64, _tags: &Tags) {}
}
