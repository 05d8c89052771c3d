//! Logging setup and metric recording

pub mod logging;
mod metrics;
mod sink;

pub use metrics::{smooth, smooth_duration, HubMetrics, SMOOTHING_ALPHA};
pub use sink::{tags, MetricKind, MetricsSink, NoopSink, Tags, TracingSink};

#[cfg(test)]
pub use sink::MockMetricsSink;
