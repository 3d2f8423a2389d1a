// Where sampler outcomes end up: logs and metrics, or memory for tests.
use crate::stats::WindowStats;

/// Why a window was dropped without a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearReason {
    /// The producer sent the clearing sentinel.
    Sentinel,
    /// The payload was not an integer timestamp.
    Malformed(String),
}

impl ClearReason {
    pub fn as_label(&self) -> &'static str {
        match self {
            ClearReason::Sentinel => "sentinel",
            ClearReason::Malformed(_) => "malformed",
        }
    }
}

/// Receives everything the sampler observes.
pub trait Reporter: Send {
    /// One latency sample, before it is added to the window.
    fn sample(&mut self, _latency_ms: f64) {}

    /// A completed window.
    fn window(&mut self, stats: &WindowStats);

    /// A window dropped by a clear; `discarded` samples never got reported.
    fn cleared(&mut self, reason: &ClearReason, discarded: usize);
}

/// Logs windows and clears with `tracing` and records them as metrics.
#[derive(Debug, Clone)]
pub struct TracingReporter {
    topic: String,
}

impl TracingReporter {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }
}

impl Reporter for TracingReporter {
    fn sample(&mut self, latency_ms: f64) {
        metrics::counter!("transit_probe_samples_total").increment(1);
        metrics::histogram!("transit_probe_latency_ms").record(latency_ms);
    }

    fn window(&mut self, stats: &WindowStats) {
        metrics::counter!("transit_probe_windows_total").increment(1);
        metrics::gauge!("transit_probe_window_min_ms").set(stats.min);
        metrics::gauge!("transit_probe_window_median_ms").set(stats.median);
        metrics::gauge!("transit_probe_window_max_ms").set(stats.max);
        metrics::gauge!("transit_probe_window_stddev_ms").set(stats.stddev);
        tracing::info!(
            topic = %self.topic,
            count = stats.count,
            min_ms = stats.min,
            median_ms = stats.median,
            max_ms = stats.max,
            mean_ms = stats.mean,
            stddev_ms = stats.stddev,
            "latency window"
        );
    }

    fn cleared(&mut self, reason: &ClearReason, discarded: usize) {
        metrics::counter!("transit_probe_clears_total", "reason" => reason.as_label())
            .increment(1);
        match reason {
            ClearReason::Sentinel => {
                tracing::info!(topic = %self.topic, discarded, "window cleared by sentinel");
            }
            ClearReason::Malformed(error) => tracing::warn!(
                topic = %self.topic,
                discarded,
                error = %error,
                "unparseable probe payload, window cleared"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportEvent {
    Window(WindowStats),
    Cleared { reason: ClearReason, discarded: usize },
}

/// Keeps every event in memory, in order.
#[derive(Debug, Clone, Default)]
pub struct CollectingReporter {
    pub samples: Vec<f64>,
    pub events: Vec<ReportEvent>,
}

impl CollectingReporter {
    pub fn windows(&self) -> impl Iterator<Item = &WindowStats> {
        self.events.iter().filter_map(|event| match event {
            ReportEvent::Window(stats) => Some(stats),
            ReportEvent::Cleared { .. } => None,
        })
    }
}

impl Reporter for CollectingReporter {
    fn sample(&mut self, latency_ms: f64) {
        self.samples.push(latency_ms);
    }

    fn window(&mut self, stats: &WindowStats) {
        self.events.push(ReportEvent::Window(*stats));
    }

    fn cleared(&mut self, reason: &ClearReason, discarded: usize) {
        self.events.push(ReportEvent::Cleared {
            reason: reason.clone(),
            discarded,
        });
    }
}
