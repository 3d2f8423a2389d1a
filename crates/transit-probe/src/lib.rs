//! Broker transit-latency probe.
//!
//! The emitter publishes the clearing sentinel and then one timestamp per
//! tick. On the receiving side the sampler turns each probe into a latency
//! sample and feeds a window that reports min/median/max/stddev once the
//! spacing between arrivals adds up to the configured period.
pub mod clock;
pub mod consumer;
pub mod emitter;
pub mod report;
pub mod sampler;
pub mod stats;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use consumer::{ConsumerSummary, run_consumer};
pub use emitter::{EmitterSummary, ProbeEmitter};
pub use report::{ClearReason, CollectingReporter, ReportEvent, Reporter, TracingReporter};
pub use sampler::{LatencySampler, SampleOutcome};
pub use stats::{WindowStats, summarize};
pub use window::{WindowAggregator, WindowState};

use transit_client::TransportError;

pub type Result<T> = std::result::Result<T, ProbeError>;

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("{0} period must be positive")]
    InvalidPeriod(&'static str),
    #[error("publish probe to {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: TransportError,
    },
    #[error("subscription closed after {received} messages (last position {last_position:?})")]
    SubscriptionClosed {
        received: u64,
        last_position: Option<u64>,
    },
}
