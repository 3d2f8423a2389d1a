// Wire formats: the probe payload carried through the broker, and the NATS
// client protocol used to reach a real broker.
pub mod nats;
mod probe;

pub use probe::{ProbePayload, SENTINEL, TimeUnit};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("malformed probe payload: {0:?}")]
    MalformedPayload(String),
    #[error("unknown time unit: {0}")]
    UnknownTimeUnit(String),
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
    #[error("payload too large ({size} > {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("protocol error: {0}")]
    Protocol(String),
}
