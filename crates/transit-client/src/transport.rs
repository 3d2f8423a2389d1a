// Capabilities the probe needs from a broker, independent of the transport.
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("invalid broker address: {0:?}")]
    InvalidAddress(String),
    #[error("invalid start position: {0:?} (expected oldest, newest or an offset)")]
    InvalidStartPosition(String),
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("connection closed")]
    Closed,
    #[error("server error: {0}")]
    Server(String),
    #[error("unsupported by this transport: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] transit_wire::Error),
    #[error(transparent)]
    Broker(#[from] transit_broker::BrokerError),
    #[error("kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    Oldest,
    #[default]
    Newest,
    Offset(u64),
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPosition::Oldest => f.write_str("oldest"),
            StartPosition::Newest => f.write_str("newest"),
            StartPosition::Offset(offset) => write!(f, "{offset}"),
        }
    }
}

impl FromStr for StartPosition {
    type Err = TransportError;

    fn from_str(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "oldest" => Ok(StartPosition::Oldest),
            "newest" => Ok(StartPosition::Newest),
            other => other
                .parse::<u64>()
                .map(StartPosition::Offset)
                .map_err(|_| TransportError::InvalidStartPosition(input.to_string())),
        }
    }
}

/// A message handed out by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Bytes,
    /// Transport position of the message: the partition offset for the
    /// in-process broker, the per-subscription sequence number for NATS.
    pub position: u64,
}

#[async_trait]
pub trait Publish: Send {
    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()>;
}

#[async_trait]
pub trait Subscribe: Send {
    async fn subscribe(
        &mut self,
        topic: &str,
        start: StartPosition,
    ) -> Result<Box<dyn Subscription>>;
}

#[async_trait]
impl<P: Publish + ?Sized> Publish for Box<P> {
    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()> {
        (**self).publish(topic, payload).await
    }
}

#[async_trait]
impl<S: Subscribe + ?Sized> Subscribe for Box<S> {
    async fn subscribe(
        &mut self,
        topic: &str,
        start: StartPosition,
    ) -> Result<Box<dyn Subscription>> {
        (**self).subscribe(topic, start).await
    }
}

/// Lazy feed of deliveries interleaved with transport-reported errors.
#[async_trait]
pub trait Subscription: Send {
    /// `None` once the feed is closed for good.
    async fn next(&mut self) -> Option<Result<Delivery>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_position_parses() {
        assert_eq!("oldest".parse::<StartPosition>().expect("oldest"), StartPosition::Oldest);
        assert_eq!("NEWEST".parse::<StartPosition>().expect("newest"), StartPosition::Newest);
        assert_eq!(
            "42".parse::<StartPosition>().expect("offset"),
            StartPosition::Offset(42)
        );
        assert!(matches!(
            "-1".parse::<StartPosition>(),
            Err(TransportError::InvalidStartPosition(_))
        ));
        assert_eq!(StartPosition::Offset(7).to_string(), "7");
    }
}
