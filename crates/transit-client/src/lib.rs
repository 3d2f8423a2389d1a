// Broker clients behind a transport-neutral Publish/Subscribe seam.
pub mod inprocess;
pub mod kafka;
pub mod nats;
pub mod transport;

pub use inprocess::InProcessClient;
pub use kafka::{KafkaClient, KafkaConfig};
pub use nats::{NatsClient, NatsConfig};
pub use transport::{
    Delivery, Publish, Result, StartPosition, Subscribe, Subscription, TransportError,
};
