//! Kafka transport on librdkafka.
//!
//! A [`KafkaClient`] publishes to one partition of a topic and reads that
//! partition back through a manually assigned consumer, so `oldest`, `newest`
//! and explicit offsets map directly onto Kafka offsets. Delivery positions
//! are Kafka offsets.
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::metadata::Metadata;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::time::Duration;

use crate::transport::{
    Delivery, Publish, Result, StartPosition, Subscribe, Subscription, TransportError,
};

pub const DEFAULT_PORT: u16 = 9092;

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Reported to the cluster as `client.id`; also names the consumer group.
    pub client_id: Option<String>,
    /// Partition published to and assigned to the consumer.
    pub partition: i32,
    /// Bound on the initial metadata round trip.
    pub connect_timeout: Duration,
    /// Bound on a publish, queueing included.
    pub delivery_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            partition: 0,
            connect_timeout: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

/// Cloneable handle on one Kafka producer; every subscription gets its own
/// consumer.
#[derive(Clone)]
pub struct KafkaClient {
    bootstrap: String,
    config: KafkaConfig,
    producer: FutureProducer,
}

impl KafkaClient {
    /// Creates the producer and waits for cluster metadata, so an unreachable
    /// cluster fails here instead of on the first publish.
    pub async fn connect(brokers: &[String], config: KafkaConfig) -> Result<Self> {
        let bootstrap = bootstrap_servers(brokers)?;
        let producer: FutureProducer = producer_config(&bootstrap, &config).create()?;
        let client = Self {
            bootstrap,
            config,
            producer,
        };
        let metadata = client.metadata(None).await?;
        tracing::info!(
            bootstrap = %client.bootstrap,
            brokers = metadata.brokers().len(),
            partition = client.config.partition,
            "kafka cluster reachable"
        );
        Ok(client)
    }

    // librdkafka's metadata call blocks the calling thread.
    async fn metadata(&self, topic: Option<String>) -> Result<Metadata> {
        let producer = self.producer.clone();
        let timeout = self.config.connect_timeout;
        let metadata = tokio::task::spawn_blocking(move || {
            producer.client().fetch_metadata(topic.as_deref(), timeout)
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(metadata)
    }

    // Topics that do not exist yet may be auto-created; only a known
    // partition count is checked.
    async fn check_partition(&self, topic: &str) -> Result<()> {
        let metadata = self.metadata(Some(topic.to_string())).await?;
        let partitions = metadata
            .topics()
            .iter()
            .find(|entry| entry.name() == topic && entry.error().is_none())
            .map_or(0, |entry| entry.partitions().len());
        let wanted = usize::try_from(self.config.partition).unwrap_or(usize::MAX);
        if partitions > 0 && wanted >= partitions {
            return Err(TransportError::Unsupported(format!(
                "partition {} of {topic} (topic has {partitions})",
                self.config.partition
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Publish for KafkaClient {
    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()> {
        let record = FutureRecord::<(), [u8]>::to(topic)
            .payload(&payload[..])
            .partition(self.config.partition);
        self.producer
            .send(record, self.config.delivery_timeout)
            .await
            .map(|_| ())
            .map_err(|(err, _)| err.into())
    }
}

#[async_trait]
impl Subscribe for KafkaClient {
    async fn subscribe(
        &mut self,
        topic: &str,
        start: StartPosition,
    ) -> Result<Box<dyn Subscription>> {
        let offset = start_offset(start)?;
        self.check_partition(topic).await?;
        let consumer: StreamConsumer = consumer_config(&self.bootstrap, &self.config).create()?;
        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(topic, self.config.partition, offset)?;
        consumer.assign(&assignment)?;
        tracing::info!(
            topic,
            partition = self.config.partition,
            start = %start,
            "kafka partition assigned"
        );
        Ok(Box::new(KafkaSubscription { consumer }))
    }
}

/// Feed of one assigned partition. librdkafka reconnects on its own, so the
/// feed never ends; broker trouble surfaces as transport errors.
pub struct KafkaSubscription {
    consumer: StreamConsumer,
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        let delivery = match self.consumer.recv().await {
            Ok(message) => Ok(Delivery {
                payload: message
                    .payload()
                    .map(Bytes::copy_from_slice)
                    .unwrap_or_default(),
                position: u64::try_from(message.offset()).unwrap_or_default(),
            }),
            Err(err) => Err(err.into()),
        };
        Some(delivery)
    }
}

/// Maps a start position onto the Kafka offset the consumer is assigned at.
pub fn start_offset(start: StartPosition) -> Result<Offset> {
    match start {
        StartPosition::Oldest => Ok(Offset::Beginning),
        StartPosition::Newest => Ok(Offset::End),
        StartPosition::Offset(offset) => i64::try_from(offset)
            .map(Offset::Offset)
            .map_err(|_| TransportError::InvalidStartPosition(offset.to_string())),
    }
}

fn bootstrap_servers(brokers: &[String]) -> Result<String> {
    let mut servers = Vec::with_capacity(brokers.len());
    for broker in brokers {
        let trimmed = broker.trim();
        let address = trimmed
            .strip_prefix("kafka://")
            .or_else(|| trimmed.strip_prefix("tcp://"))
            .unwrap_or(trimmed);
        if address.is_empty() || address.contains(char::is_whitespace) || address.contains('/') {
            return Err(TransportError::InvalidAddress(broker.clone()));
        }
        let has_port = match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.ends_with(':') => {
                port.parse::<u16>()
                    .map_err(|_| TransportError::InvalidAddress(broker.clone()))?;
                true
            }
            _ => false,
        };
        if has_port {
            servers.push(address.to_string());
        } else {
            servers.push(format!("{address}:{DEFAULT_PORT}"));
        }
    }
    if servers.is_empty() {
        return Err(TransportError::InvalidAddress(String::new()));
    }
    Ok(servers.join(","))
}

fn producer_config(bootstrap: &str, config: &KafkaConfig) -> ClientConfig {
    let mut client = base_config(bootstrap, config);
    client
        .set(
            "message.timeout.ms",
            config.delivery_timeout.as_millis().max(1).to_string(),
        )
        // Probes go out one at a time; batching would show up as latency.
        .set("linger.ms", "0");
    client
}

fn consumer_config(bootstrap: &str, config: &KafkaConfig) -> ClientConfig {
    let mut client = base_config(bootstrap, config);
    let group = config.client_id.as_deref().unwrap_or("consumer");
    client
        .set("group.id", format!("transit-probe-{group}"))
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false");
    client
}

fn base_config(bootstrap: &str, config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", bootstrap);
    if let Some(client_id) = &config.client_id {
        client.set("client.id", client_id);
    }
    client
}
