// In-process broker client.
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use transit_broker::{
    Broker, BrokerError, Cursor, Record, Subscription as BrokerSubscription,
};

use crate::transport::{Delivery, Publish, Result, StartPosition, Subscribe, Subscription};

/// Client bound to one partition of a broker running in this process.
///
/// ```
/// use bytes::Bytes;
/// use std::sync::Arc;
/// use transit_broker::{Broker, TopicMetadata};
/// use transit_client::{InProcessClient, Publish, StartPosition, Subscribe};
///
/// let broker = Arc::new(Broker::new());
/// let mut client = InProcessClient::new(broker.clone());
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     broker
///         .register_topic("probe", TopicMetadata::default())
///         .await
///         .expect("register");
///     let mut sub = client
///         .subscribe("probe", StartPosition::Newest)
///         .await
///         .expect("subscribe");
///     client
///         .publish("probe", Bytes::from_static(b"0"))
///         .await
///         .expect("publish");
///     let delivery = sub.next().await.expect("open").expect("delivery");
///     assert_eq!(delivery.payload, Bytes::from_static(b"0"));
/// });
/// ```
#[derive(Clone)]
pub struct InProcessClient {
    broker: Arc<Broker>,
    partition: u32,
}

impl InProcessClient {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            partition: 0,
        }
    }

    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = partition;
        self
    }

    async fn subscribe_from_head(
        &self,
        topic: &str,
    ) -> Result<(Vec<Record>, BrokerSubscription)> {
        let mut cursor = self.broker.cursor_head(topic, self.partition).await?;
        loop {
            match self
                .broker
                .subscribe_at(topic, self.partition, cursor)
                .await
            {
                Ok(found) => return Ok(found),
                // The log was trimmed between reading the head and subscribing.
                Err(BrokerError::OffsetTooOld { oldest, .. }) => cursor = Cursor::at(oldest),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[async_trait]
impl Publish for InProcessClient {
    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()> {
        self.broker.publish(topic, self.partition, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl Subscribe for InProcessClient {
    async fn subscribe(
        &mut self,
        topic: &str,
        start: StartPosition,
    ) -> Result<Box<dyn Subscription>> {
        let (backlog, live) = match start {
            StartPosition::Newest => (
                Vec::new(),
                self.broker.subscribe(topic, self.partition).await?,
            ),
            StartPosition::Oldest => self.subscribe_from_head(topic).await?,
            StartPosition::Offset(offset) => {
                self.broker
                    .subscribe_at(topic, self.partition, Cursor::at(offset))
                    .await?
            }
        };
        tracing::debug!(
            topic,
            partition = self.partition,
            %start,
            backlog = backlog.len(),
            "in-process subscription opened"
        );
        Ok(Box::new(InProcessSubscription {
            backlog: backlog.into(),
            live,
        }))
    }
}

// Replays the backlog first, then follows the live feed.
struct InProcessSubscription {
    backlog: VecDeque<Record>,
    live: BrokerSubscription,
}

#[async_trait]
impl Subscription for InProcessSubscription {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        if let Some(record) = self.backlog.pop_front() {
            return Some(Ok(Delivery {
                payload: record.payload,
                position: record.offset,
            }));
        }
        let envelope = self.live.recv().await?;
        let record = envelope.into_record();
        Some(Ok(Delivery {
            payload: record.payload,
            position: record.offset,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transit_broker::TopicMetadata;

    async fn client_with_history(partitions: u32, history: &[&'static str]) -> InProcessClient {
        let broker = Arc::new(Broker::new());
        broker
            .register_topic("probe", TopicMetadata { partitions })
            .await
            .expect("register");
        let mut client = InProcessClient::new(broker);
        for payload in history {
            client
                .publish("probe", Bytes::from_static(payload.as_bytes()))
                .await
                .expect("publish");
        }
        client
    }

    async fn next_payload(sub: &mut Box<dyn Subscription>) -> (u64, Bytes) {
        let delivery = sub.next().await.expect("open").expect("delivery");
        (delivery.position, delivery.payload)
    }

    #[tokio::test]
    async fn newest_skips_history() {
        let mut client = client_with_history(1, &["1", "2"]).await;
        let mut sub = client
            .subscribe("probe", StartPosition::Newest)
            .await
            .expect("subscribe");
        client
            .publish("probe", Bytes::from_static(b"3"))
            .await
            .expect("publish");
        assert_eq!(next_payload(&mut sub).await, (2, Bytes::from_static(b"3")));
    }

    #[tokio::test]
    async fn oldest_replays_everything_then_follows() {
        let mut client = client_with_history(1, &["0", "5"]).await;
        let mut sub = client
            .subscribe("probe", StartPosition::Oldest)
            .await
            .expect("subscribe");
        client
            .publish("probe", Bytes::from_static(b"9"))
            .await
            .expect("publish");
        assert_eq!(next_payload(&mut sub).await, (0, Bytes::from_static(b"0")));
        assert_eq!(next_payload(&mut sub).await, (1, Bytes::from_static(b"5")));
        assert_eq!(next_payload(&mut sub).await, (2, Bytes::from_static(b"9")));
    }

    #[tokio::test]
    async fn explicit_offset_starts_mid_log() {
        let mut client = client_with_history(1, &["a", "b", "c"]).await;
        let mut sub = client
            .subscribe("probe", StartPosition::Offset(2))
            .await
            .expect("subscribe");
        assert_eq!(next_payload(&mut sub).await, (2, Bytes::from_static(b"c")));
    }

    #[tokio::test]
    async fn offset_past_tail_is_an_error() {
        let mut client = client_with_history(1, &["a"]).await;
        let result = client.subscribe("probe", StartPosition::Offset(5)).await;
        assert!(matches!(
            result,
            Err(crate::TransportError::Broker(BrokerError::OffsetOutOfRange { .. }))
        ));
    }

    #[tokio::test]
    async fn partition_selection_is_respected() {
        let client = client_with_history(2, &[]).await;
        let mut writer = client.clone().with_partition(1);
        let mut reader = client.clone().with_partition(1);
        let mut other = client.with_partition(0);
        let mut sub = reader
            .subscribe("probe", StartPosition::Newest)
            .await
            .expect("subscribe");
        let mut other_sub = other
            .subscribe("probe", StartPosition::Newest)
            .await
            .expect("subscribe");
        writer
            .publish("probe", Bytes::from_static(b"p1"))
            .await
            .expect("publish");
        assert_eq!(next_payload(&mut sub).await, (0, Bytes::from_static(b"p1")));
        let idle = tokio::time::timeout(std::time::Duration::from_millis(10), other_sub.next()).await;
        assert!(idle.is_err(), "partition 0 must stay quiet");
    }

    #[tokio::test]
    async fn unknown_topic_fails_setup() {
        let mut client = client_with_history(1, &[]).await;
        assert!(client.publish("nope", Bytes::new()).await.is_err());
        assert!(client.subscribe("nope", StartPosition::Newest).await.is_err());
    }
}
