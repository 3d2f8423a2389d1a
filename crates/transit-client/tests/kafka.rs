// Kafka transport against librdkafka's in-process mock cluster.
use bytes::Bytes;
use rdkafka::mocking::MockCluster;
use std::time::Duration;
use transit_client::{
    KafkaClient, KafkaConfig, Publish, StartPosition, Subscribe, Subscription, TransportError,
};

const TOPIC: &str = "topic007";
const WAIT: Duration = Duration::from_secs(10);

fn config(partition: i32) -> KafkaConfig {
    KafkaConfig {
        client_id: Some("probe-test".to_string()),
        partition,
        connect_timeout: WAIT,
        delivery_timeout: WAIT,
    }
}

async fn next_payload(sub: &mut Box<dyn Subscription>) -> anyhow::Result<(u64, Bytes)> {
    let delivery = tokio::time::timeout(WAIT, sub.next())
        .await?
        .expect("kafka feeds never end")?;
    Ok((delivery.position, delivery.payload))
}

#[tokio::test]
async fn offsets_select_where_the_partition_is_read() -> anyhow::Result<()> {
    let cluster = MockCluster::new(1)?;
    cluster.create_topic(TOPIC, 2, 1)?;
    let mut client = KafkaClient::connect(&[cluster.bootstrap_servers()], config(1)).await?;

    for payload in ["0", "1700000000000000", "1700000000500000"] {
        client.publish(TOPIC, Bytes::from(payload)).await?;
    }

    let mut oldest = client.subscribe(TOPIC, StartPosition::Oldest).await?;
    assert_eq!(next_payload(&mut oldest).await?, (0, Bytes::from_static(b"0")));
    assert_eq!(
        next_payload(&mut oldest).await?,
        (1, Bytes::from_static(b"1700000000000000"))
    );

    let mut explicit = client.subscribe(TOPIC, StartPosition::Offset(2)).await?;
    assert_eq!(
        next_payload(&mut explicit).await?,
        (2, Bytes::from_static(b"1700000000500000"))
    );

    // Partition 0 stays empty: everything went to the configured partition.
    let mut other = KafkaClient::connect(&[cluster.bootstrap_servers()], config(0)).await?;
    let mut empty = other.subscribe(TOPIC, StartPosition::Oldest).await?;
    assert!(
        tokio::time::timeout(Duration::from_millis(500), empty.next())
            .await
            .is_err()
    );
    Ok(())
}

#[tokio::test]
async fn newest_skips_what_was_published_before() -> anyhow::Result<()> {
    let cluster = MockCluster::new(1)?;
    cluster.create_topic(TOPIC, 1, 1)?;
    let mut client = KafkaClient::connect(&[cluster.bootstrap_servers()], config(0)).await?;
    for _ in 0..3 {
        client.publish(TOPIC, Bytes::from_static(b"0")).await?;
    }

    let mut newest = client.subscribe(TOPIC, StartPosition::Newest).await?;
    // The end offset resolves on the first fetch; keep publishing until one
    // of the new records shows up.
    let mut seen = None;
    for attempt in 0..20u32 {
        client
            .publish(TOPIC, Bytes::from(format!("17000000000{attempt:05}")))
            .await?;
        if let Ok(Some(delivery)) =
            tokio::time::timeout(Duration::from_millis(500), newest.next()).await
        {
            seen = Some(delivery?);
            break;
        }
    }
    let delivery = seen.expect("a record published after subscribing");
    assert!(delivery.position >= 3, "position {}", delivery.position);
    assert_ne!(delivery.payload, Bytes::from_static(b"0"));
    Ok(())
}

#[tokio::test]
async fn missing_partition_is_rejected_at_subscribe() -> anyhow::Result<()> {
    let cluster = MockCluster::new(1)?;
    cluster.create_topic(TOPIC, 2, 1)?;
    let mut client = KafkaClient::connect(&[cluster.bootstrap_servers()], config(5)).await?;
    let err = client
        .subscribe(TOPIC, StartPosition::Oldest)
        .await
        .err()
        .expect("partition 5 of 2");
    assert!(matches!(err, TransportError::Unsupported(_)), "{err}");
    Ok(())
}
