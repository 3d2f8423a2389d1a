// Wiring from a resolved ProbeConfig to running emitter and consumer loops.
use anyhow::{Context, Result, bail};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use transit_broker::{Broker, TopicMetadata};
use transit_client::{
    InProcessClient, KafkaClient, NatsClient, Publish, Subscribe, Subscription,
};
use transit_probe::{
    Clock, ConsumerSummary, EmitterSummary, LatencySampler, ProbeEmitter, SystemClock,
    TracingReporter, run_consumer,
};

use crate::config::{ProbeConfig, TransportKind};

// Both halves of one broker connection.
type Transport = (Box<dyn Publish>, Box<dyn Subscribe>);

/// Runs the emitter against the configured broker until `shutdown`.
pub async fn run_producer<F>(config: &ProbeConfig, shutdown: F) -> Result<EmitterSummary>
where
    F: Future<Output = ()>,
{
    let (publisher, _) = connect_remote(config).await?;
    let emitter = build_emitter(config, publisher)?;
    Ok(emitter.run(shutdown).await?)
}

/// Subscribes to the configured broker and runs the consumer loop until
/// `shutdown`.
pub async fn run_consumer_loop<F>(config: &ProbeConfig, shutdown: F) -> Result<ConsumerSummary>
where
    F: Future<Output = ()>,
{
    let (_, mut subscriber) = connect_remote(config).await?;
    let (subscription, mut sampler) = open_consumer(config, &mut subscriber).await?;
    Ok(run_consumer(subscription, &mut sampler, &SystemClock, shutdown).await?)
}

/// Emitter and consumer in one process, sharing one clock.
///
/// With the in-process transport the probe travels through a broker owned by
/// this process; with NATS or Kafka it makes a round trip through the cluster.
pub async fn run_loopback<F>(
    config: &ProbeConfig,
    shutdown: F,
) -> Result<(EmitterSummary, ConsumerSummary)>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (publisher, subscriber) = connect_loopback(config).await?;
    loopback(config, publisher, subscriber, shutdown).await
}

async fn loopback<F>(
    config: &ProbeConfig,
    publisher: Box<dyn Publish>,
    mut subscriber: Box<dyn Subscribe>,
    shutdown: F,
) -> Result<(EmitterSummary, ConsumerSummary)>
where
    F: Future<Output = ()> + Send + 'static,
{
    // The subscription must exist before the sentinel is published.
    let (subscription, mut sampler) = open_consumer(config, &mut subscriber).await?;

    // Either loop failing stops the other.
    let (stop, stopped) = watch::channel(false);
    let stop = Arc::new(stop);
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            shutdown.await;
            let _ = stop.send(true);
        });
    }

    let emitter = build_emitter(config, publisher)?;
    let emitter_task = {
        let stop = Arc::clone(&stop);
        let stopped = stopped.clone();
        tokio::spawn(async move {
            let result = emitter.run(wait_for_stop(stopped)).await;
            let _ = stop.send(true);
            result
        })
    };

    let consumed =
        run_consumer(subscription, &mut sampler, &SystemClock, wait_for_stop(stopped)).await;
    let _ = stop.send(true);
    let emitted = emitter_task.await.context("join emitter task")?;
    Ok((emitted?, consumed?))
}

async fn wait_for_stop(mut stopped: watch::Receiver<bool>) {
    let _ = stopped.wait_for(|stop| *stop).await;
}

async fn open_consumer<S>(
    config: &ProbeConfig,
    client: &mut S,
) -> Result<(Box<dyn Subscription>, LatencySampler<TracingReporter>)>
where
    S: Subscribe + ?Sized,
{
    let subscription = client
        .subscribe(&config.topic, config.offset)
        .await
        .with_context(|| format!("subscribe to {} at {}", config.topic, config.offset))?;
    tracing::info!(
        topic = %config.topic,
        offset = %config.offset,
        stat_period_ms = config.stat_period_ms,
        unit = %config.time_unit,
        "probe consumer started"
    );
    let sampler = LatencySampler::new(
        config.time_unit,
        config.stat_period(),
        TracingReporter::new(config.topic.clone()),
        SystemClock.now(config.time_unit),
    )?;
    Ok((subscription, sampler))
}

fn build_emitter(
    config: &ProbeConfig,
    publisher: Box<dyn Publish>,
) -> Result<ProbeEmitter<Box<dyn Publish>>> {
    Ok(ProbeEmitter::new(
        publisher,
        config.topic.clone(),
        config.time_unit,
        config.tick_period(),
    )?)
}

async fn connect_loopback(config: &ProbeConfig) -> Result<Transport> {
    if config.transport != TransportKind::InProcess {
        return connect_remote(config).await;
    }
    let broker = Arc::new(Broker::new());
    broker
        .register_topic(
            config.topic.clone(),
            TopicMetadata {
                partitions: config.partition.saturating_add(1),
            },
        )
        .await
        .context("register loopback topic")?;
    let client = InProcessClient::new(broker).with_partition(config.partition);
    Ok((Box::new(client.clone()), Box::new(client)))
}

// The standalone producer and consumer need a broker outside this process.
async fn connect_remote(config: &ProbeConfig) -> Result<Transport> {
    match config.transport {
        TransportKind::Nats => {
            let client = NatsClient::connect(&config.brokers, config.nats_config())
                .await
                .with_context(|| format!("connect to nats at {}", config.brokers.join(",")))?;
            Ok((Box::new(client.clone()), Box::new(client)))
        }
        TransportKind::Kafka => {
            let client = KafkaClient::connect(&config.brokers, config.kafka_config())
                .await
                .with_context(|| format!("connect to kafka at {}", config.brokers.join(",")))?;
            Ok((Box::new(client.clone()), Box::new(client)))
        }
        TransportKind::InProcess => {
            bail!("the in-process transport only works inside probe-loopback")
        }
    }
}
