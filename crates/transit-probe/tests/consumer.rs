use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use transit_broker::{Broker, TopicMetadata};
use transit_client::{
    Delivery, InProcessClient, StartPosition, Subscribe, Subscription, TransportError,
};
use transit_probe::{
    Clock, CollectingReporter, LatencySampler, ManualClock, ProbeEmitter, ProbeError,
    ReportEvent, ClearReason, run_consumer,
};
use transit_wire::TimeUnit;

const EPOCH: Duration = Duration::from_secs(1_700_000_000);

// Yields scripted items, moving the shared clock forward before each one,
// then stays idle.
struct ScriptedSubscription {
    clock: ManualClock,
    items: VecDeque<(Duration, Option<transit_client::Result<Delivery>>)>,
}

#[async_trait]
impl Subscription for ScriptedSubscription {
    async fn next(&mut self) -> Option<transit_client::Result<Delivery>> {
        match self.items.pop_front() {
            Some((advance, item)) => {
                self.clock.advance(advance);
                item
            }
            None => std::future::pending().await,
        }
    }
}

fn delivery(clock: &ManualClock, latency: Duration, after: Duration, position: u64) -> Delivery {
    let sent_at = clock.elapsed() + after - latency;
    Delivery {
        payload: Bytes::from(TimeUnit::Micros.from_duration(sent_at).to_string()),
        position,
    }
}

#[tokio::test]
async fn transport_errors_leave_the_window_alone() -> anyhow::Result<()> {
    let clock = ManualClock::new(EPOCH);
    let second = Duration::from_secs(1);
    let ms = Duration::from_millis(1);
    let items = VecDeque::from([
        (second, Some(Ok(delivery(&clock, 4 * ms, second, 10)))),
        (second, Some(Err(TransportError::Server("slow consumer".to_string())))),
        (second, Some(Ok(delivery(&clock, 6 * ms, 3 * second, 11)))),
    ]);
    let subscription = ScriptedSubscription {
        clock: clock.clone(),
        items,
    };
    let mut sampler = LatencySampler::new(
        TimeUnit::Micros,
        Duration::from_secs(10),
        CollectingReporter::default(),
        clock.now(TimeUnit::Micros),
    )?;

    let summary = run_consumer(
        Box::new(subscription),
        &mut sampler,
        &clock,
        tokio::time::sleep(Duration::from_millis(50)),
    )
    .await?;

    assert_eq!(summary.received, 2);
    assert_eq!(summary.transport_errors, 1);
    assert_eq!(summary.last_position, Some(11));
    assert_eq!(sampler.window().samples(), &[4.0, 6.0]);
    // The error is not an arrival: spacing runs from start to the third second.
    assert_eq!(sampler.window().sumtime(), 3_000_000);
    assert!(sampler.reporter().events.is_empty());
    Ok(())
}

#[tokio::test]
async fn closed_subscription_is_fatal() -> anyhow::Result<()> {
    let clock = ManualClock::new(EPOCH);
    let items = VecDeque::from([
        (Duration::ZERO, Some(Ok(delivery(&clock, Duration::ZERO, Duration::ZERO, 3)))),
        (Duration::ZERO, None),
    ]);
    let subscription = ScriptedSubscription {
        clock: clock.clone(),
        items,
    };
    let mut sampler = LatencySampler::new(
        TimeUnit::Micros,
        Duration::from_secs(1),
        CollectingReporter::default(),
        clock.now(TimeUnit::Micros),
    )?;
    let err = run_consumer(
        Box::new(subscription),
        &mut sampler,
        &clock,
        std::future::pending(),
    )
    .await
    .expect_err("closed");
    assert!(matches!(
        err,
        ProbeError::SubscriptionClosed {
            received: 1,
            last_position: Some(3)
        }
    ));
    Ok(())
}

// Reads the paused tokio clock as if it were the wall clock.
#[derive(Clone, Copy)]
struct TokioClock {
    origin: Instant,
}

impl Clock for TokioClock {
    fn now(&self, unit: TimeUnit) -> i64 {
        unit.from_duration(EPOCH + self.origin.elapsed())
    }
}

#[tokio::test(start_paused = true)]
async fn emitter_and_consumer_through_in_process_broker() -> anyhow::Result<()> {
    let clock = TokioClock {
        origin: Instant::now(),
    };
    let broker = Arc::new(Broker::new());
    broker
        .register_topic("topic007", TopicMetadata::default())
        .await?;
    let mut consumer_client = InProcessClient::new(broker.clone());
    let subscription = consumer_client
        .subscribe("topic007", StartPosition::Newest)
        .await?;

    let emitter = ProbeEmitter::with_clock(
        InProcessClient::new(broker),
        "topic007",
        TimeUnit::Micros,
        Duration::from_millis(500),
        clock,
    )?;
    let mut sampler = LatencySampler::new(
        TimeUnit::Micros,
        Duration::from_secs(2),
        CollectingReporter::default(),
        clock.now(TimeUnit::Micros),
    )?;

    let (emitted, consumed) = tokio::join!(
        emitter.run(tokio::time::sleep(Duration::from_millis(5_250))),
        run_consumer(
            subscription,
            &mut sampler,
            &clock,
            tokio::time::sleep(Duration::from_millis(5_300)),
        ),
    );
    let emitted = emitted?;
    let consumed = consumed?;
    assert_eq!(emitted.emitted, 10);
    assert_eq!(consumed.received, 10);
    assert_eq!(consumed.last_position, Some(9));

    let reporter = sampler.reporter();
    assert_eq!(
        reporter.events.first(),
        Some(&ReportEvent::Cleared {
            reason: ClearReason::Sentinel,
            discarded: 0
        })
    );
    let counts: Vec<usize> = reporter.windows().map(|stats| stats.count).collect();
    assert_eq!(counts, vec![5, 4]);
    // Publish and delivery happen at the same paused instant.
    assert!(reporter.samples.iter().all(|latency| *latency == 0.0));
    Ok(())
}
