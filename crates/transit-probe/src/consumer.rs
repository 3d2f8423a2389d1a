// Serialized receive loop: one delivery, error or shutdown at a time.
use std::future::Future;
use transit_client::Subscription;

use crate::clock::Clock;
use crate::report::Reporter;
use crate::sampler::LatencySampler;
use crate::{ProbeError, Result};

/// Counters of a finished consumer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerSummary {
    pub received: u64,
    pub transport_errors: u64,
    /// Position of the last message handed to the sampler.
    pub last_position: Option<u64>,
}

/// Feeds deliveries from `subscription` into `sampler` until `shutdown`.
///
/// Transport errors are logged and counted and leave the window alone. A
/// subscription that ends on its own is fatal. Whatever sits in the window at
/// shutdown is discarded.
pub async fn run_consumer<R, C>(
    mut subscription: Box<dyn Subscription>,
    sampler: &mut LatencySampler<R>,
    clock: &C,
    shutdown: impl Future<Output = ()>,
) -> Result<ConsumerSummary>
where
    R: Reporter,
    C: Clock,
{
    let mut summary = ConsumerSummary::default();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            next = subscription.next() => match next {
                Some(Ok(delivery)) => {
                    let now = clock.now(sampler.unit());
                    sampler.handle(&delivery.payload, now);
                    summary.received += 1;
                    summary.last_position = Some(delivery.position);
                }
                Some(Err(err)) => {
                    summary.transport_errors += 1;
                    metrics::counter!("transit_transport_errors_total").increment(1);
                    tracing::warn!(error = %err, "transport reported a delivery error");
                }
                None => {
                    tracing::error!(
                        received = summary.received,
                        last_position = ?summary.last_position,
                        "subscription closed"
                    );
                    return Err(ProbeError::SubscriptionClosed {
                        received: summary.received,
                        last_position: summary.last_position,
                    });
                }
            },
        }
    }
    tracing::info!(
        received = summary.received,
        transport_errors = summary.transport_errors,
        last_position = ?summary.last_position,
        pending_samples = sampler.window().len(),
        "consumer stopped"
    );
    Ok(summary)
}
