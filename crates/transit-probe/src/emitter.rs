// Periodic probe publisher.
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use transit_client::Publish;
use transit_wire::{ProbePayload, TimeUnit};

use crate::clock::{Clock, SystemClock};
use crate::{ProbeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmitterSummary {
    pub emitted: u64,
}

/// Publishes one probe per tick: the sentinel first, then timestamps.
pub struct ProbeEmitter<P, C = SystemClock> {
    publisher: P,
    topic: String,
    unit: TimeUnit,
    tick: Duration,
    clock: C,
    emitted: u64,
}

impl<P: Publish> ProbeEmitter<P> {
    pub fn new(publisher: P, topic: impl Into<String>, unit: TimeUnit, tick: Duration) -> Result<Self> {
        Self::with_clock(publisher, topic, unit, tick, SystemClock)
    }
}

impl<P: Publish, C: Clock> ProbeEmitter<P, C> {
    pub fn with_clock(
        publisher: P,
        topic: impl Into<String>,
        unit: TimeUnit,
        tick: Duration,
        clock: C,
    ) -> Result<Self> {
        if tick.is_zero() {
            return Err(ProbeError::InvalidPeriod("tick"));
        }
        Ok(Self {
            publisher,
            topic: topic.into(),
            unit,
            tick,
            clock,
            emitted: 0,
        })
    }

    /// The payload the next tick publishes.
    pub fn next_payload(&self) -> ProbePayload {
        if self.emitted == 0 {
            ProbePayload::Clear
        } else {
            ProbePayload::timestamp(self.clock.now(self.unit))
        }
    }

    /// Publishes the next payload immediately.
    pub async fn emit_once(&mut self) -> Result<ProbePayload> {
        let payload = self.next_payload();
        self.publisher
            .publish(&self.topic, payload.encode())
            .await
            .map_err(|source| ProbeError::Publish {
                topic: self.topic.clone(),
                source,
            })?;
        self.emitted += 1;
        metrics::counter!("transit_probe_published_total").increment(1);
        tracing::trace!(topic = %self.topic, value = payload.value(), "probe published");
        Ok(payload)
    }

    /// Emits on every tick until `shutdown` resolves or a publish fails.
    ///
    /// The first probe goes out one tick after start. Ticks missed while a
    /// publish was in flight are skipped, not replayed.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<EmitterSummary> {
        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        tracing::info!(
            topic = %self.topic,
            tick_us = self.tick.as_micros() as u64,
            unit = %self.unit,
            "probe emitter started"
        );
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.emit_once().await?;
                }
            }
        }
        tracing::info!(topic = %self.topic, emitted = self.emitted, "probe emitter stopped");
        Ok(EmitterSummary {
            emitted: self.emitted,
        })
    }
}
