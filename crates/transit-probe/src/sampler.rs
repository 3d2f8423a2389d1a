use std::time::Duration;
use transit_wire::{ProbePayload, TimeUnit};

use crate::Result;
use crate::report::{ClearReason, Reporter};
use crate::stats::{WindowStats, summarize};
use crate::window::{WindowAggregator, WindowState};

/// What a single payload did to the window.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    Recorded { latency_ms: f64 },
    Completed { latency_ms: f64, stats: WindowStats },
    Cleared { reason: ClearReason, discarded: usize },
}

/// Turns received probe payloads into latency samples and feeds the window.
///
/// The window is created at construction; pass the subscription start time
/// so the first window's spacing counts from there.
pub struct LatencySampler<R> {
    unit: TimeUnit,
    aggregator: WindowAggregator,
    state: WindowState,
    reporter: R,
    unit_warned: bool,
}

impl<R: Reporter> LatencySampler<R> {
    pub fn new(unit: TimeUnit, period: Duration, reporter: R, started_at: i64) -> Result<Self> {
        Ok(Self {
            unit,
            aggregator: WindowAggregator::from_duration(period, unit)?,
            state: WindowState::anchored_at(started_at),
            reporter,
            unit_warned: false,
        })
    }

    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    pub fn window(&self) -> &WindowState {
        &self.state
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Handles one payload received at `now` (in the sampler's unit).
    pub fn handle(&mut self, payload: &[u8], now: i64) -> SampleOutcome {
        let sent_at = match ProbePayload::decode(payload) {
            Ok(ProbePayload::Timestamp(sent_at)) => sent_at,
            Ok(ProbePayload::Clear) => return self.clear(ClearReason::Sentinel),
            Err(err) => return self.clear(ClearReason::Malformed(err.to_string())),
        };
        self.check_unit(sent_at);

        let latency_ms = self.unit.to_millis(now.saturating_sub(sent_at));
        self.reporter.sample(latency_ms);
        let Some(samples) = self.aggregator.accept(&mut self.state, latency_ms, now) else {
            return SampleOutcome::Recorded { latency_ms };
        };
        match summarize(&samples) {
            Some(stats) => {
                self.reporter.window(&stats);
                SampleOutcome::Completed { latency_ms, stats }
            }
            None => SampleOutcome::Recorded { latency_ms },
        }
    }

    fn clear(&mut self, reason: ClearReason) -> SampleOutcome {
        let discarded = self.aggregator.clear(&mut self.state);
        self.reporter.cleared(&reason, discarded);
        SampleOutcome::Cleared { reason, discarded }
    }

    fn check_unit(&mut self, sent_at: i64) {
        if !self.unit_warned
            && let Some(inferred) = TimeUnit::infer(sent_at)
            && inferred != self.unit
        {
            self.unit_warned = true;
            tracing::warn!(
                configured = %self.unit,
                inferred = %inferred,
                sent_at,
                "probe timestamp looks like a different time unit; latencies will be wrong"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{CollectingReporter, ReportEvent};

    const MS: i64 = 1_000;
    const BASE: i64 = 1_700_000_000_000_000;

    fn sampler(period_ms: u64) -> LatencySampler<CollectingReporter> {
        LatencySampler::new(
            TimeUnit::Micros,
            Duration::from_millis(period_ms),
            CollectingReporter::default(),
            BASE,
        )
        .expect("sampler")
    }

    fn probe(sent_at: i64) -> Vec<u8> {
        sent_at.to_string().into_bytes()
    }

    #[test]
    fn latency_is_receive_minus_send_in_ms() {
        let mut sampler = sampler(10_000);
        let outcome = sampler.handle(&probe(BASE), BASE + 12_500);
        assert_eq!(outcome, SampleOutcome::Recorded { latency_ms: 12.5 });
        assert_eq!(sampler.window().samples(), &[12.5]);
    }

    #[test]
    fn nanosecond_probes() {
        let base_ns = BASE * 1_000;
        let mut sampler = LatencySampler::new(
            TimeUnit::Nanos,
            Duration::from_secs(1),
            CollectingReporter::default(),
            base_ns,
        )
        .expect("sampler");
        let outcome = sampler.handle(&probe(base_ns), base_ns + 3_000_000);
        assert_eq!(outcome, SampleOutcome::Recorded { latency_ms: 3.0 });
    }

    #[test]
    fn sentinel_clears_without_a_sample() {
        let mut sampler = sampler(10_000);
        sampler.handle(&probe(BASE), BASE + MS);
        let outcome = sampler.handle(b"0", BASE + 2 * MS);
        assert_eq!(
            outcome,
            SampleOutcome::Cleared {
                reason: ClearReason::Sentinel,
                discarded: 1
            }
        );
        assert!(sampler.window().is_empty());
        assert_eq!(sampler.window().t0(), None);
        assert_eq!(sampler.reporter().samples, vec![1.0]);
    }

    #[test]
    fn malformed_payload_clears_and_is_reported_distinctly() {
        let mut sampler = sampler(10_000);
        sampler.handle(&probe(BASE), BASE + MS);
        let outcome = sampler.handle(b"not-a-number", BASE + 2 * MS);
        let SampleOutcome::Cleared {
            reason: ClearReason::Malformed(_),
            discarded: 1,
        } = &outcome
        else {
            panic!("expected malformed clear, got {outcome:?}");
        };
        let events = &sampler.reporter().events;
        assert!(matches!(
            events.as_slice(),
            [ReportEvent::Cleared {
                reason: ClearReason::Malformed(_),
                ..
            }]
        ));
    }

    #[test]
    fn clock_skew_yields_negative_latency() {
        let mut sampler = sampler(10_000);
        let outcome = sampler.handle(&probe(BASE + 2 * MS), BASE);
        assert_eq!(outcome, SampleOutcome::Recorded { latency_ms: -2.0 });
    }

    #[test]
    fn unit_mismatch_still_records() {
        let mut sampler = sampler(10_000);
        let nanos = BASE * 1_000;
        let outcome = sampler.handle(&probe(nanos), BASE);
        assert!(matches!(outcome, SampleOutcome::Recorded { .. }));
        assert!(sampler.unit_warned);
    }
}
