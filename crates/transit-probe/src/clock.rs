// Time sources for probe timestamps and arrival times.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use transit_wire::TimeUnit;

/// Unix-epoch clock read in a caller-chosen unit.
pub trait Clock: Send + Sync {
    fn now(&self, unit: TimeUnit) -> i64;
}

/// The host wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self, unit: TimeUnit) -> i64 {
        unit.now()
    }
}

/// Hand-driven clock. Clones observe the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    since_epoch_ns: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(since_epoch: Duration) -> Self {
        let clock = Self::default();
        clock.set(since_epoch);
        clock
    }

    pub fn set(&self, since_epoch: Duration) {
        self.since_epoch_ns
            .store(duration_to_nanos(since_epoch), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.since_epoch_ns
            .fetch_add(duration_to_nanos(by), Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.since_epoch_ns.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now(&self, unit: TimeUnit) -> i64 {
        unit.from_duration(self.elapsed())
    }
}

fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
