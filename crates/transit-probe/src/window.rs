//! Time-bounded accumulation of latency samples.
//!
//! A window closes once the cumulative spacing between sample arrivals reaches
//! the configured period. Spacing is measured from the window's anchor: a
//! window opened at start-up or by the previous window closing is anchored at
//! that instant, a window opened by a clear is anchored at its first sample.
//! A burst of samples arriving at once therefore never closes a window early.
use std::time::Duration;
use transit_wire::TimeUnit;

use crate::{ProbeError, Result};

/// Samples and timing of the window currently being filled.
///
/// Times are raw readings in the probe's [`TimeUnit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowState {
    samples: Vec<f64>,
    t0: Option<i64>,
    sumtime: i64,
}

impl WindowState {
    /// Empty window whose first sample sets the baseline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty window whose spacing is counted from `now`.
    pub fn anchored_at(now: i64) -> Self {
        Self {
            t0: Some(now),
            ..Self::default()
        }
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn t0(&self) -> Option<i64> {
        self.t0
    }

    pub fn sumtime(&self) -> i64 {
        self.sumtime
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decides when a [`WindowState`] is complete and resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAggregator {
    period: i64,
}

impl WindowAggregator {
    /// `period` is in the same unit as the arrival times passed to [`accept`].
    ///
    /// [`accept`]: WindowAggregator::accept
    pub fn new(period: i64) -> Result<Self> {
        if period <= 0 {
            return Err(ProbeError::InvalidPeriod("window"));
        }
        Ok(Self { period })
    }

    pub fn from_duration(period: Duration, unit: TimeUnit) -> Result<Self> {
        Self::new(unit.from_duration(period))
    }

    pub fn period(&self) -> i64 {
        self.period
    }

    /// Adds a sample that arrived at `now`.
    ///
    /// Returns the window's samples when this sample completes it; the state
    /// is reset in the same call and the next window is anchored at `now`.
    pub fn accept(&self, state: &mut WindowState, sample: f64, now: i64) -> Option<Vec<f64>> {
        let t0 = *state.t0.get_or_insert(now);
        // Arrivals are not guaranteed monotonic across clock adjustments.
        state.sumtime = state.sumtime.saturating_add(now.saturating_sub(t0).max(0));
        state.t0 = Some(now);
        state.samples.push(sample);

        if state.sumtime < self.period {
            return None;
        }
        let completed = std::mem::replace(state, WindowState::anchored_at(now));
        Some(completed.samples).filter(|samples| !samples.is_empty())
    }

    /// Drops everything accumulated so far without reporting it.
    ///
    /// Returns the number of samples discarded.
    pub fn clear(&self, state: &mut WindowState) -> usize {
        std::mem::take(state).samples.len()
    }
}
