//! Tap tempo
//!
//! Averages the intervals between the last few taps. A pause longer than
//! the timeout starts a new measurement.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::clock::{MAX_BPM, MIN_BPM};

/// Tap tempo detector for one deck (control thread)
#[derive(Debug, Clone)]
pub struct TapTempo {
    last_tap: Option<Instant>,
    /// Intervals between consecutive taps, oldest first
    intervals: VecDeque<Duration>,
    history: usize,
    timeout: Duration,
}

impl TapTempo {
    /// `history` is the number of intervals averaged (at least 1)
    pub fn new(history: usize, timeout: Duration) -> Self {
        let history = history.max(1);
        Self {
            last_tap: None,
            intervals: VecDeque::with_capacity(history),
            history,
            timeout,
        }
    }

    /// Forget all taps
    pub fn reset(&mut self) {
        self.last_tap = None;
        self.intervals.clear();
    }

    /// Tap now
    pub fn tap(&mut self) -> Option<f64> {
        self.tap_at(Instant::now())
    }

    /// Register a tap at `now` and return the tempo once two taps are in
    ///
    /// Tempos outside the supported BPM range are not reported.
    pub fn tap_at(&mut self, now: Instant) -> Option<f64> {
        let previous = self.last_tap.replace(now);
        let interval = now.checked_duration_since(previous?)?;

        if interval > self.timeout || interval.is_zero() {
            self.intervals.clear();
            return None;
        }

        if self.intervals.len() == self.history {
            self.intervals.pop_front();
        }
        self.intervals.push_back(interval);

        let total: Duration = self.intervals.iter().sum();
        let average = total.as_secs_f64() / self.intervals.len() as f64;
        let bpm = 60.0 / average;
        (MIN_BPM..=MAX_BPM).contains(&bpm).then_some(bpm)
    }
}
