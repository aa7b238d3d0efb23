//! Tempo sources that are not decks
//!
//! The internal clock free-runs at its own BPM and stands in as master when
//! no deck holds the role. The external clock is fed by another thread
//! (network link, soundcard word clock) through an [`ExternalClockHandle`].

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::AtomicF64;

/// Lowest BPM accepted for clocks and BPM writes
pub const MIN_BPM: f64 = 20.0;

/// Highest BPM accepted for clocks and BPM writes
pub const MAX_BPM: f64 = 400.0;

/// Tempo and continuous beat count reported by a source at a buffer start
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoReading {
    /// Tempo as heard, including the source's playback rate
    pub bpm: f64,
    /// Beats since an arbitrary origin; the fractional part is the phase
    pub beat_position: f64,
}

impl TempoReading {
    /// Phase within the current beat, in [0, 1)
    #[inline]
    pub fn phase(&self) -> f64 {
        self.beat_position.rem_euclid(1.0)
    }
}

/// Anything the master timebase can follow
pub trait TempoSource {
    /// Current reading, `None` when the source has no tempo
    fn tempo_reading(&self) -> Option<TempoReading>;
}

/// Beats covered at `bpm` in `seconds`
#[inline]
pub fn beats_in(bpm: f64, seconds: f64) -> f64 {
    bpm / 60.0 * seconds
}

/// Free-running clock owned by the audio thread
#[derive(Debug, Clone)]
pub struct InternalClock {
    bpm: f64,
    beat_position: f64,
}

impl InternalClock {
    pub fn new(bpm: f64) -> Self {
        Self {
            bpm: bpm.clamp(MIN_BPM, MAX_BPM),
            beat_position: 0.0,
        }
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Set the clock tempo, keeping the current phase
    pub fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm.clamp(MIN_BPM, MAX_BPM);
    }

    /// Run the clock forward by `seconds`
    pub fn advance(&mut self, seconds: f64) {
        self.beat_position += beats_in(self.bpm, seconds);
    }

    /// Copy tempo and beat count from the current master so that a later
    /// fallback continues where the master left off
    pub fn follow(&mut self, reading: TempoReading) {
        self.bpm = reading.bpm.clamp(MIN_BPM, MAX_BPM);
        self.beat_position = reading.beat_position;
    }
}

impl TempoSource for InternalClock {
    fn tempo_reading(&self) -> Option<TempoReading> {
        Some(TempoReading {
            bpm: self.bpm,
            beat_position: self.beat_position,
        })
    }
}

/// State shared between the external clock producer and the engine
#[derive(Debug, Default)]
struct ExternalClockState {
    bpm: AtomicF64,
    beat_position: AtomicF64,
    /// Seqlock counter: odd while a producer is writing, bumped by two per
    /// update so the engine can tell fresh data apart
    sequence: AtomicU64,
    connected: AtomicBool,
}

/// Producer side of the external clock
///
/// Owned by whatever thread decodes the network or hardware clock. Updates
/// are lock-free and never block the audio thread.
#[derive(Debug, Clone)]
pub struct ExternalClockHandle {
    state: Arc<ExternalClockState>,
}

impl ExternalClockHandle {
    /// Publish a new tempo and beat position
    pub fn update(&self, bpm: f64, beat_position: f64) {
        if !(bpm.is_finite() && beat_position.is_finite()) || bpm <= 0.0 {
            log::warn!("External clock: ignoring invalid update bpm={} beat={}", bpm, beat_position);
            return;
        }
        let sequence = self.begin_write();
        self.state.bpm.store(bpm.clamp(MIN_BPM, MAX_BPM), Ordering::Relaxed);
        self.state.beat_position.store(beat_position, Ordering::Relaxed);
        self.state.connected.store(true, Ordering::Relaxed);
        self.state.sequence.store(sequence + 2, Ordering::Release);
    }

    /// Claim the write side by moving the sequence from even to odd
    ///
    /// Handles are cloneable, so concurrent producers take turns here. The
    /// audio thread never waits on this.
    fn begin_write(&self) -> u64 {
        let mut sequence = self.state.sequence.load(Ordering::Relaxed);
        loop {
            if sequence & 1 == 1 {
                std::hint::spin_loop();
                sequence = self.state.sequence.load(Ordering::Relaxed);
                continue;
            }
            match self.state.sequence.compare_exchange_weak(
                sequence,
                sequence + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => sequence = current,
            }
        }
        fence(Ordering::Release);
        sequence
    }

    /// Mark the clock as gone; the engine falls back to the internal clock
    pub fn disconnect(&self) {
        self.state.connected.store(false, Ordering::Release);
        log::info!("External clock disconnected");
    }
}

/// Reads of the external clock state per buffer before giving up
const POLL_ATTEMPTS: usize = 4;

/// Engine side of the external clock
///
/// Between producer updates the clock extrapolates at the last known BPM.
#[derive(Debug)]
pub struct ExternalClock {
    state: Arc<ExternalClockState>,
    seen_sequence: u64,
    bpm: f64,
    beat_position: f64,
    connected: bool,
}

impl ExternalClock {
    /// Create a connected pair
    pub fn new() -> (Self, ExternalClockHandle) {
        let state = Arc::new(ExternalClockState::default());
        let clock = Self {
            state: Arc::clone(&state),
            seen_sequence: 0,
            bpm: 0.0,
            beat_position: 0.0,
            connected: false,
        };
        (clock, ExternalClockHandle { state })
    }

    /// Pick up the latest producer update, if any. Called at buffer start.
    ///
    /// A torn read is retried a few times; if the producer keeps writing the
    /// previous values stay in use until the next buffer.
    pub fn poll(&mut self) {
        for _ in 0..POLL_ATTEMPTS {
            let before = self.state.sequence.load(Ordering::Acquire);
            if before & 1 == 1 {
                continue;
            }
            if before == self.seen_sequence {
                break;
            }
            let bpm = self.state.bpm.load(Ordering::Relaxed);
            let beat_position = self.state.beat_position.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if self.state.sequence.load(Ordering::Relaxed) == before {
                self.seen_sequence = before;
                self.bpm = bpm;
                self.beat_position = beat_position;
                break;
            }
        }
        self.connected = self.state.connected.load(Ordering::Acquire) && self.seen_sequence > 0;
    }

    /// Extrapolate between producer updates
    pub fn advance(&mut self, seconds: f64) {
        if self.connected {
            self.beat_position += beats_in(self.bpm, seconds);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl TempoSource for ExternalClock {
    fn tempo_reading(&self) -> Option<TempoReading> {
        self.connected.then_some(TempoReading {
            bpm: self.bpm,
            beat_position: self.beat_position,
        })
    }
}
