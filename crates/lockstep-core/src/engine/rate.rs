//! Per-deck playback rate
//!
//! Combines the permanent rate slider, the temporary nudge, the sync
//! correction and an optional scratch rate into the rate handed to the
//! resampler:
//!
//! ```text
//! rate = base * (1 + permanent) * (1 + clamp(temporary + sync, -max_delta, max_delta))
//! ```

use crate::config::{RampingMode, SyncConfig};

/// Temporary offsets smaller than this count as fully released
const NUDGE_EPSILON: f64 = 1e-5;

/// Rate handed to the resampler / time-stretcher for one buffer
///
/// With keylock on, tempo changes go to the time-stretch path only and the
/// pitch stays at 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateOutput {
    /// Playback speed (0.0 when the deck is not moving)
    pub tempo_ratio: f64,
    /// Pitch shift ratio
    pub pitch_ratio: f64,
}

impl Default for RateOutput {
    fn default() -> Self {
        Self {
            tempo_ratio: 0.0,
            pitch_ratio: 1.0,
        }
    }
}

/// Rate state of one deck
#[derive(Debug, Clone)]
pub struct RateControl {
    base_rate: f64,
    permanent: f64,
    temporary: f64,
    sync_correction: f64,
    nudge_up: bool,
    nudge_down: bool,
    scratch: Option<f64>,
}

impl Default for RateControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RateControl {
    pub fn new() -> Self {
        Self {
            base_rate: 1.0,
            permanent: 0.0,
            temporary: 0.0,
            sync_correction: 0.0,
            nudge_up: false,
            nudge_down: false,
            scratch: None,
        }
    }

    /// Back to natural speed with no offsets (track eject)
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn base_rate(&self) -> f64 {
        self.base_rate
    }

    /// Natural speed multiplier, e.g. sample-rate conversion of the track
    pub fn set_base_rate(&mut self, base_rate: f64) {
        if base_rate.is_finite() && base_rate > 0.0 {
            self.base_rate = base_rate;
        }
    }

    /// Permanent offset as a fraction (0.02 = +2%)
    pub fn permanent(&self) -> f64 {
        self.permanent
    }

    /// Set the permanent offset directly. Offsets at or below -100% would
    /// stop or reverse the deck and are rejected.
    pub fn set_permanent(&mut self, permanent: f64) {
        if permanent.is_finite() && permanent > -1.0 {
            self.permanent = permanent;
        }
    }

    /// Move the rate slider (-1..1)
    pub fn set_slider(&mut self, slider: f64, config: &SyncConfig) {
        let slider = slider.clamp(-1.0, 1.0);
        self.set_permanent(slider * config.rate_range * config.rate_direction());
    }

    /// Slider position matching the permanent offset. Sync can push the
    /// offset past the slider range, so the result is not clamped.
    pub fn slider(&self, config: &SyncConfig) -> f64 {
        self.permanent / (config.rate_range * config.rate_direction())
    }

    /// Permanent offset that makes a track at `local_bpm` play at `target_bpm`
    pub fn permanent_for_bpm(&self, target_bpm: f64, local_bpm: f64) -> Option<f64> {
        if !(target_bpm > 0.0 && local_bpm > 0.0) {
            return None;
        }
        Some(target_bpm / (local_bpm * self.base_rate) - 1.0)
    }

    /// Set the permanent offset so a track at `local_bpm` plays at `target_bpm`
    pub fn set_bpm(&mut self, target_bpm: f64, local_bpm: f64) {
        if let Some(permanent) = self.permanent_for_bpm(target_bpm, local_bpm) {
            self.set_permanent(permanent);
        }
    }

    pub fn temporary(&self) -> f64 {
        self.temporary
    }

    /// Hold state of the nudge buttons
    pub fn set_nudge(&mut self, up: bool, down: bool) {
        self.nudge_up = up;
        self.nudge_down = down;
    }

    pub fn nudge_buttons(&self) -> (bool, bool) {
        (self.nudge_up, self.nudge_down)
    }

    /// True while a nudge is held or still ramping back to zero
    pub fn is_nudging(&self) -> bool {
        self.nudge_up || self.nudge_down || self.temporary.abs() > NUDGE_EPSILON
    }

    pub fn sync_correction(&self) -> f64 {
        self.sync_correction
    }

    /// Sync correction for the next buffer, bounded by the phase correction limit
    pub fn set_sync_correction(&mut self, correction: f64, config: &SyncConfig) {
        self.sync_correction = if correction.is_finite() {
            correction.clamp(-config.max_phase_correction, config.max_phase_correction)
        } else {
            0.0
        };
    }

    /// Fold the current sync correction into the permanent offset
    ///
    /// Called when a deck stops following so its speed stays where sync
    /// left it instead of jumping by the correction amount.
    pub fn bake_sync_correction(&mut self) {
        let baked = (1.0 + self.permanent) * (1.0 + self.sync_correction) - 1.0;
        self.sync_correction = 0.0;
        self.set_permanent(baked);
    }

    pub fn scratch(&self) -> Option<f64> {
        self.scratch
    }

    /// Scratch / vinyl rate that overrides everything else while set
    pub fn set_scratch(&mut self, scratch: Option<f64>) {
        self.scratch = scratch.filter(|r| r.is_finite());
    }

    pub fn is_scratching(&self) -> bool {
        self.scratch.is_some()
    }

    /// Advance the nudge ramp by one buffer
    pub fn update_temporary(&mut self, config: &SyncConfig, frames: usize) {
        let mut target = 0.0;
        if self.nudge_up {
            target += config.temp_rate;
        }
        if self.nudge_down {
            target -= config.temp_rate;
        }

        self.temporary = match config.ramping {
            RampingMode::Stepping => target,
            RampingMode::Smooth => {
                let coeff = config.smoothing_coefficient(config.nudge_ramp_seconds, frames);
                let next = self.temporary + (target - self.temporary) * coeff;
                if target == 0.0 && next.abs() <= NUDGE_EPSILON {
                    0.0
                } else {
                    next
                }
            }
        };
    }

    /// Rate ignoring the sync correction
    pub fn rate_without_sync(&self, config: &SyncConfig) -> f64 {
        let delta = self.temporary.clamp(-config.max_delta, config.max_delta);
        self.base_rate * (1.0 + self.permanent) * (1.0 + delta)
    }

    /// Effective playback rate
    pub fn effective_rate(&self, config: &SyncConfig) -> f64 {
        if let Some(scratch) = self.scratch {
            return scratch;
        }
        let delta = (self.temporary + self.sync_correction).clamp(-config.max_delta, config.max_delta);
        self.base_rate * (1.0 + self.permanent) * (1.0 + delta)
    }

    /// Final rate handoff for the resampler
    pub fn output(&self, config: &SyncConfig, keylock: bool, moving: bool) -> RateOutput {
        if !moving {
            return RateOutput::default();
        }
        let tempo_ratio = self.effective_rate(config);
        // Keylock does not apply while scratching
        let pitch_ratio = if keylock && !self.is_scratching() {
            1.0
        } else {
            tempo_ratio
        };
        RateOutput {
            tempo_ratio,
            pitch_ratio,
        }
    }
}
