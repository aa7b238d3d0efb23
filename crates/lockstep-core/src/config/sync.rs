//! Sync engine configuration
//!
//! Tunable constants for rate control and the follower correction loop.
//! Gains are expressed in time units (seconds, rate per second) rather than
//! per-buffer steps so behaviour does not change with the audio buffer size.

use serde::{Deserialize, Serialize};

use crate::types::SAMPLE_RATE;

/// How a held nudge button moves the temporary rate offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RampingMode {
    /// Abrupt jump: full offset while held, zero on release
    Stepping,
    /// Exponential approach to the held offset and exponential decay on release
    #[default]
    Smooth,
}

/// Clock used as master when no deck holds the master role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    /// Free-running internal clock
    #[default]
    Internal,
    /// Network or soundcard clock fed from outside the engine
    External,
}

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Engine sample rate in Hz
    pub sample_rate: u32,

    /// Rate slider range as a fraction (0.08 = +/-8%)
    pub rate_range: f64,

    /// Flip the slider so that moving it up slows down (turntable layout)
    pub invert_rate_slider: bool,

    /// Temporary offset applied while a nudge button is held
    pub temp_rate: f64,

    /// Nudge ramping behaviour
    pub ramping: RampingMode,

    /// Time constant of the smooth nudge ramp in seconds
    pub nudge_ramp_seconds: f64,

    /// Bound on temporary offset + sync correction (fraction of rate)
    pub max_delta: f64,

    /// Proportional gain: rate correction per beat of phase error
    pub phase_gain: f64,

    /// Bound on the phase correction term alone
    pub max_phase_correction: f64,

    /// Time constant of the follower tempo term in seconds
    pub tempo_smoothing_seconds: f64,

    /// Maximum speed of the follower tempo term in rate units per second
    pub max_tempo_slew: f64,

    /// Allow followers to lock at half or double the master tempo
    pub half_double_sync: bool,

    /// BPM of the internal clock at startup
    pub internal_clock_bpm: f64,

    /// Clock that takes over when no deck is master
    pub clock_source: ClockSource,

    /// Step used by the beats_translate_earlier/later controls, in milliseconds
    pub beat_translate_ms: f64,

    /// Number of tap intervals averaged by tap tempo
    pub tap_history: usize,

    /// Pause after which tap tempo starts a new measurement, in milliseconds
    pub tap_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            rate_range: 0.08,
            invert_rate_slider: false,
            temp_rate: 0.04,
            ramping: RampingMode::Smooth,
            nudge_ramp_seconds: 0.2,
            max_delta: 0.10,
            phase_gain: 1.0,
            max_phase_correction: 0.04,
            tempo_smoothing_seconds: 0.2,
            max_tempo_slew: 0.5,
            half_double_sync: true,
            internal_clock_bpm: 128.0,
            clock_source: ClockSource::Internal,
            beat_translate_ms: 10.0,
            tap_history: 8,
            tap_timeout_ms: 2000,
        }
    }
}

impl SyncConfig {
    /// Replace out-of-range values with defaults, logging each fix
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();

        if self.sample_rate == 0 {
            log::warn!("SyncConfig: sample_rate 0 is invalid, using {}", defaults.sample_rate);
            self.sample_rate = defaults.sample_rate;
        }
        if !(self.rate_range > 0.0 && self.rate_range <= 1.0) {
            log::warn!("SyncConfig: rate_range {} out of (0, 1], using default", self.rate_range);
            self.rate_range = defaults.rate_range;
        }
        if !(self.max_delta > 0.0 && self.max_delta < 1.0) {
            log::warn!("SyncConfig: max_delta {} out of (0, 1), using default", self.max_delta);
            self.max_delta = defaults.max_delta;
        }
        if !(self.max_phase_correction >= 0.0 && self.max_phase_correction <= self.max_delta) {
            log::warn!(
                "SyncConfig: max_phase_correction {} must be within max_delta, clamping",
                self.max_phase_correction
            );
            self.max_phase_correction = self.max_phase_correction.clamp(0.0, self.max_delta);
            if self.max_phase_correction.is_nan() {
                self.max_phase_correction = defaults.max_phase_correction.min(self.max_delta);
            }
        }
        if !(self.phase_gain >= 0.0 && self.phase_gain.is_finite()) {
            log::warn!("SyncConfig: phase_gain {} is invalid, using default", self.phase_gain);
            self.phase_gain = defaults.phase_gain;
        }
        if !(self.max_tempo_slew > 0.0 && self.max_tempo_slew.is_finite()) {
            log::warn!("SyncConfig: max_tempo_slew {} is invalid, using default", self.max_tempo_slew);
            self.max_tempo_slew = defaults.max_tempo_slew;
        }
        if !(self.internal_clock_bpm > 0.0 && self.internal_clock_bpm.is_finite()) {
            log::warn!(
                "SyncConfig: internal_clock_bpm {} is invalid, using default",
                self.internal_clock_bpm
            );
            self.internal_clock_bpm = defaults.internal_clock_bpm;
        }
        if self.tap_history < 2 {
            self.tap_history = 2;
        }
        self
    }

    /// Seconds covered by `frames` at the configured sample rate
    #[inline]
    pub fn frames_to_seconds(&self, frames: usize) -> f64 {
        frames as f64 / self.sample_rate as f64
    }

    /// Fraction of the remaining distance a one-pole smoother with time
    /// constant `tau_seconds` covers in `frames` frames
    #[inline]
    pub fn smoothing_coefficient(&self, tau_seconds: f64, frames: usize) -> f64 {
        if tau_seconds <= 0.0 {
            return 1.0;
        }
        1.0 - (-self.frames_to_seconds(frames) / tau_seconds).exp()
    }

    /// Slider direction multiplier
    #[inline]
    pub fn rate_direction(&self) -> f64 {
        if self.invert_rate_slider {
            -1.0
        } else {
            1.0
        }
    }

    /// Translate step of the beats_translate controls, in frames
    pub fn beat_translate_frames(&self) -> f64 {
        self.beat_translate_ms / 1000.0 * self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = SyncConfig::default();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.ramping, RampingMode::Smooth);
        assert_eq!(config.clock_source, ClockSource::Internal);
        assert!(config.max_phase_correction <= config.max_delta);
        assert_eq!(config.rate_direction(), 1.0);
    }

    #[test]
    fn test_smoothing_coefficient() {
        let config = SyncConfig::default();
        assert_eq!(config.smoothing_coefficient(0.0, 256), 1.0);

        // One time constant covers ~63% of the distance
        let frames = (config.sample_rate as f64 * 0.2) as usize;
        let coeff = config.smoothing_coefficient(0.2, frames);
        assert!((coeff - (1.0 - (-1.0f64).exp())).abs() < 1e-6);

        // Bigger buffers move further
        assert!(config.smoothing_coefficient(0.2, 1024) > config.smoothing_coefficient(0.2, 256));
    }

    #[test]
    fn test_sanitize_fixes_invalid_values() {
        let config = SyncConfig {
            sample_rate: 0,
            rate_range: -1.0,
            max_phase_correction: 0.5,
            internal_clock_bpm: f64::NAN,
            tap_history: 0,
            ..Default::default()
        }
        .sanitized();

        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.rate_range, 0.08);
        assert_eq!(config.max_phase_correction, config.max_delta);
        assert_eq!(config.internal_clock_bpm, 128.0);
        assert_eq!(config.tap_history, 2);
    }

    #[test]
    fn test_yaml_partial_uses_defaults() {
        let yaml = "ramping: stepping\nclock_source: external\nrate_range: 0.16\n";
        let config: SyncConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.ramping, RampingMode::Stepping);
        assert_eq!(config.clock_source, ClockSource::External);
        assert_eq!(config.rate_range, 0.16);
        assert_eq!(config.temp_rate, SyncConfig::default().temp_rate);
    }

    #[test]
    fn test_beat_translate_frames() {
        let config = SyncConfig::default();
        assert!((config.beat_translate_frames() - 480.0).abs() < 1e-9);
    }
}
