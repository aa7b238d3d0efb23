//! Per-deck sync state and the follower correction loop
//!
//! A follower measures its beat phase against the master timebase every
//! buffer and feeds two terms into its [`RateControl`]:
//!
//! - a proportional phase correction, bounded by `max_phase_correction`
//! - a slower tempo term that slews the permanent offset toward the master
//!   tempo with time constant `tempo_smoothing_seconds`
//!
//! Proportional control alone cannot overshoot, and with the tempo term
//! matched it has no steady-state error.

use super::clock::TempoReading;
use super::engine_sync::MasterTimebase;
use super::rate::RateControl;
use crate::config::SyncConfig;

/// Wrap a phase difference into [-0.5, 0.5) beats
#[inline]
pub fn wrap_phase(difference: f64) -> f64 {
    let wrapped = difference.rem_euclid(1.0);
    if wrapped >= 0.5 {
        wrapped - 1.0
    } else {
        wrapped
    }
}

/// Sync role of a deck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SyncRole {
    #[default]
    None = 0,
    Follower = 1,
    Master = 2,
}

impl SyncRole {
    /// Numeric value published on `sync_role`
    pub fn as_f64(&self) -> f64 {
        *self as u8 as f64
    }
}

impl std::fmt::Display for SyncRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::None => "none",
            Self::Follower => "follower",
            Self::Master => "master",
        })
    }
}

/// Pending one-shot sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OneShot {
    pub tempo: bool,
    pub phase: bool,
}

impl OneShot {
    pub fn is_empty(&self) -> bool {
        !self.tempo && !self.phase
    }
}

/// Tempo multiplier that keeps the rate change smallest
///
/// A 70 BPM track can follow a 140 BPM master at double time instead of
/// being pitched up 100%. Ties prefer 1, then half, then double.
pub fn match_multiplier(
    master_bpm: f64,
    local_bpm: f64,
    current_rate: f64,
    config: &SyncConfig,
) -> f64 {
    if !config.half_double_sync || !(master_bpm > 0.0 && local_bpm > 0.0 && current_rate > 0.0) {
        return 1.0;
    }
    let current_bpm = local_bpm * current_rate;
    let mut best = 1.0;
    let mut best_distance = f64::INFINITY;
    for multiplier in [1.0, 0.5, 2.0] {
        let distance = (master_bpm * multiplier / current_bpm).ln().abs();
        if distance < best_distance {
            best = multiplier;
            best_distance = distance;
        }
    }
    best
}

/// Sync state of one deck
#[derive(Debug, Clone)]
pub struct SyncControl {
    /// The user asked for sync. Without a grid the role stays `None` until
    /// one arrives.
    requested: bool,
    role: SyncRole,
    /// Follower beats per master beat (0.5, 1 or 2)
    multiplier: f64,
    /// Re-pick the multiplier on the next tracked buffer
    rematch: bool,
    /// Phase offset the user dialed in by nudging or scratching
    user_offset: f64,
    phase_error: f64,
    one_shot: OneShot,
}

impl Default for SyncControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncControl {
    pub fn new() -> Self {
        Self {
            requested: false,
            role: SyncRole::None,
            multiplier: 1.0,
            rematch: true,
            user_offset: 0.0,
            phase_error: 0.0,
            one_shot: OneShot::default(),
        }
    }

    pub fn role(&self) -> SyncRole {
        self.role
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn set_requested(&mut self, requested: bool) {
        self.requested = requested;
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn user_offset(&self) -> f64 {
        self.user_offset
    }

    /// Last phase error, after removing the user offset
    pub fn phase_error(&self) -> f64 {
        self.phase_error
    }

    /// Change role. Returns true when the role actually changed.
    ///
    /// Leaving the follower role bakes the sync correction into the
    /// permanent rate so the deck keeps its speed.
    pub fn set_role(&mut self, role: SyncRole, rate: &mut RateControl) -> bool {
        if role == self.role {
            return false;
        }
        if self.role == SyncRole::Follower {
            rate.bake_sync_correction();
        }
        if role == SyncRole::Follower {
            self.rematch = true;
            self.user_offset = 0.0;
        }
        self.phase_error = 0.0;
        self.role = role;
        true
    }

    /// Master changed: pick the half/double multiplier again
    pub fn request_rematch(&mut self) {
        self.rematch = true;
    }

    /// Queue a one-shot sync for the next buffer
    pub fn request_one_shot(&mut self, tempo: bool, phase: bool) {
        self.one_shot.tempo |= tempo;
        self.one_shot.phase |= phase;
    }

    /// Take the queued one-shot request
    pub fn take_one_shot(&mut self) -> OneShot {
        std::mem::take(&mut self.one_shot)
    }

    /// Reset to the unsynced state (track eject)
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Phase the deck should be at, given the master timebase
    pub fn target_phase(&self, master: &MasterTimebase) -> f64 {
        (master.beat_position() * self.multiplier).rem_euclid(1.0)
    }

    /// Raw phase difference to the master, without the user offset
    pub fn raw_phase_error(&self, deck: TempoReading, master: &MasterTimebase) -> f64 {
        wrap_phase(deck.phase() - self.target_phase(master))
    }

    /// One buffer of follower tracking
    ///
    /// `deck` holds the deck's local (unscaled) grid BPM and its beat count
    /// at the start of the buffer.
    pub fn track(
        &mut self,
        deck: TempoReading,
        master: &MasterTimebase,
        rate: &mut RateControl,
        config: &SyncConfig,
        frames: usize,
    ) {
        if self.rematch {
            self.multiplier = match_multiplier(
                master.bpm(),
                deck.bpm,
                rate.rate_without_sync(config),
                config,
            );
            self.rematch = false;
        }

        // Tempo: slew the permanent offset toward the master tempo
        if let Some(target) = rate.permanent_for_bpm(master.bpm() * self.multiplier, deck.bpm) {
            let current = rate.permanent();
            let coeff = config.smoothing_coefficient(config.tempo_smoothing_seconds, frames);
            let max_step = config.max_tempo_slew * config.frames_to_seconds(frames);
            let step = ((target - current) * coeff).clamp(-max_step, max_step);
            rate.set_permanent(current + step);
        }

        // Phase: pause while the user is moving the deck by hand and keep
        // whatever offset they leave behind
        let raw = self.raw_phase_error(deck, master);
        if rate.is_nudging() || rate.is_scratching() {
            self.user_offset = raw;
            self.phase_error = 0.0;
            rate.set_sync_correction(0.0, config);
            return;
        }

        self.phase_error = wrap_phase(raw - self.user_offset);
        rate.set_sync_correction(-config.phase_gain * self.phase_error, config);
    }

    /// Stop correcting (deck stopped or not following)
    pub fn idle(&mut self, rate: &mut RateControl, config: &SyncConfig) {
        self.phase_error = 0.0;
        rate.set_sync_correction(0.0, config);
    }

    /// Apply a one-shot tempo match: set the rate so the deck plays at the
    /// master tempo (or half/double of it)
    pub fn apply_tempo_once(
        &mut self,
        local_bpm: f64,
        master: &MasterTimebase,
        rate: &mut RateControl,
        config: &SyncConfig,
    ) {
        self.multiplier =
            match_multiplier(master.bpm(), local_bpm, rate.rate_without_sync(config), config);
        rate.set_bpm(master.bpm() * self.multiplier, local_bpm);
    }

    /// Beats to move the deck by for a one-shot phase match. Clears the
    /// user offset.
    pub fn phase_shift_once(&mut self, deck: TempoReading, master: &MasterTimebase) -> f64 {
        self.user_offset = 0.0;
        self.phase_error = 0.0;
        -self.raw_phase_error(deck, master)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::engine_sync::MasterSource;

    fn timebase(bpm: f64, beat_position: f64) -> MasterTimebase {
        MasterTimebase::new(bpm, beat_position, MasterSource::InternalClock)
    }

    #[test]
    fn test_wrap_phase_range() {
        assert_eq!(wrap_phase(0.0), 0.0);
        assert_eq!(wrap_phase(0.25), 0.25);
        assert_eq!(wrap_phase(0.75), -0.25);
        assert_eq!(wrap_phase(-0.75), 0.25);
        assert_eq!(wrap_phase(0.5), -0.5);
        assert_eq!(wrap_phase(-0.5), -0.5);
        for i in -40..40 {
            let w = wrap_phase(i as f64 * 0.137);
            assert!((-0.5..0.5).contains(&w));
        }
    }

    #[test]
    fn test_match_multiplier() {
        let config = SyncConfig::default();
        assert_eq!(match_multiplier(128.0, 130.0, 1.0, &config), 1.0);
        assert_eq!(match_multiplier(140.0, 70.0, 1.0, &config), 0.5);
        assert_eq!(match_multiplier(87.0, 172.0, 1.0, &config), 2.0);

        let strict = SyncConfig {
            half_double_sync: false,
            ..Default::default()
        };
        assert_eq!(match_multiplier(140.0, 70.0, 1.0, &strict), 1.0);
    }

    #[test]
    fn test_role_change_bakes_correction() {
        let config = SyncConfig::default();
        let mut sync = SyncControl::new();
        let mut rate = RateControl::new();

        assert!(sync.set_role(SyncRole::Follower, &mut rate));
        assert!(!sync.set_role(SyncRole::Follower, &mut rate));

        rate.set_sync_correction(0.03, &config);
        let before = rate.effective_rate(&config);
        assert!(sync.set_role(SyncRole::Master, &mut rate));
        assert_eq!(rate.sync_correction(), 0.0);
        assert!((rate.effective_rate(&config) - before).abs() < 1e-12);
    }

    #[test]
    fn test_track_corrects_toward_master_phase() {
        let config = SyncConfig::default();
        let mut sync = SyncControl::new();
        let mut rate = RateControl::new();
        sync.set_role(SyncRole::Follower, &mut rate);

        // Deck is a quarter beat ahead
        let master = timebase(128.0, 10.0);
        let deck = TempoReading { bpm: 128.0, beat_position: 3.25 };
        sync.track(deck, &master, &mut rate, &config, 256);

        assert!((sync.phase_error() - 0.25).abs() < 1e-12);
        assert_eq!(rate.sync_correction(), -config.max_phase_correction);

        // Small error: proportional
        let deck = TempoReading { bpm: 128.0, beat_position: 4.01 };
        sync.track(deck, &master, &mut rate, &config, 256);
        assert!((rate.sync_correction() + 0.01 * config.phase_gain).abs() < 1e-9);
    }

    #[test]
    fn test_tempo_term_slews_and_converges() {
        let config = SyncConfig::default();
        let mut sync = SyncControl::new();
        let mut rate = RateControl::new();
        sync.set_role(SyncRole::Follower, &mut rate);

        let master = timebase(128.0, 0.0);
        let deck = TempoReading { bpm: 130.0, beat_position: 0.0 };
        let target = 128.0 / 130.0 - 1.0;
        let max_step = config.max_tempo_slew * config.frames_to_seconds(256);

        let mut previous = rate.permanent();
        for _ in 0..1500 {
            sync.track(deck, &master, &mut rate, &config, 256);
            assert!((rate.permanent() - previous).abs() <= max_step + 1e-15);
            previous = rate.permanent();
        }
        assert!((rate.permanent() - target).abs() < 1e-9);
    }

    #[test]
    fn test_nudge_sets_user_offset() {
        let config = SyncConfig::default();
        let mut sync = SyncControl::new();
        let mut rate = RateControl::new();
        sync.set_role(SyncRole::Follower, &mut rate);

        let master = timebase(120.0, 0.0);
        rate.set_nudge(true, false);
        let deck = TempoReading { bpm: 120.0, beat_position: 0.1 };
        sync.track(deck, &master, &mut rate, &config, 256);
        assert_eq!(rate.sync_correction(), 0.0);
        assert!((sync.user_offset() - 0.1).abs() < 1e-12);

        // Released: the 0.1 offset is now the aligned position
        rate.set_nudge(false, false);
        rate.update_temporary(
            &SyncConfig {
                ramping: crate::config::RampingMode::Stepping,
                ..Default::default()
            },
            256,
        );
        sync.track(deck, &master, &mut rate, &config, 256);
        assert!(sync.phase_error().abs() < 1e-12);
        assert!(rate.sync_correction().abs() < 1e-12);
    }

    #[test]
    fn test_half_time_follower_targets_half_phase() {
        let config = SyncConfig::default();
        let mut sync = SyncControl::new();
        let mut rate = RateControl::new();
        sync.set_role(SyncRole::Follower, &mut rate);

        let master = timebase(140.0, 3.0);
        let deck = TempoReading { bpm: 70.0, beat_position: 1.5 };
        sync.track(deck, &master, &mut rate, &config, 256);
        assert_eq!(sync.multiplier(), 0.5);
        assert!(sync.phase_error().abs() < 1e-12);
    }

    #[test]
    fn test_one_shots() {
        let config = SyncConfig::default();
        let mut sync = SyncControl::new();
        let mut rate = RateControl::new();
        let master = timebase(128.0, 5.5);

        sync.apply_tempo_once(130.0, &master, &mut rate, &config);
        assert!((rate.effective_rate(&config) - 128.0 / 130.0).abs() < 1e-12);

        let deck = TempoReading { bpm: 130.0, beat_position: 2.25 };
        let shift = sync.phase_shift_once(deck, &master);
        assert!((shift - 0.25).abs() < 1e-12);

        sync.request_one_shot(true, false);
        sync.request_one_shot(false, true);
        assert_eq!(sync.take_one_shot(), OneShot { tempo: true, phase: true });
        assert!(sync.take_one_shot().is_empty());
    }
}
