//! Deck transport and per-deck sync state
//!
//! A deck owns its beat grid, play position, rate control and sync control.
//! Positions are in track sample frames and kept as `f64` so sub-frame
//! rates accumulate without drift.

use basedrop::Shared;

use super::clock::{TempoReading, TempoSource};
use super::engine_sync::MasterTimebase;
use super::quantize;
use super::rate::{RateControl, RateOutput};
use super::sync_control::{OneShot, SyncControl, SyncRole};
use crate::beatgrid::BeatGrid;
use crate::config::SyncConfig;
use crate::types::{DeckId, PlayState};

/// Default beat jump size in beats
pub const DEFAULT_BEAT_JUMP_SIZE: f64 = 4.0;

/// Largest beat jump accepted
pub const MAX_BEAT_JUMP_SIZE: f64 = 512.0;

/// Loop state
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoopState {
    /// Loop start position in frames
    pub start: Option<f64>,
    /// Loop end position in frames
    pub end: Option<f64>,
    /// Whether playback wraps at the loop end
    pub active: bool,
}

impl LoopState {
    /// Start and end when both are set and form a non-empty loop
    pub fn bounds(&self) -> Option<(f64, f64)> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if end > start => Some((start, end)),
            _ => None,
        }
    }
}

/// What happened while advancing a deck by one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdvanceOutcome {
    /// Playback reached the end of the track and stopped
    pub ended: bool,
}

/// A single deck
pub struct Deck {
    /// Deck identifier (0-3)
    id: DeckId,
    /// Beat grid of the loaded track (None if absent or analysis pending)
    grid: Option<Shared<BeatGrid>>,
    /// Whether a track is loaded at all
    track_loaded: bool,
    /// Track length in frames
    length: f64,
    /// Track frames per engine frame at natural speed
    sample_ratio: f64,
    /// Current playhead position in frames
    position: f64,
    /// Current playback state
    state: PlayState,
    rate: RateControl,
    sync: SyncControl,
    /// Effective rate as of the last rate update
    current_rate: f64,
    quantize: bool,
    keylock: bool,
    cue_point: f64,
    loop_state: LoopState,
    /// Beat jump size in beats
    beat_jump_size: f64,
    scratch_enabled: bool,
    scratch_rate: f64,
}

impl Deck {
    /// Create a new empty deck
    pub fn new(id: DeckId) -> Self {
        Self {
            id,
            grid: None,
            track_loaded: false,
            length: 0.0,
            sample_ratio: 1.0,
            position: 0.0,
            state: PlayState::Stopped,
            rate: RateControl::new(),
            sync: SyncControl::new(),
            current_rate: 1.0,
            quantize: false,
            keylock: false,
            cue_point: 0.0,
            loop_state: LoopState::default(),
            beat_jump_size: DEFAULT_BEAT_JUMP_SIZE,
            scratch_enabled: false,
            scratch_rate: 0.0,
        }
    }

    /// Get the deck ID
    pub fn id(&self) -> DeckId {
        self.id
    }

    // --- Track lifecycle ---

    /// Load a track
    ///
    /// The cue point goes to the first beat when a grid is available. The
    /// rate slider and the sync request survive the load.
    pub fn load_track(
        &mut self,
        grid: Option<Shared<BeatGrid>>,
        length: u64,
        track_sample_rate: u32,
        config: &SyncConfig,
    ) {
        self.track_loaded = true;
        self.length = length as f64;
        self.sample_ratio = if track_sample_rate > 0 {
            track_sample_rate as f64 / config.sample_rate as f64
        } else {
            1.0
        };
        self.position = 0.0;
        self.state = PlayState::Stopped;
        self.loop_state = LoopState::default();
        self.grid = grid;
        self.cue_point = self
            .grid
            .as_ref()
            .map(|g| g.first_beat().clamp(0.0, self.length))
            .unwrap_or(0.0);
        self.rate.set_sync_correction(0.0, config);
        self.rate.set_nudge(false, false);
    }

    /// Unload the current track and reset the deck
    ///
    /// Sync is switched off; the role change itself is applied by the
    /// election on the same buffer.
    pub fn eject(&mut self) {
        self.grid = None;
        self.track_loaded = false;
        self.length = 0.0;
        self.sample_ratio = 1.0;
        self.position = 0.0;
        self.state = PlayState::Stopped;
        self.rate.reset();
        self.sync.set_requested(false);
        self.current_rate = 1.0;
        self.cue_point = 0.0;
        self.loop_state = LoopState::default();
        self.scratch_enabled = false;
        self.scratch_rate = 0.0;
    }

    /// Replace the beat grid (analysis finished, grid edited)
    pub fn set_grid(&mut self, grid: Option<Shared<BeatGrid>>) {
        if self.track_loaded {
            self.grid = grid;
            self.sync.request_rematch();
        }
    }

    pub fn grid(&self) -> Option<&BeatGrid> {
        self.grid.as_deref()
    }

    /// Check if a track is loaded
    pub fn has_track(&self) -> bool {
        self.track_loaded
    }

    /// Whether sync and quantize are available
    pub fn has_tempo(&self) -> bool {
        self.grid.is_some()
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    // --- Transport ---

    /// Get the current playback state
    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state.is_playing()
    }

    /// Playing or being scratched
    pub fn is_moving(&self) -> bool {
        self.is_playing() || self.rate.is_scratching()
    }

    /// Start playback. Returns true if the deck was stopped.
    pub fn play(&mut self) -> bool {
        if !self.track_loaded || self.state.is_playing() {
            return false;
        }
        self.state = PlayState::Playing;
        true
    }

    /// Stop playback
    pub fn stop(&mut self) {
        self.state = PlayState::Stopped;
    }

    /// Get the current position in frames
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Snap a position to the nearest beat when quantize is on
    pub fn snap(&self, position: f64) -> f64 {
        quantize::snap(position, self.grid(), self.quantize)
    }

    /// Jump to a position, quantized
    pub fn seek(&mut self, position: f64) {
        if !self.track_loaded || !position.is_finite() {
            return;
        }
        self.set_position(self.snap(position));
    }

    fn set_position(&mut self, position: f64) {
        self.position = position.clamp(0.0, self.length);
    }

    // --- Cue and loops ---

    /// Set the cue point at the current position (snapped to nearest beat)
    pub fn set_cue_point(&mut self) {
        if self.track_loaded {
            self.cue_point = self.snap(self.position);
        }
    }

    /// Get the current cue point position
    pub fn cue_point(&self) -> f64 {
        self.cue_point
    }

    /// Jump to the cue point
    pub fn goto_cue(&mut self) {
        self.seek(self.cue_point);
    }

    /// Set the loop start at the current position
    pub fn loop_in(&mut self) {
        if !self.track_loaded {
            return;
        }
        let start = self.snap(self.position);
        self.loop_state.start = Some(start);
        if self.loop_state.end.is_some_and(|end| end <= start) {
            self.loop_state.end = None;
            self.loop_state.active = false;
        }
    }

    /// Set the loop end at the current position and enable the loop
    pub fn loop_out(&mut self) {
        if !self.track_loaded {
            return;
        }
        let end = self.snap(self.position);
        match self.loop_state.start {
            Some(start) if end > start => {
                self.loop_state.end = Some(end);
                self.loop_state.active = true;
                // The snapped end may lie behind the playhead
                if self.position >= end {
                    self.set_position(start + (self.position - end) % (end - start));
                }
            }
            _ => {}
        }
    }

    /// Toggle the stored loop. Re-enabling a loop behind the playhead jumps
    /// back to its start.
    pub fn reloop_toggle(&mut self) {
        if self.loop_state.active {
            self.loop_state.active = false;
            return;
        }
        if let Some((start, end)) = self.loop_state.bounds() {
            self.loop_state.active = true;
            if self.position >= end {
                self.set_position(start);
            }
        }
    }

    /// Get the loop state
    pub fn loop_state(&self) -> &LoopState {
        &self.loop_state
    }

    // --- Beat jump ---

    /// Set the beat jump size in beats
    pub fn set_beat_jump_size(&mut self, beats: f64) {
        if beats.is_finite() && beats > 0.0 {
            self.beat_jump_size = beats.min(MAX_BEAT_JUMP_SIZE);
        }
    }

    /// Get the current beat jump size in beats
    pub fn beat_jump_size(&self) -> f64 {
        self.beat_jump_size
    }

    /// Jump by `beat_jump_size` beats, keeping the phase. No-op without a grid.
    pub fn beat_jump(&mut self, forward: bool) {
        let Some(grid) = self.grid() else {
            return;
        };
        let beats = if forward {
            self.beat_jump_size
        } else {
            -self.beat_jump_size
        };
        let target = grid.beats_from(self.position, beats);
        self.seek(target);
    }

    // --- Rate ---

    pub fn rate(&self) -> &RateControl {
        &self.rate
    }

    /// Move the rate slider (-1..1)
    pub fn set_rate_slider(&mut self, slider: f64, config: &SyncConfig) {
        self.rate.set_slider(slider, config);
    }

    /// Hold state of the nudge buttons
    pub fn set_nudge(&mut self, up: bool, down: bool) {
        self.rate.set_nudge(up, down);
    }

    /// Set the rate so the deck plays at `bpm`. No-op without a grid.
    pub fn set_bpm(&mut self, bpm: f64) {
        if let Some(local) = self.local_bpm() {
            self.rate.set_bpm(bpm, local);
        }
    }

    /// Slider value that would make the deck play at `bpm`
    pub fn slider_bpm(&self, slider: f64, config: &SyncConfig) -> Option<f64> {
        let local = self.local_bpm()?;
        let permanent = slider.clamp(-1.0, 1.0) * config.rate_range * config.rate_direction();
        Some(local * self.rate.base_rate() * (1.0 + permanent))
    }

    pub fn scratch_enabled(&self) -> bool {
        self.scratch_enabled
    }

    pub fn scratch_rate(&self) -> f64 {
        self.scratch_rate
    }

    /// Enable or disable the scratch / vinyl rate override
    pub fn set_scratch_enabled(&mut self, enabled: bool) {
        self.scratch_enabled = enabled;
        self.apply_scratch();
    }

    /// Rate requested by the scratch input
    pub fn set_scratch_rate(&mut self, rate: f64) {
        if rate.is_finite() {
            self.scratch_rate = rate;
            self.apply_scratch();
        }
    }

    fn apply_scratch(&mut self) {
        let scratch = (self.scratch_enabled && self.track_loaded).then_some(self.scratch_rate);
        self.rate.set_scratch(scratch);
    }

    pub fn quantize(&self) -> bool {
        self.quantize
    }

    pub fn set_quantize(&mut self, quantize: bool) {
        self.quantize = quantize;
    }

    pub fn keylock(&self) -> bool {
        self.keylock
    }

    pub fn set_keylock(&mut self, keylock: bool) {
        self.keylock = keylock;
    }

    /// Recompute the effective rate after rate inputs changed
    pub fn update_rate(&mut self, config: &SyncConfig) {
        self.current_rate = self.rate.effective_rate(config);
    }

    /// Effective rate as of the last update
    pub fn current_rate(&self) -> f64 {
        self.current_rate
    }

    /// Grid tempo at the playhead
    pub fn local_bpm(&self) -> Option<f64> {
        self.grid().map(|g| g.bpm_at(self.position))
    }

    /// Tempo as heard at the current rate
    pub fn effective_bpm(&self) -> Option<f64> {
        self.local_bpm().map(|bpm| bpm * self.current_rate)
    }

    /// Phase within the current beat
    pub fn phase(&self) -> Option<f64> {
        self.grid().map(|g| g.phase_at(self.position))
    }

    /// Grid tempo and beat count at the playhead, without rate applied
    pub fn beat_reading(&self) -> Option<TempoReading> {
        let grid = self.grid()?;
        Some(TempoReading {
            bpm: grid.bpm_at(self.position),
            beat_position: grid.beat_index_at(self.position),
        })
    }

    // --- Sync ---

    pub fn sync(&self) -> &SyncControl {
        &self.sync
    }

    pub fn sync_role(&self) -> SyncRole {
        self.sync.role()
    }

    pub fn sync_requested(&self) -> bool {
        self.sync.is_requested()
    }

    /// Ask for sync. Takes effect once the deck has a grid.
    pub fn set_sync_requested(&mut self, requested: bool) {
        self.sync.set_requested(requested);
    }

    /// Change role, returns true if it changed
    pub fn set_sync_role(&mut self, role: SyncRole) -> bool {
        self.sync.set_role(role, &mut self.rate)
    }

    /// Re-pick the half/double multiplier
    pub fn request_rematch(&mut self) {
        self.sync.request_rematch();
    }

    /// Queue a one-shot sync
    pub fn request_one_shot(&mut self, tempo: bool, phase: bool) {
        self.sync.request_one_shot(tempo, phase);
    }

    pub fn take_one_shot(&mut self) -> OneShot {
        self.sync.take_one_shot()
    }

    /// Follower tracking for one buffer. Stopped decks and decks without a
    /// grid get no correction.
    pub fn follow(&mut self, master: &MasterTimebase, config: &SyncConfig, frames: usize) {
        match self.beat_reading() {
            Some(reading) if self.is_playing() => {
                self.sync.track(reading, master, &mut self.rate, config, frames);
            }
            _ => self.sync.idle(&mut self.rate, config),
        }
    }

    /// Drop any sync correction
    pub fn stop_following(&mut self, config: &SyncConfig) {
        self.sync.idle(&mut self.rate, config);
    }

    /// One-shot tempo match against the master
    pub fn sync_tempo_once(&mut self, master: &MasterTimebase, config: &SyncConfig) {
        if let Some(local) = self.local_bpm() {
            self.sync.apply_tempo_once(local, master, &mut self.rate, config);
        }
    }

    /// One-shot phase match: seek so the beat phase matches the master
    pub fn sync_phase_once(&mut self, master: &MasterTimebase) {
        let Some(reading) = self.beat_reading() else {
            return;
        };
        let shift = self.sync.phase_shift_once(reading, master);
        if let Some(grid) = self.grid.as_deref() {
            let target = grid.position_at_beat_index(reading.beat_position + shift);
            self.set_position(target);
        }
    }

    // --- Per-buffer ---

    /// Advance the nudge ramp and compute the rate for this buffer
    pub fn prepare_rate(&mut self, config: &SyncConfig, frames: usize) {
        self.rate.update_temporary(config, frames);
        self.update_rate(config);
    }

    /// Rate handoff for the resampler
    pub fn output(&self, config: &SyncConfig) -> RateOutput {
        self.rate.output(config, self.keylock, self.is_moving())
    }

    /// Move the playhead by one buffer at the current rate
    pub fn advance(&mut self, frames: usize) -> AdvanceOutcome {
        if !self.track_loaded || !self.is_moving() {
            return AdvanceOutcome::default();
        }

        let mut position = self.position + self.current_rate * self.sample_ratio * frames as f64;

        if self.loop_state.active {
            if let Some((start, end)) = self.loop_state.bounds() {
                if position >= end && self.position >= start && self.position <= end {
                    position = start + (position - end) % (end - start);
                }
            }
        }

        if position >= self.length && self.is_playing() {
            self.position = self.length;
            self.state = PlayState::Stopped;
            return AdvanceOutcome { ended: true };
        }

        self.position = position.clamp(0.0, self.length);
        AdvanceOutcome::default()
    }
}

impl TempoSource for Deck {
    /// Tempo as heard (grid BPM times the current rate) and beat count
    fn tempo_reading(&self) -> Option<TempoReading> {
        let reading = self.beat_reading()?;
        Some(TempoReading {
            bpm: reading.bpm * self.current_rate,
            beat_position: reading.beat_position,
        })
    }
}
