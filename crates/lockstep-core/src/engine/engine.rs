//! Audio-thread sync engine - ties together decks, election and rate output
//!
//! [`SyncEngine::process`] runs once per audio buffer, in a fixed order:
//!
//! 1. apply queued commands and control-point writes
//! 2. elect the master source and assign roles
//! 3. adopt the master timebase for this buffer
//! 4. one-shot syncs and follower phase/tempo errors
//! 5. final rates to the resampler, playheads advance
//! 6. publish mirrors to the control registry
//!
//! Nothing in here blocks, allocates or logs.

use std::sync::Arc;

use basedrop::Shared;

use super::clock::{ExternalClock, MAX_BPM, MIN_BPM};
use super::command::{EngineCommand, EngineEvent, EventSender};
use super::deck::Deck;
use super::engine_sync::{EngineSync, MasterTimebase};
use super::rate::RateOutput;
use super::sync_control::SyncRole;
use crate::config::SyncConfig;
use crate::control::{ControlKey, ControlKind, ControlRegistry, DeckControl, GlobalControl};
use crate::types::{DeckId, NUM_DECKS};

/// Default audio buffer size in frames
pub const BUFFER_SIZE: usize = 256;

/// Value published for an unset loop boundary
const UNSET_POSITION: f64 = -1.0;

/// The sync engine, owned by the audio thread
pub struct SyncEngine {
    config: Shared<SyncConfig>,
    /// The 4 decks
    decks: [Deck; NUM_DECKS],
    sync: EngineSync,
    controls: Arc<ControlRegistry>,
    commands: rtrb::Consumer<EngineCommand>,
    events: EventSender,
    /// Rate handoff of the last buffer, one per deck
    outputs: [RateOutput; NUM_DECKS],
}

impl SyncEngine {
    /// Create a new engine
    ///
    /// Call from the control thread before the audio stream starts; the
    /// engine is then moved into the audio callback.
    pub fn new(
        config: Shared<SyncConfig>,
        controls: Arc<ControlRegistry>,
        commands: rtrb::Consumer<EngineCommand>,
        events: EventSender,
        external: ExternalClock,
    ) -> Self {
        let sync = EngineSync::new(&config, external);
        let engine = Self {
            config,
            decks: std::array::from_fn(|i| Deck::new(DeckId::new(i))),
            sync,
            controls,
            commands,
            events,
            outputs: [RateOutput::default(); NUM_DECKS],
        };
        engine.publish();
        engine
    }

    /// Get a reference to a deck
    pub fn deck(&self, id: DeckId) -> Option<&Deck> {
        self.decks.get(id.index())
    }

    pub fn timebase(&self) -> &MasterTimebase {
        self.sync.timebase()
    }

    pub fn engine_sync(&self) -> &EngineSync {
        &self.sync
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Rate handoff of the last processed buffer
    pub fn outputs(&self) -> &[RateOutput; NUM_DECKS] {
        &self.outputs
    }

    /// Events dropped because the control thread did not drain them
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    /// Process one buffer of `frames` frames
    ///
    /// Returns the rate for each deck's resampler.
    pub fn process(&mut self, frames: usize) -> &[RateOutput; NUM_DECKS] {
        // 1. Buffer boundary: commands first, then control-point writes
        self.process_commands();
        self.sync.begin_buffer();
        self.apply_controls();

        let config = &*self.config;
        for deck in self.decks.iter_mut() {
            deck.update_rate(config);
        }

        // 2. Election and role handoff
        self.sync.elect(&mut self.decks, &mut self.events);

        // 3. Master timebase for this buffer
        self.sync.update_timebase(&self.decks);

        // 4. Follower errors
        self.sync.apply_one_shots(&mut self.decks, config);
        self.sync.track_followers(&mut self.decks, config, frames);

        // 5. Final rate to the resampler, then move the playheads
        for (deck, output) in self.decks.iter_mut().zip(self.outputs.iter_mut()) {
            deck.prepare_rate(config, frames);
            *output = deck.output(config);
            if deck.advance(frames).ended {
                self.events.emit(EngineEvent::TrackEnded { deck: deck.id() });
            }
        }
        self.sync.end_buffer(config.frames_to_seconds(frames));

        // 6. Mirrors
        self.publish();

        &self.outputs
    }

    /// Drain the command queue
    pub fn process_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                EngineCommand::LoadTrack {
                    deck,
                    grid,
                    length,
                    sample_rate,
                } => {
                    if let Some(d) = self.decks.get_mut(deck.index()) {
                        d.load_track(grid, length, sample_rate, &self.config);
                    }
                }
                EngineCommand::EjectTrack { deck } => {
                    if let Some(d) = self.decks.get_mut(deck.index()) {
                        d.eject();
                        self.sync.release_master(deck);
                    }
                }
                EngineCommand::SetBeatGrid { deck, grid } => match self.decks.get_mut(deck.index()) {
                    Some(d) if d.has_track() => d.set_grid(grid),
                    _ => self.events.emit(EngineEvent::GridIgnored { deck }),
                },
                EngineCommand::UpdateConfig(config) => {
                    self.sync.apply_config(&config);
                    self.config = config;
                }
            }
        }
    }

    /// Consume staged control-point writes
    ///
    /// Globals go first so that a deck asking to be master in the same
    /// buffer as the clock wins. Decks are scanned in ascending order and
    /// the first master request wins.
    fn apply_controls(&mut self) {
        let Self {
            config,
            decks,
            sync,
            controls,
            ..
        } = self;
        let config = &**config;

        for &control in GlobalControl::ALL {
            if control.kind() == ControlKind::ReadOnly {
                continue;
            }
            if let Some(value) = controls.take_request(ControlKey::Global(control)) {
                apply_global_control(control, value, decks, sync);
            }
        }

        let mut master_request = None;
        for id in DeckId::all() {
            for &control in DeckControl::ALL {
                if control.kind() == ControlKind::ReadOnly || control.is_control_side() {
                    continue;
                }
                if let Some(value) = controls.take_request(ControlKey::Deck(id, control)) {
                    apply_deck_control(id, control, value, decks, sync, config, &mut master_request);
                }
            }
        }
        if let Some(id) = master_request {
            sync.request_master(id);
        }
    }

    /// Write all mirrors to the registry
    fn publish(&self) {
        let controls = &*self.controls;
        let config = &*self.config;

        for deck in &self.decks {
            let id = deck.id();
            let key = |control| ControlKey::Deck(id, control);
            let loop_state = deck.loop_state();

            controls.publish_bool(key(DeckControl::SyncEnabled), deck.sync_requested());
            controls.publish_bool(
                key(DeckControl::SyncMaster),
                deck.sync_role() == SyncRole::Master || self.sync.requested_master() == Some(id),
            );
            controls.publish(key(DeckControl::SyncRole), deck.sync_role().as_f64());
            controls.publish(key(DeckControl::Rate), deck.rate().slider(config));
            let (up, down) = deck.rate().nudge_buttons();
            controls.publish_bool(key(DeckControl::RateTempUp), up);
            controls.publish_bool(key(DeckControl::RateTempDown), down);
            controls.publish(key(DeckControl::Bpm), deck.effective_bpm().unwrap_or(0.0));
            controls.publish(key(DeckControl::FileBpm), deck.local_bpm().unwrap_or(0.0));
            controls.publish_bool(key(DeckControl::Quantize), deck.quantize());
            controls.publish_bool(key(DeckControl::Keylock), deck.keylock());
            controls.publish_bool(key(DeckControl::Play), deck.is_playing());
            controls.publish(key(DeckControl::PlayPosition), deck.position());
            controls.publish_bool(key(DeckControl::ScratchEnable), deck.scratch_enabled());
            controls.publish(key(DeckControl::ScratchRate), deck.scratch_rate());
            controls.publish(key(DeckControl::BeatjumpSize), deck.beat_jump_size());
            controls.publish(key(DeckControl::Phase), deck.phase().unwrap_or(0.0));
            controls.publish(key(DeckControl::PhaseError), deck.sync().phase_error());
            controls.publish(key(DeckControl::EffectiveRate), deck.current_rate());
            controls.publish(key(DeckControl::Position), deck.position());
            controls.publish(key(DeckControl::CuePoint), deck.cue_point());
            controls.publish(key(DeckControl::LoopStart), loop_state.start.unwrap_or(UNSET_POSITION));
            controls.publish(key(DeckControl::LoopEnd), loop_state.end.unwrap_or(UNSET_POSITION));
            controls.publish_bool(key(DeckControl::LoopActive), loop_state.active);
            controls.publish_bool(key(DeckControl::TrackLoaded), deck.has_track());
            controls.publish_bool(key(DeckControl::HasTempo), deck.has_tempo());
        }

        let timebase = self.sync.timebase();
        let global = ControlKey::Global;
        controls.publish(global(GlobalControl::MasterBpm), timebase.bpm());
        controls.publish(global(GlobalControl::MasterPhase), timebase.phase());
        controls.publish(global(GlobalControl::MasterSource), timebase.source().as_f64());
        controls.publish_bool(global(GlobalControl::MasterDeckActive), self.sync.master_deck().is_some());
        controls.publish(global(GlobalControl::InternalClockBpm), self.sync.internal_clock().bpm());
        controls.publish_bool(global(GlobalControl::InternalClockSyncMaster), self.sync.is_clock_master());
    }
}

fn valid_bpm(bpm: f64) -> bool {
    (MIN_BPM..=MAX_BPM).contains(&bpm)
}

fn apply_global_control(
    control: GlobalControl,
    value: f64,
    decks: &mut [Deck; NUM_DECKS],
    sync: &mut EngineSync,
) {
    match control {
        GlobalControl::InternalClockBpm if valid_bpm(value) => sync.set_clock_bpm(value, decks),
        GlobalControl::InternalClockSyncMaster => sync.set_clock_master(value > 0.5),
        _ => {}
    }
}

fn apply_deck_control(
    id: DeckId,
    control: DeckControl,
    value: f64,
    decks: &mut [Deck; NUM_DECKS],
    sync: &mut EngineSync,
    config: &SyncConfig,
    master_request: &mut Option<DeckId>,
) {
    let on = value > 0.5;
    let fire = value > 0.0;
    let deck = &mut decks[id.index()];
    let following = deck.sync_role() == SyncRole::Follower;

    match control {
        DeckControl::SyncEnabled => {
            deck.set_sync_requested(on);
            if !on {
                sync.release_master(id);
            }
        }
        DeckControl::SyncMaster => {
            if on {
                deck.set_sync_requested(true);
                master_request.get_or_insert(id);
            } else {
                sync.release_master(id);
            }
        }
        DeckControl::BeatSync if fire => deck.request_one_shot(true, true),
        DeckControl::BeatSyncTempo if fire => deck.request_one_shot(true, false),
        DeckControl::BeatSyncPhase if fire => deck.request_one_shot(false, true),
        DeckControl::Rate => {
            // A follower's tempo belongs to the sync group
            if following {
                let multiplier = deck.sync().multiplier();
                if let Some(bpm) = deck.slider_bpm(value, config) {
                    sync.set_group_bpm(bpm / multiplier, decks);
                }
            } else {
                deck.set_rate_slider(value, config);
            }
        }
        DeckControl::RateTempUp => {
            let (_, down) = deck.rate().nudge_buttons();
            deck.set_nudge(on, down);
        }
        DeckControl::RateTempDown => {
            let (up, _) = deck.rate().nudge_buttons();
            deck.set_nudge(up, on);
        }
        DeckControl::Bpm if valid_bpm(value) => {
            if following {
                let multiplier = deck.sync().multiplier();
                sync.set_group_bpm(value / multiplier, decks);
            } else {
                deck.set_bpm(value);
            }
        }
        DeckControl::Quantize => deck.set_quantize(on),
        DeckControl::Keylock => deck.set_keylock(on),
        DeckControl::Play => {
            if on {
                // Quantized start of a follower lands in phase
                if deck.play() && following && deck.quantize() {
                    deck.request_one_shot(false, true);
                }
            } else {
                deck.stop();
            }
        }
        DeckControl::PlayPosition => deck.seek(value),
        DeckControl::ScratchEnable => deck.set_scratch_enabled(on),
        DeckControl::ScratchRate => deck.set_scratch_rate(value),
        DeckControl::CueSet if fire => deck.set_cue_point(),
        DeckControl::CueGoto if fire => deck.goto_cue(),
        DeckControl::LoopIn if fire => deck.loop_in(),
        DeckControl::LoopOut if fire => deck.loop_out(),
        DeckControl::ReloopToggle if fire => deck.reloop_toggle(),
        DeckControl::BeatjumpForward if fire => deck.beat_jump(true),
        DeckControl::BeatjumpBackward if fire => deck.beat_jump(false),
        DeckControl::BeatjumpSize => deck.set_beat_jump_size(value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beatgrid::BeatGrid;
    use crate::engine::clock::TempoSource;
    use crate::engine::controller::EngineController;
    use crate::engine::create_engine;
    use crate::engine::engine_sync::MasterSource;
    use crate::engine::sync_control::wrap_phase;

    const SR: u32 = 48000;
    const FRAMES: usize = BUFFER_SIZE;
    const TRACK_LENGTH: u64 = SR as u64 * 600;

    fn setup() -> (SyncEngine, EngineController) {
        let (engine, controller, _external) = create_engine(SyncConfig::default());
        (engine, controller)
    }

    fn load(controller: &mut EngineController, deck: usize, bpm: f64, first_beat: f64) {
        let grid = BeatGrid::constant(SR, bpm, first_beat).unwrap();
        controller
            .load_track(DeckId(deck), Some(grid), TRACK_LENGTH, SR)
            .unwrap();
    }

    fn run(engine: &mut SyncEngine, buffers: usize) {
        for _ in 0..buffers {
            engine.process(FRAMES);
        }
    }

    fn deck(engine: &SyncEngine, index: usize) -> &Deck {
        engine.deck(DeckId(index)).unwrap()
    }

    /// Phase distance between a deck and the master timebase
    fn phase_offset(engine: &SyncEngine, index: usize) -> f64 {
        let deck = deck(engine, index);
        let target = deck.sync().target_phase(engine.timebase());
        wrap_phase(deck.phase().unwrap() - target)
    }

    #[test]
    fn test_process_empty_engine() {
        let (mut engine, _controller) = setup();
        let outputs = engine.process(FRAMES);
        assert!(outputs.iter().all(|o| *o == RateOutput::default()));
        assert_eq!(engine.timebase().source(), MasterSource::InternalClock);
    }

    #[test]
    fn test_two_followers_converge_for_any_offset() {
        for offset_beats in [0.0f64, 0.13, 0.37, 0.49, -0.21, -0.45] {
            let (mut engine, mut controller) = setup();
            controller.set("internal_clock.sync_master", 1.0).unwrap();

            load(&mut controller, 0, 128.0, 0.0);
            load(&mut controller, 1, 126.0, 1234.0);
            engine.process(FRAMES);

            let frames_per_beat = SR as f64 * 60.0 / 126.0;
            controller
                .set("deck2.playposition", 1234.0 + (8.0 + offset_beats).rem_euclid(16.0) * frames_per_beat)
                .unwrap();
            for name in ["deck1.sync_enabled", "deck2.sync_enabled", "deck1.play", "deck2.play"] {
                controller.set(name, 1.0).unwrap();
            }

            run(&mut engine, 3000);

            assert_eq!(engine.timebase().source(), MasterSource::InternalClock);
            for index in 0..2 {
                assert_eq!(deck(&engine, index).sync_role(), SyncRole::Follower);
                let error = phase_offset(&engine, index);
                assert!(error.abs() < 0.01, "offset {offset_beats}: deck {index} error {error}");
                let bpm = deck(&engine, index).effective_bpm().unwrap();
                assert!((bpm - 128.0).abs() < 0.05, "deck {index} bpm {bpm}");
            }
        }
    }

    #[test]
    fn test_follower_locks_to_master_deck() {
        let (mut engine, mut controller) = setup();
        load(&mut controller, 0, 128.0, 0.0);
        load(&mut controller, 1, 130.0, 700.0);
        for name in ["deck1.sync_enabled", "deck2.sync_enabled", "deck1.play"] {
            controller.set(name, 1.0).unwrap();
        }
        engine.process(FRAMES);
        assert_eq!(engine.timebase().source(), MasterSource::Deck(DeckId(0)));

        controller.set("deck2.play", 1.0).unwrap();
        run(&mut engine, 3000);

        assert_eq!(deck(&engine, 1).sync_role(), SyncRole::Follower);
        let rate = deck(&engine, 1).current_rate();
        assert!((rate - 128.0 / 130.0).abs() < 1e-3, "rate {rate}");
        assert!(phase_offset(&engine, 1).abs() < 0.01);
        // The master is never corrected
        assert_eq!(deck(&engine, 0).current_rate(), 1.0);
        assert_eq!(controller.get("master.source").unwrap(), 1.0);
        assert_eq!(controller.get("deck1.sync_role").unwrap(), 2.0);
        assert_eq!(controller.get("deck2.sync_role").unwrap(), 1.0);
    }

    #[test]
    fn test_master_reassignment_is_continuous() {
        let (mut engine, mut controller) = setup();
        load(&mut controller, 0, 128.0, 0.0);
        load(&mut controller, 1, 130.0, 3000.0);
        for name in ["deck1.sync_enabled", "deck2.sync_enabled", "deck1.play", "deck2.play"] {
            controller.set(name, 1.0).unwrap();
        }
        run(&mut engine, 3000);
        assert_eq!(engine.timebase().source(), MasterSource::Deck(DeckId(0)));

        let before = engine.timebase().clone();
        controller.set("deck2.sync_master", 1.0).unwrap();
        engine.process(FRAMES);
        let after = engine.timebase().clone();

        assert_eq!(after.source(), MasterSource::Deck(DeckId(1)));
        assert_eq!(deck(&engine, 0).sync_role(), SyncRole::Follower);

        let one_buffer = before.bpm() / 60.0 * FRAMES as f64 / SR as f64;
        let moved = after.beat_position() - before.beat_position();
        assert!((moved - one_buffer).abs() < 1e-3, "moved {moved}, expected {one_buffer}");
        assert!((after.bpm() - before.bpm()).abs() < 0.05);
    }

    #[test]
    fn test_same_buffer_master_requests_lowest_deck_wins() {
        let (mut engine, mut controller) = setup();
        load(&mut controller, 0, 128.0, 0.0);
        load(&mut controller, 1, 128.0, 500.0);
        load(&mut controller, 2, 128.0, 900.0);
        for n in 1..=3 {
            controller.set(&format!("deck{n}.sync_enabled"), 1.0).unwrap();
            controller.set(&format!("deck{n}.play"), 1.0).unwrap();
        }
        run(&mut engine, 10);
        assert_eq!(engine.timebase().source(), MasterSource::Deck(DeckId(0)));

        // Write order does not matter, deck order does
        controller.set("deck3.sync_master", 1.0).unwrap();
        controller.set("deck2.sync_master", 1.0).unwrap();
        engine.process(FRAMES);

        assert_eq!(engine.timebase().source(), MasterSource::Deck(DeckId(1)));
        assert_eq!(deck(&engine, 1).sync_role(), SyncRole::Master);
        assert_eq!(deck(&engine, 2).sync_role(), SyncRole::Follower);
        assert_eq!(deck(&engine, 0).sync_role(), SyncRole::Follower);
    }

    #[test]
    fn test_master_stop_falls_back_to_clock() {
        let (mut engine, mut controller) = setup();
        load(&mut controller, 0, 128.0, 0.0);
        load(&mut controller, 1, 130.0, 500.0);
        for name in ["deck1.sync_enabled", "deck2.sync_enabled", "deck1.play", "deck2.play"] {
            controller.set(name, 1.0).unwrap();
        }
        run(&mut engine, 3000);
        let rate_before = deck(&engine, 1).current_rate();
        let phase_before = engine.timebase().beat_position();

        controller.set("deck1.play", 0.0).unwrap();
        engine.process(FRAMES);

        assert_eq!(engine.timebase().source(), MasterSource::InternalClock);
        assert!((engine.timebase().bpm() - 128.0).abs() < 1e-9);
        assert_eq!(deck(&engine, 0).sync_role(), SyncRole::Follower);
        let max_correction = engine.config().max_phase_correction;
        let rate_after = deck(&engine, 1).current_rate();
        assert!((rate_after - rate_before).abs() <= max_correction);
        let one_buffer = 128.0 / 60.0 * FRAMES as f64 / SR as f64;
        assert!((engine.timebase().beat_position() - phase_before - one_buffer).abs() < 1e-6);
        assert_eq!(controller.get("master.deck_active").unwrap(), 0.0);

        // The follower stays locked to the clock
        run(&mut engine, 1000);
        assert!(phase_offset(&engine, 1).abs() < 0.01);
        assert!((deck(&engine, 1).effective_bpm().unwrap() - 128.0).abs() < 0.05);
    }

    #[test]
    fn test_eject_master_hands_over_to_clock() {
        let (mut engine, mut controller) = setup();
        load(&mut controller, 0, 128.0, 0.0);
        load(&mut controller, 1, 130.0, 100.0);
        for name in ["deck1.sync_enabled", "deck2.sync_enabled", "deck1.play", "deck2.play"] {
            controller.set(name, 1.0).unwrap();
        }
        run(&mut engine, 3000);
        let rate_before = deck(&engine, 1).current_rate();
        assert!((rate_before - 128.0 / 130.0).abs() < 1e-3);

        controller.eject_track(DeckId(0)).unwrap();
        engine.process(FRAMES);

        assert_eq!(engine.timebase().source(), MasterSource::InternalClock);
        assert!((engine.timebase().bpm() - 128.0).abs() < 1e-9);
        assert_eq!(deck(&engine, 0).sync_role(), SyncRole::None);
        assert_eq!(controller.get("deck1.sync_enabled").unwrap(), 0.0);

        let mut previous = rate_before;
        for _ in 0..500 {
            engine.process(FRAMES);
            let rate = deck(&engine, 1).current_rate();
            assert!((rate - previous).abs() < 1e-3, "rate jumped {previous} -> {rate}");
            previous = rate;
        }
        assert!((previous - 128.0 / 130.0).abs() < 1e-3);
    }

    #[test]
    fn test_half_time_follower() {
        let (mut engine, mut controller) = setup();
        load(&mut controller, 0, 140.0, 0.0);
        load(&mut controller, 1, 70.0, 0.0);
        for name in ["deck1.sync_enabled", "deck2.sync_enabled", "deck1.play", "deck2.play"] {
            controller.set(name, 1.0).unwrap();
        }
        run(&mut engine, 2000);
        assert_eq!(deck(&engine, 1).sync().multiplier(), 0.5);
        assert!((deck(&engine, 1).current_rate() - 1.0).abs() < 1e-3);
        assert!(phase_offset(&engine, 1).abs() < 0.01);
    }

    #[test]
    fn test_one_shot_beatsync() {
        let (mut engine, mut controller) = setup();
        load(&mut controller, 0, 128.0, 0.0);
        load(&mut controller, 1, 130.0, 5000.0);
        for name in ["deck1.sync_enabled", "deck1.play", "deck2.play"] {
            controller.set(name, 1.0).unwrap();
        }
        controller.set("deck2.playposition", 1_000_000.0).unwrap();
        run(&mut engine, 10);

        controller.set("deck2.beatsync", 1.0).unwrap();
        engine.process(FRAMES);

        // Rate matched in one step, deck not enrolled afterwards
        assert!((deck(&engine, 1).current_rate() - 128.0 / 130.0).abs() < 1e-9);
        assert_eq!(deck(&engine, 1).sync_role(), SyncRole::None);
        assert!(phase_offset(&engine, 1).abs() < 1e-3);

        // Master ignores one-shots
        controller.set("deck1.beatsync_tempo", 1.0).unwrap();
        engine.process(FRAMES);
        assert_eq!(deck(&engine, 0).current_rate(), 1.0);
    }

    #[test]
    fn test_follower_bpm_write_retimes_group() {
        let (mut engine, mut controller) = setup();
        load(&mut controller, 0, 128.0, 0.0);
        load(&mut controller, 1, 130.0, 0.0);
        for name in ["deck1.sync_enabled", "deck2.sync_enabled", "deck1.play", "deck2.play"] {
            controller.set(name, 1.0).unwrap();
        }
        run(&mut engine, 10);

        controller.set("deck2.bpm", 125.0).unwrap();
        engine.process(FRAMES);
        assert!((deck(&engine, 0).effective_bpm().unwrap() - 125.0).abs() < 1e-9);

        run(&mut engine, 2000);
        assert!((deck(&engine, 1).effective_bpm().unwrap() - 125.0).abs() < 0.05);
    }

    #[test]
    fn test_clock_bpm_write() {
        let (mut engine, mut controller) = setup();
        controller.set("internal_clock.bpm", 100.0).unwrap();
        engine.process(FRAMES);
        assert_eq!(engine.timebase().bpm(), 100.0);
        assert_eq!(controller.get("master.bpm").unwrap(), 100.0);

        // Out of range writes are ignored
        controller.set("internal_clock.bpm", 5.0).unwrap();
        engine.process(FRAMES);
        assert_eq!(engine.timebase().bpm(), 100.0);
    }

    #[test]
    fn test_quantized_play_aligns_follower() {
        let (mut engine, mut controller) = setup();
        load(&mut controller, 0, 128.0, 0.0);
        load(&mut controller, 1, 128.0, 0.0);
        for name in ["deck1.sync_enabled", "deck2.sync_enabled", "deck2.quantize", "deck1.play"] {
            controller.set(name, 1.0).unwrap();
        }
        run(&mut engine, 37);
        controller.set("deck2.play", 1.0).unwrap();
        engine.process(FRAMES);
        assert!(phase_offset(&engine, 1).abs() < 1e-6);
    }

    #[test]
    fn test_nudge_keeps_user_offset() {
        let config = SyncConfig {
            ramping: crate::config::RampingMode::Stepping,
            ..Default::default()
        };
        let (mut engine, mut controller, _external) = create_engine(config);
        load(&mut controller, 0, 120.0, 0.0);
        load(&mut controller, 1, 120.0, 0.0);
        for name in ["deck1.sync_enabled", "deck2.sync_enabled", "deck1.play", "deck2.play"] {
            controller.set(name, 1.0).unwrap();
        }
        run(&mut engine, 100);
        assert!(phase_offset(&engine, 1).abs() < 1e-6);

        controller.set("deck2.rate_temp_up", 1.0).unwrap();
        run(&mut engine, 50);
        controller.set("deck2.rate_temp_up", 0.0).unwrap();
        run(&mut engine, 500);

        // About 50 buffers at +4%: 50 * 256 / 48000 * 2 beats/s * 0.04
        let offset = phase_offset(&engine, 1);
        assert!((offset - 0.0213).abs() < 0.005, "offset {offset}");
        assert!(deck(&engine, 1).sync().phase_error().abs() < 1e-3);
    }

    #[test]
    fn test_keylock_output() {
        let (mut engine, mut controller) = setup();
        load(&mut controller, 0, 128.0, 0.0);
        for name in ["deck1.keylock", "deck1.play"] {
            controller.set(name, 1.0).unwrap();
        }
        controller.set("deck1.rate", 0.5).unwrap();
        let outputs = engine.process(FRAMES);
        assert!((outputs[0].tempo_ratio - 1.04).abs() < 1e-12);
        assert_eq!(outputs[0].pitch_ratio, 1.0);
    }

    #[test]
    fn test_track_end_stops_master() {
        let (mut engine, mut controller) = setup();
        let grid = BeatGrid::constant(SR, 128.0, 0.0).unwrap();
        controller
            .load_track(DeckId(0), Some(grid), FRAMES as u64 * 10, SR)
            .unwrap();
        for name in ["deck1.sync_enabled", "deck1.play"] {
            controller.set(name, 1.0).unwrap();
        }
        run(&mut engine, 12);
        assert!(!deck(&engine, 0).is_playing());
        assert_eq!(engine.timebase().source(), MasterSource::InternalClock);

        let events = controller.drain_events();
        assert!(events.contains(&EngineEvent::TrackEnded { deck: DeckId(0) }));
    }

    #[test]
    fn test_deck_tempo_reading_matches_mirror() {
        let (mut engine, mut controller) = setup();
        load(&mut controller, 2, 124.0, 0.0);
        controller.set("deck3.rate", -0.25).unwrap();
        engine.process(FRAMES);
        let reading = deck(&engine, 2).tempo_reading().unwrap();
        assert!((controller.get("deck3.bpm").unwrap() - reading.bpm).abs() < 1e-9);
        assert!((reading.bpm - 124.0 * 0.98).abs() < 1e-9);
    }
}
