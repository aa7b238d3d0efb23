//! Control-thread façade of the sync engine
//!
//! [`EngineController`] is what skins, controller mappings and the
//! simulator talk to. Numeric writes are staged in the registry slots;
//! tracks, grids and config go through the command queue. Grid edits and
//! tap tempo run here, off the audio thread, and reach the engine as a new
//! grid or a BPM write.

use std::sync::Arc;
use std::time::Duration;

use basedrop::{Handle, Shared};

use super::command::{EngineCommand, EngineEvent};
use super::tap::TapTempo;
use crate::beatgrid::{BeatGrid, BpmScale};
use crate::config::SyncConfig;
use crate::control::{ControlError, ControlKey, ControlKind, ControlRegistry, DeckControl};
use crate::types::{DeckId, NUM_DECKS};

/// Control-thread handle to a running [`super::SyncEngine`]
pub struct EngineController {
    controls: Arc<ControlRegistry>,
    commands: rtrb::Producer<EngineCommand>,
    events: rtrb::Consumer<EngineEvent>,
    gc: Handle,
    config: SyncConfig,
    /// Copy of each deck's grid, the base for grid edits
    grids: [Option<BeatGrid>; NUM_DECKS],
    taps: [TapTempo; NUM_DECKS],
}

impl EngineController {
    pub fn new(
        controls: Arc<ControlRegistry>,
        commands: rtrb::Producer<EngineCommand>,
        events: rtrb::Consumer<EngineEvent>,
        gc: Handle,
        config: SyncConfig,
    ) -> Self {
        let taps = std::array::from_fn(|_| tap_for(&config));
        Self {
            controls,
            commands,
            events,
            gc,
            config,
            grids: Default::default(),
            taps,
        }
    }

    /// Registry shared with the audio thread, for readers such as a UI
    pub fn controls(&self) -> &Arc<ControlRegistry> {
        &self.controls
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Control-side copy of a deck's grid
    pub fn grid(&self, deck: DeckId) -> Option<&BeatGrid> {
        self.grids.get(deck.index())?.as_ref()
    }

    // --- Control points ---

    /// Write a control point by name
    pub fn set(&mut self, name: &str, value: f64) -> Result<(), ControlError> {
        let key = ControlKey::parse(name)?;
        self.set_key(key, value)
    }

    /// Write a control point
    ///
    /// Takes effect at the next buffer boundary. Triggers fire on any value
    /// above zero.
    pub fn set_key(&mut self, key: ControlKey, value: f64) -> Result<(), ControlError> {
        if let ControlKey::Deck(deck, _) = key {
            check_deck(deck)?;
        }
        if !value.is_finite() {
            return Err(ControlError::InvalidValue { key, value });
        }
        match key {
            ControlKey::Deck(deck, control) if control.is_control_side() => {
                if value > 0.0 {
                    self.control_side(deck, control)?;
                }
                Ok(())
            }
            _ if key.kind() == ControlKind::ReadOnly => Err(ControlError::ReadOnly(key)),
            _ => {
                self.controls.request(key, value);
                Ok(())
            }
        }
    }

    /// Read the last published value of a control point by name
    pub fn get(&self, name: &str) -> Result<f64, ControlError> {
        self.controls.get_by_name(name)
    }

    /// Read the last published value of a control point
    pub fn get_key(&self, key: ControlKey) -> Result<f64, ControlError> {
        if let ControlKey::Deck(deck, _) = key {
            check_deck(deck)?;
        }
        Ok(self.controls.get(key))
    }

    fn control_side(&mut self, deck: DeckId, control: DeckControl) -> Result<(), ControlError> {
        match control {
            DeckControl::BpmTap => {
                if let Some(bpm) = self.taps[deck.index()].tap() {
                    log::debug!("Deck {}: tap tempo {:.2} BPM", deck, bpm);
                    self.controls.request(ControlKey::Deck(deck, DeckControl::Bpm), bpm);
                }
                Ok(())
            }
            DeckControl::BeatsTranslateEarlier => {
                let frames = self.config.beat_translate_frames();
                self.edit_grid(deck, |grid| Ok(grid.translated(-frames)))
            }
            DeckControl::BeatsTranslateLater => {
                let frames = self.config.beat_translate_frames();
                self.edit_grid(deck, |grid| Ok(grid.translated(frames)))
            }
            DeckControl::BeatsTranslateCurpos => {
                let position = self.controls.get(ControlKey::Deck(deck, DeckControl::Position));
                self.edit_grid(deck, |grid| Ok(grid.with_beat_at(position)))
            }
            DeckControl::BeatsScaleDouble => self.scale_grid(deck, BpmScale::Double),
            DeckControl::BeatsScaleHalve => self.scale_grid(deck, BpmScale::Halve),
            DeckControl::BeatsScaleTwoThirds => self.scale_grid(deck, BpmScale::TwoThirds),
            DeckControl::BeatsScaleThreeFourths => self.scale_grid(deck, BpmScale::ThreeFourths),
            _ => Ok(()),
        }
    }

    fn scale_grid(&mut self, deck: DeckId, scale: BpmScale) -> Result<(), ControlError> {
        self.edit_grid(deck, |grid| Ok(grid.scaled(scale)?))
    }

    /// Apply an edit to the deck's grid and send the result to the engine.
    /// Decks without a grid ignore grid edits.
    fn edit_grid<F>(&mut self, deck: DeckId, edit: F) -> Result<(), ControlError>
    where
        F: FnOnce(&BeatGrid) -> Result<BeatGrid, ControlError>,
    {
        let Some(grid) = self.grids[deck.index()].as_ref() else {
            log::debug!("Deck {}: grid edit ignored, no beat grid", deck);
            return Ok(());
        };
        let edited = edit(grid)?;
        self.send_grid(deck, Some(edited))
    }

    // --- Commands ---

    fn push(&mut self, command: EngineCommand) -> Result<(), ControlError> {
        self.commands.push(command).map_err(|_| ControlError::QueueFull)
    }

    /// Load a track onto a deck. `grid` is `None` while analysis is
    /// pending; send it later with [`Self::set_beat_grid`].
    pub fn load_track(
        &mut self,
        deck: DeckId,
        grid: Option<BeatGrid>,
        length: u64,
        sample_rate: u32,
    ) -> Result<(), ControlError> {
        check_deck(deck)?;
        let shared = grid.clone().map(|g| Shared::new(&self.gc, g));
        self.push(EngineCommand::LoadTrack {
            deck,
            grid: shared,
            length,
            sample_rate,
        })?;
        match &grid {
            Some(g) => log::info!(
                "Deck {}: loaded track ({} frames, {:.2} BPM)",
                deck,
                length,
                g.bpm_at(g.first_beat())
            ),
            None => log::info!("Deck {}: loaded track ({} frames, no beat grid)", deck, length),
        }
        self.grids[deck.index()] = grid;
        self.taps[deck.index()].reset();
        Ok(())
    }

    /// Unload a deck. Sync is switched off for it.
    pub fn eject_track(&mut self, deck: DeckId) -> Result<(), ControlError> {
        check_deck(deck)?;
        self.push(EngineCommand::EjectTrack { deck })?;
        self.grids[deck.index()] = None;
        self.taps[deck.index()].reset();
        log::info!("Deck {}: ejected", deck);
        Ok(())
    }

    /// Replace a deck's grid, e.g. when analysis finishes
    pub fn set_beat_grid(&mut self, deck: DeckId, grid: Option<BeatGrid>) -> Result<(), ControlError> {
        check_deck(deck)?;
        self.send_grid(deck, grid)
    }

    fn send_grid(&mut self, deck: DeckId, grid: Option<BeatGrid>) -> Result<(), ControlError> {
        let shared = grid.clone().map(|g| Shared::new(&self.gc, g));
        self.push(EngineCommand::SetBeatGrid { deck, grid: shared })?;
        if let Some(g) = &grid {
            log::debug!(
                "Deck {}: beat grid set, first beat {:.1}, {:.2} BPM",
                deck,
                g.first_beat(),
                g.bpm_at(g.first_beat())
            );
        }
        self.grids[deck.index()] = grid;
        Ok(())
    }

    /// Swap in new tunables. Out-of-range values fall back to defaults.
    pub fn update_config(&mut self, config: SyncConfig) -> Result<(), ControlError> {
        let config = config.sanitized();
        let shared = Shared::new(&self.gc, config.clone());
        self.push(EngineCommand::UpdateConfig(shared))?;
        self.taps = std::array::from_fn(|_| tap_for(&config));
        self.config = config;
        log::info!("Sync config updated");
        Ok(())
    }

    // --- Events ---

    /// Drain and log the engine's events
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::with_capacity(self.events.slots());
        while let Ok(event) = self.events.pop() {
            log_event(&event);
            events.push(event);
        }
        events
    }
}

fn check_deck(deck: DeckId) -> Result<(), ControlError> {
    if deck.index() < NUM_DECKS {
        Ok(())
    } else {
        Err(ControlError::UnknownDeck(deck))
    }
}

fn tap_for(config: &SyncConfig) -> TapTempo {
    TapTempo::new(config.tap_history, Duration::from_millis(config.tap_timeout_ms))
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::MasterChanged { from, to, bpm } => {
            log::info!("Sync master: {} -> {} at {:.2} BPM", from, to, bpm);
        }
        EngineEvent::RoleChanged { deck, role } => {
            log::debug!("Deck {}: sync role {}", deck, role);
        }
        EngineEvent::TrackEnded { deck } => {
            log::info!("Deck {}: end of track", deck);
        }
        EngineEvent::GridIgnored { deck } => {
            log::warn!("Deck {}: beat grid ignored, no track loaded", deck);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::create_engine;
    use crate::engine::engine_sync::MasterSource;
    use crate::engine::SyncEngine;

    const SR: u32 = 48000;

    fn setup() -> (SyncEngine, EngineController) {
        let (engine, controller, _external) = create_engine(SyncConfig::default());
        (engine, controller)
    }

    fn load_128(controller: &mut EngineController, deck: usize) {
        let grid = BeatGrid::constant(SR, 128.0, 0.0).unwrap();
        controller
            .load_track(DeckId(deck), Some(grid), SR as u64 * 300, SR)
            .unwrap();
    }

    #[test]
    fn test_unknown_and_read_only_controls() {
        let (_engine, mut controller) = setup();
        assert!(matches!(
            controller.set("deck9.play", 1.0),
            Err(ControlError::UnknownControl(_))
        ));
        assert!(matches!(
            controller.set("deck1.nonsense", 1.0),
            Err(ControlError::UnknownControl(_))
        ));
        assert!(matches!(
            controller.set("master.bpm", 120.0),
            Err(ControlError::ReadOnly(_))
        ));
        assert!(matches!(
            controller.set("deck1.sync_role", 2.0),
            Err(ControlError::ReadOnly(_))
        ));
        assert!(matches!(
            controller.get("master.nothing"),
            Err(ControlError::UnknownControl(_))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let (_engine, mut controller) = setup();
        assert!(matches!(
            controller.set("deck1.rate", f64::NAN),
            Err(ControlError::InvalidValue { .. })
        ));
        assert!(matches!(
            controller.set("internal_clock.bpm", f64::INFINITY),
            Err(ControlError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unknown_deck() {
        let (_engine, mut controller) = setup();
        assert_eq!(
            controller.eject_track(DeckId(7)),
            Err(ControlError::UnknownDeck(DeckId(7)))
        );
        assert_eq!(
            controller.set_key(ControlKey::Deck(DeckId(4), DeckControl::Play), 1.0),
            Err(ControlError::UnknownDeck(DeckId(4)))
        );
        assert_eq!(
            controller.get_key(ControlKey::Deck(DeckId(7), DeckControl::Play)),
            Err(ControlError::UnknownDeck(DeckId(7)))
        );
        assert_eq!(
            controller.get_key(ControlKey::Deck(DeckId(3), DeckControl::Play)),
            Ok(0.0)
        );
    }

    #[test]
    fn test_writes_apply_at_next_buffer() {
        let (mut engine, mut controller) = setup();
        load_128(&mut controller, 0);
        controller.set("deck1.sync_enabled", 1.0).unwrap();
        assert_eq!(controller.get("deck1.sync_enabled").unwrap(), 0.0);

        engine.process(256);
        assert_eq!(controller.get("deck1.sync_enabled").unwrap(), 1.0);
        assert_eq!(controller.get("deck1.track_loaded").unwrap(), 1.0);
        assert_eq!(controller.get("deck1.has_tempo").unwrap(), 1.0);
        assert_eq!(controller.get("deck1.file_bpm").unwrap(), 128.0);
    }

    #[test]
    fn test_queue_full() {
        let (_engine, mut controller) = setup();
        let mut result = Ok(());
        for _ in 0..=crate::engine::COMMAND_QUEUE_CAPACITY {
            result = controller.eject_track(DeckId(0));
        }
        assert_eq!(result, Err(ControlError::QueueFull));
    }

    #[test]
    fn test_grid_translate() {
        let (mut engine, mut controller) = setup();
        load_128(&mut controller, 0);
        engine.process(256);

        controller.set("deck1.beats_translate_later", 1.0).unwrap();
        engine.process(256);
        let step = controller.config().beat_translate_frames();
        assert_eq!(controller.grid(DeckId(0)).unwrap().first_beat(), step);
        let engine_grid = engine.deck(DeckId(0)).unwrap().grid().unwrap();
        assert_eq!(engine_grid.first_beat(), step);

        controller.set("deck1.beats_translate_earlier", 1.0).unwrap();
        controller.set("deck1.beats_translate_earlier", 1.0).unwrap();
        engine.process(256);
        assert_eq!(engine.deck(DeckId(0)).unwrap().grid().unwrap().first_beat(), -step);
    }

    #[test]
    fn test_grid_translate_to_current_position() {
        let (mut engine, mut controller) = setup();
        load_128(&mut controller, 0);
        controller.set("deck1.playposition", 30_000.0).unwrap();
        engine.process(256);

        controller.set("deck1.beats_translate_curpos", 1.0).unwrap();
        engine.process(256);
        let deck = engine.deck(DeckId(0)).unwrap();
        assert!(deck.phase().unwrap().abs() < 1e-9 || (1.0 - deck.phase().unwrap()) < 1e-9);
    }

    #[test]
    fn test_grid_scale() {
        let (mut engine, mut controller) = setup();
        load_128(&mut controller, 1);
        controller.set("deck2.beats_scale_double", 1.0).unwrap();
        engine.process(256);
        assert_eq!(controller.get("deck2.file_bpm").unwrap(), 256.0);

        controller.set("deck2.beats_scale_halve", 1.0).unwrap();
        controller.set("deck2.beats_scale_three_fourths", 1.0).unwrap();
        engine.process(256);
        assert!((controller.get("deck2.file_bpm").unwrap() - 96.0).abs() < 1e-9);
    }

    #[test]
    fn test_grid_edit_without_grid_is_ignored() {
        let (mut engine, mut controller) = setup();
        controller
            .load_track(DeckId(0), None, SR as u64 * 60, SR)
            .unwrap();
        controller.set("deck1.beats_scale_double", 1.0).unwrap();
        engine.process(256);
        assert!(engine.deck(DeckId(0)).unwrap().grid().is_none());
        assert_eq!(controller.get("deck1.has_tempo").unwrap(), 0.0);
    }

    #[test]
    fn test_grid_without_track_is_reported() {
        let (mut engine, mut controller) = setup();
        let grid = BeatGrid::constant(SR, 120.0, 0.0).unwrap();
        controller.set_beat_grid(DeckId(2), Some(grid)).unwrap();
        engine.process(256);
        let events = controller.drain_events();
        assert!(events.contains(&EngineEvent::GridIgnored { deck: DeckId(2) }));
    }

    #[test]
    fn test_late_grid_enables_requested_sync() {
        let (mut engine, mut controller) = setup();
        controller
            .load_track(DeckId(0), None, SR as u64 * 60, SR)
            .unwrap();
        controller.set("deck1.sync_enabled", 1.0).unwrap();
        controller.set("deck1.play", 1.0).unwrap();
        engine.process(256);
        assert_eq!(controller.get("deck1.sync_role").unwrap(), 0.0);

        let grid = BeatGrid::constant(SR, 124.0, 0.0).unwrap();
        controller.set_beat_grid(DeckId(0), Some(grid)).unwrap();
        engine.process(256);
        assert_eq!(controller.get("deck1.sync_role").unwrap(), 2.0);
        assert_eq!(engine.timebase().source(), MasterSource::Deck(DeckId(0)));
    }

    #[test]
    fn test_events_are_drained() {
        let (mut engine, mut controller) = setup();
        load_128(&mut controller, 0);
        controller.set("deck1.sync_enabled", 1.0).unwrap();
        controller.set("deck1.play", 1.0).unwrap();
        engine.process(256);

        let events = controller.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::MasterChanged {
                to: MasterSource::Deck(DeckId(0)),
                ..
            }
        )));
        assert!(events.contains(&EngineEvent::RoleChanged {
            deck: DeckId(0),
            role: crate::engine::SyncRole::Master,
        }));
        assert!(controller.drain_events().is_empty());
    }

    #[test]
    fn test_config_update_reaches_engine() {
        let (mut engine, mut controller) = setup();
        let config = SyncConfig {
            rate_range: 0.5,
            ..Default::default()
        };
        controller.update_config(config).unwrap();
        engine.process(256);
        assert_eq!(engine.config().rate_range, 0.5);
    }

    #[test]
    fn test_tap_sets_bpm() {
        let (mut engine, mut controller) = setup();
        load_128(&mut controller, 0);
        engine.process(256);
        // Real taps are too slow for a unit test; feed the detector directly
        // and check the resulting write path
        let start = std::time::Instant::now();
        let tap = &mut controller.taps[0];
        tap.tap_at(start);
        let bpm = tap.tap_at(start + Duration::from_millis(500)).unwrap();
        controller
            .controls
            .request(ControlKey::Deck(DeckId(0), DeckControl::Bpm), bpm);
        engine.process(256);
        assert!((controller.get("deck1.bpm").unwrap() - 120.0).abs() < 1e-9);

        // A single tap through the control point gives no tempo yet
        controller.set("deck1.bpm_tap", 1.0).unwrap();
        assert!(!controller.controls().is_pending(ControlKey::Deck(DeckId(0), DeckControl::Bpm)));
    }
}
