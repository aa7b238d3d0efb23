//! Simulation scenarios
//!
//! A scenario lists the tracks to load and timed actions to apply, stored as
//! YAML:
//!
//! ```yaml
//! seconds: 20
//! tracks:
//!   - deck: 1
//!     grid: { kind: constant, sample_rate: 48000, first_beat: 0, bpm: 128 }
//!   - deck: 2
//!     grid: { kind: constant, sample_rate: 48000, first_beat: 9000, bpm: 130 }
//! actions:
//!   - { at: 0.0, do: set, control: deck1.sync_enabled, value: 1 }
//!   - { at: 0.0, do: set, control: deck1.play, value: 1 }
//!   - { at: 10.0, do: eject, deck: 1 }
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use lockstep_core::beatgrid::BeatGrid;
use lockstep_core::engine::{EngineController, ExternalClockHandle};
use lockstep_core::DeckId;

/// Track placed on a deck
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSpec {
    /// 1-based deck number
    pub deck: usize,
    /// Beat grid; omitted for a track still being analysed
    #[serde(default)]
    pub grid: Option<BeatGrid>,
    /// Track length in seconds
    #[serde(default = "default_length_seconds")]
    pub length_seconds: f64,
    /// Track sample rate, the grid's when omitted
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

fn default_length_seconds() -> f64 {
    600.0
}

impl TrackSpec {
    fn deck_id(&self) -> Result<DeckId> {
        deck_id(self.deck)
    }

    fn sample_rate(&self, engine_rate: u32) -> u32 {
        self.sample_rate
            .or_else(|| self.grid.as_ref().map(BeatGrid::sample_rate))
            .unwrap_or(engine_rate)
    }
}

fn deck_id(number: usize) -> Result<DeckId> {
    number
        .checked_sub(1)
        .and_then(DeckId::from_index)
        .with_context(|| format!("Invalid deck number {}", number))
}

/// What an action does
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "do", rename_all = "snake_case")]
pub enum ActionKind {
    /// Write a control point
    Set { control: String, value: f64 },
    /// Load a track
    Load { track: TrackSpec },
    /// Unload a deck (1-based)
    Eject { deck: usize },
    /// Replace a deck's grid
    Grid { deck: usize, grid: Option<BeatGrid> },
    /// Feed the external clock
    ExternalClock { bpm: f64, beat: f64 },
    /// Stop feeding the external clock
    DisconnectExternal,
}

/// Timed action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Time in seconds from the start of the run
    pub at: f64,
    #[serde(flatten)]
    pub kind: ActionKind,
}

/// A full simulation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// Run length in seconds
    pub seconds: f64,
    /// Audio buffer size in frames
    pub buffer_size: usize,
    /// Tracks loaded before the first buffer
    pub tracks: Vec<TrackSpec>,
    pub actions: Vec<Action>,
}

impl Default for Scenario {
    /// Deck 1 leads at 128 BPM, deck 2 follows from 130 BPM, deck 1 is
    /// ejected halfway and the internal clock takes over
    fn default() -> Self {
        let constant = |bpm, first_beat| BeatGrid::constant(48000, bpm, first_beat).ok();
        let set = |at, control: &str, value| Action {
            at,
            kind: ActionKind::Set {
                control: control.to_string(),
                value,
            },
        };
        Self {
            seconds: 20.0,
            buffer_size: 256,
            tracks: vec![
                TrackSpec {
                    deck: 1,
                    grid: constant(128.0, 0.0),
                    length_seconds: default_length_seconds(),
                    sample_rate: None,
                },
                TrackSpec {
                    deck: 2,
                    grid: constant(130.0, 9000.0),
                    length_seconds: default_length_seconds(),
                    sample_rate: None,
                },
            ],
            actions: vec![
                set(0.0, "deck1.sync_enabled", 1.0),
                set(0.0, "deck2.sync_enabled", 1.0),
                set(0.0, "deck1.play", 1.0),
                set(0.5, "deck2.play", 1.0),
                Action {
                    at: 10.0,
                    kind: ActionKind::Eject { deck: 1 },
                },
            ],
        }
    }
}

impl Scenario {
    /// Check the scenario before running it
    pub fn validate(&self) -> Result<()> {
        if !(self.seconds > 0.0 && self.seconds.is_finite()) {
            bail!("Scenario length must be positive, got {}", self.seconds);
        }
        if self.buffer_size == 0 {
            bail!("Buffer size must be at least one frame");
        }
        for track in &self.tracks {
            track.deck_id()?;
        }
        for action in &self.actions {
            match &action.kind {
                ActionKind::Load { track } => {
                    track.deck_id()?;
                }
                ActionKind::Eject { deck } | ActionKind::Grid { deck, .. } => {
                    deck_id(*deck)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Actions sorted by time
    pub fn timeline(&self) -> Vec<Action> {
        let mut actions = self.actions.clone();
        actions.sort_by(|a, b| a.at.total_cmp(&b.at));
        actions
    }
}

/// Load a track through the controller
pub fn load_track(
    controller: &mut EngineController,
    track: &TrackSpec,
    engine_rate: u32,
) -> Result<()> {
    let deck = track.deck_id()?;
    let sample_rate = track.sample_rate(engine_rate);
    let length = (track.length_seconds.max(0.0) * sample_rate as f64) as u64;
    controller
        .load_track(deck, track.grid.clone(), length, sample_rate)
        .with_context(|| format!("Failed to load track on deck {}", deck))
}

/// Apply one action
pub fn apply(
    action: &Action,
    controller: &mut EngineController,
    external: &ExternalClockHandle,
) -> Result<()> {
    log::info!("t={:.2}s: {:?}", action.at, action.kind);
    let engine_rate = controller.config().sample_rate;
    match &action.kind {
        ActionKind::Set { control, value } => controller
            .set(control, *value)
            .with_context(|| format!("Failed to set {}", control))?,
        ActionKind::Load { track } => load_track(controller, track, engine_rate)?,
        ActionKind::Eject { deck } => controller.eject_track(deck_id(*deck)?)?,
        ActionKind::Grid { deck, grid } => controller.set_beat_grid(deck_id(*deck)?, grid.clone())?,
        ActionKind::ExternalClock { bpm, beat } => external.update(*bpm, *beat),
        ActionKind::DisconnectExternal => external.disconnect(),
    }
    Ok(())
}
