//! Named control points
//!
//! Skins, controller mappings and preferences talk to the engine through
//! numeric control points such as `deck1.sync_enabled` or `master.bpm`.
//! Names are parsed once on the control thread into a [`ControlKey`]; the
//! audio thread only ever sees keys, which index fixed atomic slots in the
//! [`ControlRegistry`].
//!
//! Deck numbers in names are 1-based (`deck1` .. `deck4`).

mod registry;

use thiserror::Error;

use crate::beatgrid::GridError;
use crate::types::{DeckId, NUM_DECKS};

pub use registry::ControlRegistry;

/// Errors returned to the control thread when writing control points
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    /// Name does not match any control point
    #[error("Unknown control: {0}")]
    UnknownControl(String),

    /// Write to a read-only mirror
    #[error("Control is read-only: {0}")]
    ReadOnly(ControlKey),

    /// NaN or infinite value
    #[error("Invalid value {value} for control {key}")]
    InvalidValue { key: ControlKey, value: f64 },

    /// Deck index out of range
    #[error("No such deck: {0:?}")]
    UnknownDeck(DeckId),

    /// The lock-free command queue to the audio thread is full
    #[error("Engine command queue is full")]
    QueueFull,

    /// A grid edit produced an invalid grid
    #[error("Beat grid edit failed: {0}")]
    Grid(#[from] GridError),
}

/// How a control point may be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Value written by the control thread, mirrored back by the engine
    ReadWrite,
    /// Mirror published by the engine
    ReadOnly,
    /// Fires an action when a value > 0 is written
    Trigger,
}

macro_rules! control_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => ($text:literal, $kind:ident),)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant,)*
        }

        impl $name {
            /// Every control of this group, in slot order
            pub const ALL: &'static [$name] = &[$($name::$variant,)*];

            /// Number of controls in this group
            pub const COUNT: usize = Self::ALL.len();

            /// Name as used in control paths
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)*
                }
            }

            /// Access kind
            pub fn kind(&self) -> ControlKind {
                match self {
                    $($name::$variant => ControlKind::$kind,)*
                }
            }

            fn from_name(name: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|c| c.name() == name)
            }
        }
    };
}

control_enum! {
    /// Per-deck control points
    pub enum DeckControl {
        SyncEnabled => ("sync_enabled", ReadWrite),
        SyncMaster => ("sync_master", ReadWrite),
        SyncRole => ("sync_role", ReadOnly),
        BeatSync => ("beatsync", Trigger),
        BeatSyncTempo => ("beatsync_tempo", Trigger),
        BeatSyncPhase => ("beatsync_phase", Trigger),
        Rate => ("rate", ReadWrite),
        RateTempUp => ("rate_temp_up", ReadWrite),
        RateTempDown => ("rate_temp_down", ReadWrite),
        Bpm => ("bpm", ReadWrite),
        FileBpm => ("file_bpm", ReadOnly),
        Quantize => ("quantize", ReadWrite),
        Keylock => ("keylock", ReadWrite),
        Play => ("play", ReadWrite),
        PlayPosition => ("playposition", ReadWrite),
        ScratchEnable => ("scratch_enable", ReadWrite),
        ScratchRate => ("scratch_rate", ReadWrite),
        CueSet => ("cue_set", Trigger),
        CueGoto => ("cue_goto", Trigger),
        LoopIn => ("loop_in", Trigger),
        LoopOut => ("loop_out", Trigger),
        ReloopToggle => ("reloop_toggle", Trigger),
        BeatjumpForward => ("beatjump_forward", Trigger),
        BeatjumpBackward => ("beatjump_backward", Trigger),
        BeatjumpSize => ("beatjump_size", ReadWrite),
        BeatsTranslateEarlier => ("beats_translate_earlier", Trigger),
        BeatsTranslateLater => ("beats_translate_later", Trigger),
        BeatsTranslateCurpos => ("beats_translate_curpos", Trigger),
        BeatsScaleDouble => ("beats_scale_double", Trigger),
        BeatsScaleHalve => ("beats_scale_halve", Trigger),
        BeatsScaleTwoThirds => ("beats_scale_two_thirds", Trigger),
        BeatsScaleThreeFourths => ("beats_scale_three_fourths", Trigger),
        BpmTap => ("bpm_tap", Trigger),
        Phase => ("phase", ReadOnly),
        PhaseError => ("phase_error", ReadOnly),
        EffectiveRate => ("effective_rate", ReadOnly),
        Position => ("position", ReadOnly),
        CuePoint => ("cue_point", ReadOnly),
        LoopStart => ("loop_start", ReadOnly),
        LoopEnd => ("loop_end", ReadOnly),
        LoopActive => ("loop_active", ReadOnly),
        TrackLoaded => ("track_loaded", ReadOnly),
        HasTempo => ("has_tempo", ReadOnly),
    }
}

control_enum! {
    /// Process-wide control points
    pub enum GlobalControl {
        MasterBpm => ("master.bpm", ReadOnly),
        MasterPhase => ("master.phase", ReadOnly),
        MasterSource => ("master.source", ReadOnly),
        MasterDeckActive => ("master.deck_active", ReadOnly),
        InternalClockBpm => ("internal_clock.bpm", ReadWrite),
        InternalClockSyncMaster => ("internal_clock.sync_master", ReadWrite),
    }
}

impl DeckControl {
    /// Grid edits and tap tempo run on the control thread; the audio thread
    /// only receives the resulting grid or BPM.
    pub fn is_control_side(&self) -> bool {
        matches!(
            self,
            Self::BeatsTranslateEarlier
                | Self::BeatsTranslateLater
                | Self::BeatsTranslateCurpos
                | Self::BeatsScaleDouble
                | Self::BeatsScaleHalve
                | Self::BeatsScaleTwoThirds
                | Self::BeatsScaleThreeFourths
                | Self::BpmTap
        )
    }
}

/// Parsed control point address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKey {
    Deck(DeckId, DeckControl),
    Global(GlobalControl),
}

/// Total number of control slots
pub const CONTROL_SLOT_COUNT: usize = NUM_DECKS * DeckControl::COUNT + GlobalControl::COUNT;

impl ControlKey {
    /// Parse a control path such as `deck2.rate` or `master.bpm`
    pub fn parse(name: &str) -> Result<Self, ControlError> {
        let unknown = || ControlError::UnknownControl(name.to_string());

        if let Some(global) = GlobalControl::from_name(name) {
            return Ok(Self::Global(global));
        }

        let rest = name.strip_prefix("deck").ok_or_else(unknown)?;
        let (number, control) = rest.split_once('.').ok_or_else(unknown)?;
        let number: usize = number.parse().map_err(|_| unknown())?;
        let deck = number
            .checked_sub(1)
            .and_then(DeckId::from_index)
            .ok_or_else(unknown)?;
        let control = DeckControl::from_name(control).ok_or_else(unknown)?;
        Ok(Self::Deck(deck, control))
    }

    /// Access kind of the addressed control
    pub fn kind(&self) -> ControlKind {
        match self {
            Self::Deck(_, control) => control.kind(),
            Self::Global(control) => control.kind(),
        }
    }

    /// Index of the backing slot
    #[inline]
    pub fn slot(&self) -> usize {
        match self {
            Self::Deck(deck, control) => deck.index() * DeckControl::COUNT + *control as usize,
            Self::Global(control) => NUM_DECKS * DeckControl::COUNT + *control as usize,
        }
    }

    /// Every control key in slot order
    pub fn all() -> impl Iterator<Item = ControlKey> {
        let deck_keys = DeckId::all()
            .flat_map(|deck| DeckControl::ALL.iter().map(move |&c| ControlKey::Deck(deck, c)));
        let global_keys = GlobalControl::ALL.iter().map(|&c| ControlKey::Global(c));
        deck_keys.chain(global_keys)
    }
}

impl std::fmt::Display for ControlKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deck(deck, control) => write!(f, "deck{}.{}", deck, control.name()),
            Self::Global(control) => f.write_str(control.name()),
        }
    }
}
