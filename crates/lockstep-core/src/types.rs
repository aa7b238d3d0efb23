//! Common types for Lockstep
//!
//! Fundamental identifiers and small lock-free primitives shared by the sync
//! engine, the control registry and the simulator.

use std::sync::atomic::{AtomicU64, Ordering};

/// Default sample rate used throughout Lockstep (48kHz - standard professional audio rate)
/// This is the default; the real rate comes from [`crate::config::SyncConfig`].
pub const SAMPLE_RATE: u32 = 48000;

/// Number of decks handled by the engine
pub const NUM_DECKS: usize = 4;

/// Deck identifier (0-3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeckId(pub usize);

impl DeckId {
    /// Create a new deck ID (panics if >= NUM_DECKS)
    pub fn new(id: usize) -> Self {
        assert!(id < NUM_DECKS, "Deck ID must be less than {}", NUM_DECKS);
        Self(id)
    }

    /// Create a deck ID from a 0-based index, `None` if out of range
    pub fn from_index(index: usize) -> Option<Self> {
        (index < NUM_DECKS).then_some(Self(index))
    }

    /// Get the 0-based index
    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }

    /// Get the deck number (1-4 for display and control names)
    pub fn display_number(&self) -> usize {
        self.0 + 1
    }

    /// Iterate all deck IDs in ascending order
    pub fn all() -> impl Iterator<Item = DeckId> {
        (0..NUM_DECKS).map(DeckId)
    }
}

impl std::fmt::Display for DeckId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_number())
    }
}

/// Playback state of a deck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayState {
    #[default]
    Stopped,
    Playing,
}

impl PlayState {
    /// Returns true if the playhead is advancing
    pub fn is_playing(&self) -> bool {
        matches!(self, Self::Playing)
    }
}

/// `f64` stored in an `AtomicU64` as raw bits
///
/// Used for control-point slots and published mirrors. All accesses use the
/// ordering passed by the caller so slots can pair a value with a flag.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> f64 {
        f64::from_bits(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, value: f64, order: Ordering) {
        self.0.store(value.to_bits(), order);
    }
}
