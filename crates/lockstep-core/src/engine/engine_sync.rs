//! Process-wide sync coordination
//!
//! [`EngineSync`] owns the [`MasterTimebase`] and decides, once per buffer,
//! which source drives it: a deck, the internal clock or the external clock.
//!
//! # Election
//!
//! 1. A master deck that stopped, lost its grid or left sync is dropped.
//! 2. An explicit request (`deckN.sync_master`) promotes that deck as soon
//!    as it is playing with a grid. Same-buffer requests: lowest deck wins.
//! 3. Otherwise, when no deck is master and the clock is not the explicit
//!    master, a deck is auto-elected if it just became the first playing,
//!    sync-enabled deck with a tempo. Ties go to the lowest deck index.
//! 4. With no master deck the clock takes over (external if configured and
//!    connected, else internal).
//!
//! # Continuity
//!
//! The timebase keeps a continuous beat count. Every buffer it adopts the
//! source's reading by keeping the predicted count and correcting only its
//! fractional part to the source's phase, so a change of source moves the
//! reference by at most the phase difference of the two sources. While a
//! deck is master the internal clock copies the timebase, so a fallback
//! resumes at the last BPM and phase.

use super::clock::{beats_in, ExternalClock, InternalClock, TempoReading, TempoSource};
use super::command::{EngineEvent, EventSender};
use super::deck::Deck;
use super::sync_control::{wrap_phase, SyncRole};
use crate::config::{ClockSource, SyncConfig};
use crate::types::{DeckId, NUM_DECKS};

/// What drives the master timebase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterSource {
    Deck(DeckId),
    InternalClock,
    ExternalClock,
}

impl MasterSource {
    /// Value published on `master.source`: deck number, 0 internal, -1 external
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Deck(deck) => deck.display_number() as f64,
            Self::InternalClock => 0.0,
            Self::ExternalClock => -1.0,
        }
    }

    pub fn deck(&self) -> Option<DeckId> {
        match self {
            Self::Deck(deck) => Some(*deck),
            _ => None,
        }
    }
}

impl std::fmt::Display for MasterSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deck(deck) => write!(f, "deck {}", deck),
            Self::InternalClock => f.write_str("internal clock"),
            Self::ExternalClock => f.write_str("external clock"),
        }
    }
}

/// Shared tempo reference for all followers
#[derive(Debug, Clone, PartialEq)]
pub struct MasterTimebase {
    bpm: f64,
    beat_position: f64,
    source: MasterSource,
}

impl MasterTimebase {
    pub fn new(bpm: f64, beat_position: f64, source: MasterSource) -> Self {
        Self {
            bpm,
            beat_position,
            source,
        }
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Continuous beat count
    pub fn beat_position(&self) -> f64 {
        self.beat_position
    }

    /// Phase within the current beat, in [0, 1)
    pub fn phase(&self) -> f64 {
        self.beat_position.rem_euclid(1.0)
    }

    pub fn source(&self) -> MasterSource {
        self.source
    }

    pub fn reading(&self) -> TempoReading {
        TempoReading {
            bpm: self.bpm,
            beat_position: self.beat_position,
        }
    }

    /// Lock onto a source reading without breaking the beat count
    pub fn adopt(&mut self, reading: TempoReading) {
        let correction = wrap_phase(reading.phase() - self.phase());
        self.beat_position += correction;
        self.bpm = reading.bpm;
    }

    /// Run forward by `seconds` at the current BPM
    pub fn advance(&mut self, seconds: f64) {
        self.beat_position += beats_in(self.bpm, seconds);
    }
}

/// Process-wide sync coordinator, owned by the audio thread
pub struct EngineSync {
    timebase: MasterTimebase,
    internal: InternalClock,
    external: ExternalClock,
    clock_source: ClockSource,
    /// Internal clock chosen explicitly as master
    clock_master: bool,
    /// Deck explicitly asked to be master, waiting or granted
    requested_master: Option<DeckId>,
    /// Master deck that gave up the role this buffer
    released_master: Option<DeckId>,
    /// Decks that were playing, synced and had a tempo last buffer
    was_candidate: [bool; NUM_DECKS],
}

impl EngineSync {
    pub fn new(config: &SyncConfig, external: ExternalClock) -> Self {
        let internal = InternalClock::new(config.internal_clock_bpm);
        Self {
            timebase: MasterTimebase::new(internal.bpm(), 0.0, MasterSource::InternalClock),
            internal,
            external,
            clock_source: config.clock_source,
            clock_master: false,
            requested_master: None,
            released_master: None,
            was_candidate: [false; NUM_DECKS],
        }
    }

    pub fn timebase(&self) -> &MasterTimebase {
        &self.timebase
    }

    /// Deck currently driving the timebase
    pub fn master_deck(&self) -> Option<DeckId> {
        self.timebase.source.deck()
    }

    pub fn internal_clock(&self) -> &InternalClock {
        &self.internal
    }

    /// Internal clock chosen explicitly as master
    pub fn is_clock_master(&self) -> bool {
        self.clock_master
    }

    /// Deck that asked to be master
    pub fn requested_master(&self) -> Option<DeckId> {
        self.requested_master
    }

    /// Apply a config update
    pub fn apply_config(&mut self, config: &SyncConfig) {
        self.clock_source = config.clock_source;
    }

    /// Explicit "set as master" for a deck
    pub fn request_master(&mut self, deck: DeckId) {
        self.requested_master = Some(deck);
        if self.released_master == Some(deck) {
            self.released_master = None;
        }
    }

    /// The deck gives up the master role or its pending request
    pub fn release_master(&mut self, deck: DeckId) {
        if self.requested_master == Some(deck) {
            self.requested_master = None;
        }
        if self.master_deck() == Some(deck) {
            self.released_master = Some(deck);
        }
    }

    /// Make the internal clock the explicit master, or hand it back to
    /// auto-election
    pub fn set_clock_master(&mut self, enabled: bool) {
        self.clock_master = enabled;
        if enabled {
            self.requested_master = None;
        }
    }

    /// `internal_clock.bpm` write: while a deck is master it is retimed
    /// instead, since the clock only mirrors it
    pub fn set_clock_bpm(&mut self, bpm: f64, decks: &mut [Deck; NUM_DECKS]) {
        match self.timebase.source {
            MasterSource::Deck(id) => decks[id.index()].set_bpm(bpm),
            _ => self.internal.set_bpm(bpm),
        }
    }

    /// Tempo change for the whole sync group, e.g. a follower's BPM write
    pub fn set_group_bpm(&mut self, bpm: f64, decks: &mut [Deck; NUM_DECKS]) {
        match self.timebase.source {
            MasterSource::Deck(id) => decks[id.index()].set_bpm(bpm),
            MasterSource::InternalClock => self.internal.set_bpm(bpm),
            // The external clock cannot be retimed from here
            MasterSource::ExternalClock => {}
        }
    }

    /// Refresh external clock data at buffer start
    pub fn begin_buffer(&mut self) {
        self.external.poll();
    }

    fn is_candidate(deck: &Deck) -> bool {
        deck.sync_requested() && deck.has_tempo() && deck.is_playing()
    }

    fn clock(&self) -> MasterSource {
        if self.clock_source == ClockSource::External
            && !self.clock_master
            && self.external.is_connected()
        {
            MasterSource::ExternalClock
        } else {
            MasterSource::InternalClock
        }
    }

    /// Pick the master source and assign deck roles for this buffer
    pub fn elect(&mut self, decks: &mut [Deck; NUM_DECKS], events: &mut EventSender) {
        let candidates: [bool; NUM_DECKS] = std::array::from_fn(|i| Self::is_candidate(&decks[i]));

        // A master that stopped, lost its grid, left sync or stepped down
        let released = self.released_master.take();
        let mut master = self
            .master_deck()
            .filter(|id| candidates[id.index()] && released != Some(*id) && !self.clock_master);
        if let Some(old) = self.master_deck() {
            if master.is_none() && self.requested_master == Some(old) {
                self.requested_master = None;
            }
        }

        // Explicit request, honoured once the deck can lead
        if let Some(requested) = self.requested_master {
            let deck = &decks[requested.index()];
            if !deck.has_track() || !deck.sync_requested() {
                self.requested_master = None;
            } else if candidates[requested.index()] {
                master = Some(requested);
                self.clock_master = false;
            }
        }

        // Auto-election: only when nobody was already playing in sync
        if master.is_none() && !self.clock_master {
            let established = (0..NUM_DECKS).any(|i| candidates[i] && self.was_candidate[i]);
            if !established {
                master = (0..NUM_DECKS)
                    .find(|&i| candidates[i] && released.map_or(true, |r| r.index() != i))
                    .map(DeckId);
            }
        }
        self.was_candidate = candidates;

        // Hand the timebase to the new source before any role changes
        let source = master.map_or_else(|| self.clock(), MasterSource::Deck);
        if source != self.timebase.source {
            let from = self.timebase.source;
            self.timebase.source = source;
            events.emit(EngineEvent::MasterChanged {
                from,
                to: source,
                bpm: self.timebase.bpm,
            });
            for deck in decks.iter_mut() {
                deck.request_rematch();
            }
        }

        for deck in decks.iter_mut() {
            let role = if master == Some(deck.id()) {
                SyncRole::Master
            } else if deck.sync_requested() && deck.has_tempo() {
                SyncRole::Follower
            } else {
                SyncRole::None
            };
            if deck.set_sync_role(role) {
                events.emit(EngineEvent::RoleChanged {
                    deck: deck.id(),
                    role,
                });
            }
        }
    }

    /// Adopt the current source's tempo and phase
    pub fn update_timebase(&mut self, decks: &[Deck; NUM_DECKS]) {
        let reading = match self.timebase.source {
            MasterSource::Deck(id) => decks[id.index()].tempo_reading(),
            MasterSource::InternalClock => self.internal.tempo_reading(),
            MasterSource::ExternalClock => self.external.tempo_reading(),
        };
        if let Some(reading) = reading {
            self.timebase.adopt(reading);
        }
    }

    /// Run queued one-shot syncs. The master itself and decks without a
    /// grid ignore them.
    pub fn apply_one_shots(&self, decks: &mut [Deck; NUM_DECKS], config: &SyncConfig) {
        for deck in decks.iter_mut() {
            let shot = deck.take_one_shot();
            if shot.is_empty() || !deck.has_tempo() || self.master_deck() == Some(deck.id()) {
                continue;
            }
            if shot.tempo {
                deck.sync_tempo_once(&self.timebase, config);
            }
            if shot.phase {
                deck.sync_phase_once(&self.timebase);
            }
        }
    }

    /// Compute follower corrections for this buffer
    pub fn track_followers(&self, decks: &mut [Deck; NUM_DECKS], config: &SyncConfig, frames: usize) {
        for deck in decks.iter_mut() {
            match deck.sync_role() {
                SyncRole::Follower => deck.follow(&self.timebase, config, frames),
                _ => deck.stop_following(config),
            }
        }
    }

    /// Move the timebase and clocks to the end of the buffer
    pub fn end_buffer(&mut self, seconds: f64) {
        self.timebase.advance(seconds);
        self.external.advance(seconds);
        match self.timebase.source {
            MasterSource::InternalClock => self.internal.advance(seconds),
            _ => self.internal.follow(self.timebase.reading()),
        }
    }
}
