//! Lock-free command and event queues between control and audio threads
//!
//! Numeric control points travel through the atomic slots of the
//! [`crate::control::ControlRegistry`]. Everything that is not a single
//! number (a new beat grid, a track load, a config update) is sent as an
//! [`EngineCommand`] over an `rtrb` single-producer single-consumer queue.
//! The audio thread reports back through a second queue of
//! [`EngineEvent`]s, which the control thread drains and logs.
//!
//! # Real-Time Safety
//!
//! - **No allocations**: both ringbuffers are allocated at startup
//! - **Wait-free**: push and pop never block
//! - **Deferred frees**: payloads are `basedrop::Shared`, so dropping them
//!   on the audio thread only enqueues them for the GC thread
//!
//! # Usage
//!
//! ```ignore
//! let (mut tx, mut rx) = command_channel();
//!
//! // Control thread
//! tx.push(EngineCommand::EjectTrack { deck: DeckId(0) });
//!
//! // Audio thread, at the start of each buffer
//! engine.process_commands();
//! ```

use basedrop::Shared;

use super::engine_sync::MasterSource;
use super::sync_control::SyncRole;
use crate::beatgrid::BeatGrid;
use crate::config::SyncConfig;
use crate::types::DeckId;

/// Capacity of the command queue
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the event queue
pub const EVENT_QUEUE_CAPACITY: usize = 512;

/// Commands sent from the control thread to the audio thread
///
/// Commands are applied at the start of the next buffer, before any
/// control-point writes of that buffer.
pub enum EngineCommand {
    /// Load a track onto a deck
    LoadTrack {
        deck: DeckId,
        /// `None` while analysis is pending or when no tempo was detected
        grid: Option<Shared<BeatGrid>>,
        /// Track length in frames
        length: u64,
        /// Track sample rate in Hz
        sample_rate: u32,
    },
    /// Unload the track and reset the deck
    EjectTrack { deck: DeckId },
    /// Replace the beat grid (analysis finished, grid edited)
    SetBeatGrid {
        deck: DeckId,
        grid: Option<Shared<BeatGrid>>,
    },
    /// Swap in new tunables
    UpdateConfig(Shared<SyncConfig>),
}

/// Notifications from the audio thread
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineEvent {
    /// The master timebase switched to a new source
    MasterChanged {
        from: MasterSource,
        to: MasterSource,
        bpm: f64,
    },
    /// A deck's sync role changed
    RoleChanged { deck: DeckId, role: SyncRole },
    /// Playback reached the end of the track
    TrackEnded { deck: DeckId },
    /// A grid command arrived for a deck without a track
    GridIgnored { deck: DeckId },
}

/// Audio-thread end of the event queue
///
/// Events are dropped when the queue is full; the audio thread never waits.
pub struct EventSender {
    producer: rtrb::Producer<EngineEvent>,
    dropped: u64,
}

impl EventSender {
    pub fn new(producer: rtrb::Producer<EngineEvent>) -> Self {
        Self {
            producer,
            dropped: 0,
        }
    }

    /// Push an event, counting it as dropped if the queue is full
    #[inline]
    pub fn emit(&mut self, event: EngineEvent) {
        if self.producer.push(event).is_err() {
            self.dropped += 1;
        }
    }

    /// Events lost to a full queue since startup
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Create the command queue (control → audio)
pub fn command_channel() -> (rtrb::Producer<EngineCommand>, rtrb::Consumer<EngineCommand>) {
    rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY)
}

/// Create the event queue (audio → control)
pub fn event_channel() -> (EventSender, rtrb::Consumer<EngineEvent>) {
    let (producer, consumer) = rtrb::RingBuffer::new(EVENT_QUEUE_CAPACITY);
    (EventSender::new(producer), consumer)
}
