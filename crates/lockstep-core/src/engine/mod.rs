//! Sync engine - decks, rate control, master election
//!
//! This module contains the real-time side of Lockstep:
//! - Deck: transport state of one deck (grid, position, cue, loop)
//! - RateControl / SyncControl: per-deck rate and follower correction
//! - EngineSync: master timebase and election
//! - SyncEngine: per-buffer pipeline run by the audio thread
//! - EngineController: control-thread handle (control points, commands)

mod clock;
mod command;
mod controller;
mod deck;
mod engine;
mod engine_sync;
pub mod gc;
mod quantize;
mod rate;
mod sync_control;
mod tap;

use std::sync::Arc;

use basedrop::Shared;

pub use clock::*;
pub use command::*;
pub use controller::*;
pub use deck::*;
pub use engine::*;
pub use engine_sync::*;
pub use quantize::snap;
pub use rate::*;
pub use sync_control::*;
pub use tap::*;

use crate::config::SyncConfig;
use crate::control::ControlRegistry;

/// Build an engine and its control-thread handles
///
/// The [`SyncEngine`] goes to the audio thread; the [`EngineController`]
/// stays with the caller; the [`ExternalClockHandle`] goes to whatever
/// feeds the external clock.
pub fn create_engine(config: SyncConfig) -> (SyncEngine, EngineController, ExternalClockHandle) {
    let config = config.sanitized();
    let gc = gc::gc_handle();
    let controls = Arc::new(ControlRegistry::new());
    let (command_tx, command_rx) = command_channel();
    let (event_tx, event_rx) = event_channel();
    let (external, external_handle) = ExternalClock::new();

    let engine = SyncEngine::new(
        Shared::new(&gc, config.clone()),
        Arc::clone(&controls),
        command_rx,
        event_tx,
        external,
    );
    let controller = EngineController::new(controls, command_tx, event_rx, gc, config);

    log::info!("Sync engine created ({} decks)", crate::types::NUM_DECKS);
    (engine, controller, external_handle)
}
