//! Lockstep Core - Deck synchronization engine for multi-deck DJ software
//!
//! Keeps concurrently playing decks locked in tempo and beat phase against a
//! shared master timebase. See [`engine::create_engine`] for the entry point.

pub mod beatgrid;
pub mod config;
pub mod control;
pub mod engine;
pub mod types;

pub use types::*;
