//! Configuration for the sync engine
//!
//! - Generic YAML config loading/saving
//! - Default config paths
//! - [`SyncConfig`] with the rate and sync tuning constants
//!
//! # Usage
//!
//! ```ignore
//! use lockstep_core::config::{default_config_path, load_config, SyncConfig};
//!
//! let config: SyncConfig = load_config(&default_config_path("sync.yaml"));
//! let config = config.sanitized();
//! ```

mod io;
mod paths;
mod sync;

pub use io::{load_config, read_config, save_config};
pub use paths::{default_config_dir, default_config_path};
pub use sync::{ClockSource, RampingMode, SyncConfig};
