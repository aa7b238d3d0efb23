//! Path utilities for lockstep configuration files

use std::path::PathBuf;

/// Get the default configuration directory
///
/// Returns: `~/.config/lockstep` (platform config dir, home or `.` as fallback)
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lockstep")
}

/// Get the default config file path for a given file name
///
/// Returns: `~/.config/lockstep/{filename}`
pub fn default_config_path(filename: &str) -> PathBuf {
    default_config_dir().join(filename)
}
