//! Beat grid error types

use thiserror::Error;

/// Errors raised when building or editing a beat grid
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    /// BPM is zero, negative or not finite
    #[error("Invalid BPM: {0}")]
    InvalidBpm(f64),

    /// Sample rate of zero
    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    /// A detected grid needs at least two beats to define a tempo
    #[error("Beat grid needs at least {min} beats, found {found}")]
    TooFewBeats { min: usize, found: usize },

    /// Beat positions must be strictly increasing
    #[error("Beat {index} is not after the previous beat")]
    NotIncreasing { index: usize },

    /// NaN or infinite beat position
    #[error("Beat {index} is not a finite position")]
    NonFinite { index: usize },
}

/// Result type for grid operations
pub type GridResult<T> = Result<T, GridError>;
