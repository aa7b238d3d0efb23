//! Beat grids
//!
//! A beat grid maps a track position (in sample frames) to beat boundaries.
//! Grids come from offline analysis in one of two shapes:
//!
//! - **Constant**: first beat position plus a fixed BPM. All queries are O(1).
//! - **Detected**: the full list of beat positions. Queries binary-search the
//!   list, so they are O(log n).
//!
//! Grids are immutable. Edits (`translated`, `scaled`, `with_beat_at`) return
//! a new grid that replaces the old one wholesale on the deck.
//!
//! Positions before the first or after the last detected beat extrapolate with
//! the first or last beat interval, so every query has an answer anywhere on
//! the timeline.

mod error;

use serde::{Deserialize, Serialize};

pub use error::{GridError, GridResult};

/// Minimum number of beats in a detected grid
pub const MIN_DETECTED_BEATS: usize = 2;

/// Beats on each side of the current beat averaged for a detected grid's local BPM
const BPM_WINDOW_BEATS: usize = 4;

/// Fraction of a beat treated as "on the next beat" when locating positions.
/// Absorbs float error so that snapping a snapped position is a no-op.
const BEAT_EPSILON: f64 = 1e-9;

/// Wholesale BPM scaling applied to a grid (double/halve and friends)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BpmScale {
    Double,
    Halve,
    TwoThirds,
    ThreeFourths,
    FourThirds,
    ThreeHalves,
}

impl BpmScale {
    /// BPM multiplier
    pub fn factor(&self) -> f64 {
        match self {
            Self::Double => 2.0,
            Self::Halve => 0.5,
            Self::TwoThirds => 2.0 / 3.0,
            Self::ThreeFourths => 0.75,
            Self::FourThirds => 4.0 / 3.0,
            Self::ThreeHalves => 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Layout {
    Constant { first_beat: f64, bpm: f64 },
    Detected { beats: Vec<f64> },
}

/// Serialized form of a beat grid, as stored by the track library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GridDescriptor {
    Constant {
        sample_rate: u32,
        first_beat: f64,
        bpm: f64,
    },
    Beats {
        sample_rate: u32,
        beats: Vec<f64>,
    },
}

/// Beat grid of one track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GridDescriptor", into = "GridDescriptor")]
pub struct BeatGrid {
    sample_rate: u32,
    layout: Layout,
}

/// Beat boundaries enclosing a position
#[derive(Debug, Clone, Copy, PartialEq)]
struct Located {
    /// Index of the beat at or before the position (negative before the grid)
    index: f64,
    prev: f64,
    next: f64,
}

impl BeatGrid {
    /// Create a constant-tempo grid
    pub fn constant(sample_rate: u32, bpm: f64, first_beat: f64) -> GridResult<Self> {
        check_sample_rate(sample_rate)?;
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(GridError::InvalidBpm(bpm));
        }
        if !first_beat.is_finite() {
            return Err(GridError::NonFinite { index: 0 });
        }
        Ok(Self {
            sample_rate,
            layout: Layout::Constant { first_beat, bpm },
        })
    }

    /// Create a grid from detected beat positions
    pub fn from_beats(sample_rate: u32, beats: Vec<f64>) -> GridResult<Self> {
        check_sample_rate(sample_rate)?;
        if beats.len() < MIN_DETECTED_BEATS {
            return Err(GridError::TooFewBeats {
                min: MIN_DETECTED_BEATS,
                found: beats.len(),
            });
        }
        for (index, &beat) in beats.iter().enumerate() {
            if !beat.is_finite() {
                return Err(GridError::NonFinite { index });
            }
            if index > 0 && beat <= beats[index - 1] {
                return Err(GridError::NotIncreasing { index });
            }
        }
        Ok(Self {
            sample_rate,
            layout: Layout::Detected { beats },
        })
    }

    /// Create a detected grid from a comma-separated list of sample positions
    pub fn from_csv(sample_rate: u32, csv: &str) -> GridResult<Self> {
        let beats = csv
            .split(',')
            .filter_map(|s| s.trim().parse::<f64>().ok())
            .collect();
        Self::from_beats(sample_rate, beats)
    }

    /// Sample rate the positions are expressed in
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// True for the compact constant-tempo form
    pub fn is_constant(&self) -> bool {
        matches!(self.layout, Layout::Constant { .. })
    }

    /// Position of the first beat
    pub fn first_beat(&self) -> f64 {
        match &self.layout {
            Layout::Constant { first_beat, .. } => *first_beat,
            Layout::Detected { beats } => beats[0],
        }
    }

    /// Number of detected beats (`None` for constant grids, which are unbounded)
    pub fn beat_count(&self) -> Option<usize> {
        match &self.layout {
            Layout::Constant { .. } => None,
            Layout::Detected { beats } => Some(beats.len()),
        }
    }

    fn locate(&self, position: f64) -> Located {
        match &self.layout {
            Layout::Constant { first_beat, bpm } => {
                let length = self.frames_per_beat(*bpm);
                let index = floor_beat((position - first_beat) / length);
                Located {
                    index,
                    prev: first_beat + index * length,
                    next: first_beat + (index + 1.0) * length,
                }
            }
            Layout::Detected { beats } => {
                let count = beats.partition_point(|&b| b <= position);
                let last = beats.len() - 1;
                if count == 0 {
                    // Before the grid: extrapolate with the first interval
                    let length = beats[1] - beats[0];
                    let index = floor_beat((position - beats[0]) / length);
                    Located {
                        index,
                        prev: beats[0] + index * length,
                        next: beats[0] + (index + 1.0) * length,
                    }
                } else if count > last {
                    // At or past the last beat: extrapolate with the last interval
                    let length = beats[last] - beats[last - 1];
                    let offset = floor_beat((position - beats[last]) / length).max(0.0);
                    Located {
                        index: last as f64 + offset,
                        prev: beats[last] + offset * length,
                        next: beats[last] + (offset + 1.0) * length,
                    }
                } else {
                    Located {
                        index: (count - 1) as f64,
                        prev: beats[count - 1],
                        next: beats[count],
                    }
                }
            }
        }
    }

    #[inline]
    fn frames_per_beat(&self, bpm: f64) -> f64 {
        self.sample_rate as f64 * 60.0 / bpm
    }

    /// Beat boundaries at or before / after a position
    pub fn enclosing_beats(&self, position: f64) -> (f64, f64) {
        let located = self.locate(position);
        (located.prev, located.next)
    }

    /// Length in frames of the beat containing `position`
    pub fn beat_length_at(&self, position: f64) -> f64 {
        let located = self.locate(position);
        located.next - located.prev
    }

    /// Continuous beat number at a position (0.0 = first beat)
    pub fn beat_index_at(&self, position: f64) -> f64 {
        let located = self.locate(position);
        located.index + (position - located.prev) / (located.next - located.prev)
    }

    /// Position of a (fractional) beat number, inverse of [`Self::beat_index_at`]
    pub fn position_at_beat_index(&self, beat_index: f64) -> f64 {
        match &self.layout {
            Layout::Constant { first_beat, bpm } => {
                first_beat + beat_index * self.frames_per_beat(*bpm)
            }
            Layout::Detected { beats } => {
                let last = beats.len() - 1;
                let whole = beat_index.floor();
                if whole < 0.0 {
                    beats[0] + beat_index * (beats[1] - beats[0])
                } else if whole as usize >= last {
                    beats[last] + (beat_index - last as f64) * (beats[last] - beats[last - 1])
                } else {
                    let i = whole as usize;
                    beats[i] + (beat_index - whole) * (beats[i + 1] - beats[i])
                }
            }
        }
    }

    /// Closest beat boundary; exact ties go to the later beat
    pub fn nearest_beat(&self, position: f64) -> f64 {
        let located = self.locate(position);
        if position - located.prev < located.next - position {
            located.prev
        } else {
            located.next
        }
    }

    /// Fractional position within the current beat, in [0, 1)
    pub fn phase_at(&self, position: f64) -> f64 {
        let located = self.locate(position);
        let phase = (position - located.prev) / (located.next - located.prev);
        if (0.0..1.0).contains(&phase) {
            phase
        } else {
            0.0
        }
    }

    /// Local tempo at a position
    ///
    /// Constant grids return their BPM exactly. Detected grids average the
    /// beats within [`BPM_WINDOW_BEATS`] of the current beat.
    pub fn bpm_at(&self, position: f64) -> f64 {
        match &self.layout {
            Layout::Constant { bpm, .. } => *bpm,
            Layout::Detected { beats } => {
                let last = beats.len() - 1;
                let current = self.locate(position).index.clamp(0.0, (last - 1) as f64) as usize;
                let lo = current.saturating_sub(BPM_WINDOW_BEATS);
                let hi = (current + 1 + BPM_WINDOW_BEATS).min(last);
                let span = beats[hi] - beats[lo];
                self.sample_rate as f64 * 60.0 * (hi - lo) as f64 / span
            }
        }
    }

    /// Position `beats` beats away from `position`, keeping its phase
    pub fn beats_from(&self, position: f64, beats: f64) -> f64 {
        self.position_at_beat_index(self.beat_index_at(position) + beats)
    }

    /// New grid shifted by `frames` (positive = later)
    pub fn translated(&self, frames: f64) -> Self {
        let layout = match &self.layout {
            Layout::Constant { first_beat, bpm } => Layout::Constant {
                first_beat: first_beat + frames,
                bpm: *bpm,
            },
            Layout::Detected { beats } => Layout::Detected {
                beats: beats.iter().map(|b| b + frames).collect(),
            },
        };
        Self {
            sample_rate: self.sample_rate,
            layout,
        }
    }

    /// New grid moved so that the closest beat lands on `position`
    pub fn with_beat_at(&self, position: f64) -> Self {
        self.translated(position - self.nearest_beat(position))
    }

    /// New grid with its tempo scaled, anchored at the first beat
    ///
    /// Detected grids are resampled along their own beat curve, so tempo
    /// drift in the detected beats is preserved.
    pub fn scaled(&self, scale: BpmScale) -> GridResult<Self> {
        let factor = scale.factor();
        match &self.layout {
            Layout::Constant { first_beat, bpm } => {
                Self::constant(self.sample_rate, bpm * factor, *first_beat)
            }
            Layout::Detected { beats } => {
                let span = (beats.len() - 1) as f64;
                let count = (span * factor + BEAT_EPSILON).floor() as usize + 1;
                let resampled = (0..count)
                    .map(|k| self.position_at_beat_index(k as f64 / factor))
                    .collect();
                Self::from_beats(self.sample_rate, resampled)
            }
        }
    }

    /// Descriptor for persistence
    pub fn descriptor(&self) -> GridDescriptor {
        self.clone().into()
    }
}

/// Floor a beat count, treating values a hair below the next integer as on it
#[inline]
fn floor_beat(beats: f64) -> f64 {
    let whole = beats.floor();
    if beats - whole > 1.0 - BEAT_EPSILON {
        whole + 1.0
    } else {
        whole
    }
}

fn check_sample_rate(sample_rate: u32) -> GridResult<()> {
    if sample_rate == 0 {
        Err(GridError::InvalidSampleRate(sample_rate))
    } else {
        Ok(())
    }
}

impl TryFrom<GridDescriptor> for BeatGrid {
    type Error = GridError;

    fn try_from(descriptor: GridDescriptor) -> GridResult<Self> {
        match descriptor {
            GridDescriptor::Constant {
                sample_rate,
                first_beat,
                bpm,
            } => Self::constant(sample_rate, bpm, first_beat),
            GridDescriptor::Beats { sample_rate, beats } => Self::from_beats(sample_rate, beats),
        }
    }
}

impl From<BeatGrid> for GridDescriptor {
    fn from(grid: BeatGrid) -> Self {
        match grid.layout {
            Layout::Constant { first_beat, bpm } => GridDescriptor::Constant {
                sample_rate: grid.sample_rate,
                first_beat,
                bpm,
            },
            Layout::Detected { beats } => GridDescriptor::Beats {
                sample_rate: grid.sample_rate,
                beats,
            },
        }
    }
}
