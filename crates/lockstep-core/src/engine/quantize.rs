//! Beat quantization for seeks, cues, loops and beat jumps

use crate::beatgrid::BeatGrid;

/// Snap `position` to the nearest beat when quantize is on and a grid exists
///
/// Without a grid the position is returned unchanged: quantize is simply
/// unavailable. Snapping is idempotent and never moves by more than one beat.
#[inline]
pub fn snap(position: f64, grid: Option<&BeatGrid>, quantize: bool) -> f64 {
    match grid {
        Some(grid) if quantize => grid.nearest_beat(position),
        _ => position,
    }
}
