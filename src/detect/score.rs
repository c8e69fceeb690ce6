use std::sync::Arc;

use anyhow::Result;

use super::normalize::{MotionGrid, Normalizer};
use super::DetectionSettings;

/// Reported when there is no previous grid to compare against.
pub const MISSING_PREVIOUS_SENTINEL: f64 = 0.1;

/// Reported when the previous grid has a different shape than the current one.
pub const SHAPE_MISMATCH_SENTINEL: f64 = 0.3;

/// Scaled difference between two grids.
///
/// Never fails: a missing or incompatible baseline yields a small nonzero
/// sentinel so the caller degrades to "little or no motion".
pub fn difference(previous: Option<&MotionGrid>, current: &MotionGrid, scale: f64) -> f64 {
    let Some(previous) = previous else {
        return MISSING_PREVIOUS_SENTINEL;
    };
    if !previous.same_shape(current) {
        return SHAPE_MISMATCH_SENTINEL;
    }

    let cur = current.samples();
    let total: f64 = cur
        .iter()
        .zip(previous.samples())
        .map(|(c, p)| f64::from((c - p).abs()))
        .sum();

    total * scale / cur.len() as f64
}

/// Frame-to-grid reduction plus differencing. Knows nothing about cameras or
/// events.
pub struct MotionScorer {
    normalizer: Arc<dyn Normalizer>,
    grid_size: u32,
    diff_scale: f64,
}

impl MotionScorer {
    pub fn new(normalizer: Arc<dyn Normalizer>, settings: &DetectionSettings) -> Self {
        Self {
            normalizer,
            grid_size: settings.grid_size,
            diff_scale: settings.diff_scale,
        }
    }

    /// Normalize `raw` and difference it against `previous`.
    ///
    /// Errors only when the frame cannot be decoded.
    pub fn score(&self, previous: Option<&MotionGrid>, raw: &[u8]) -> Result<(MotionGrid, f64)> {
        let current = self
            .normalizer
            .normalize(raw, self.grid_size, self.grid_size)?;
        let raw_diff = difference(previous, &current, self.diff_scale);
        Ok((current, raw_diff))
    }
}
