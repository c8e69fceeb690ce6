//! Motion scoring.
//!
//! A frame is reduced to a small grid of intensity samples (`normalize`),
//! differenced against the previous grid (`score`), and the raw difference is
//! rated against the camera's own moving average (`baseline`).

mod baseline;
mod normalize;
mod score;

pub use baseline::{motion_rating, Baseline};
pub use normalize::{ImageNormalizer, MotionGrid, Normalizer};
pub use score::{difference, MotionScorer, MISSING_PREVIOUS_SENTINEL, SHAPE_MISMATCH_SENTINEL};

/// Edge length, in samples, of the grid every frame is reduced to.
pub const DEFAULT_GRID_SIZE: u32 = 100;

/// Smoothing factor of the moving average. Higher responds faster.
pub const DEFAULT_EWMA_ALPHA: f64 = 0.25;

/// Ratings strictly above this count as motion.
pub const DEFAULT_MOTION_THRESHOLD: u8 = 50;

/// Gain applied to the mean per-sample difference before rating.
pub const DEFAULT_DIFF_SCALE: f64 = 1_000_000.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionSettings {
    pub grid_size: u32,
    pub ewma_alpha: f64,
    pub motion_threshold: u8,
    pub diff_scale: f64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_GRID_SIZE,
            ewma_alpha: DEFAULT_EWMA_ALPHA,
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
            diff_scale: DEFAULT_DIFF_SCALE,
        }
    }
}

impl DetectionSettings {
    /// Strict: a rating equal to the threshold is not motion.
    pub fn is_motion(&self, rating: u8) -> bool {
        rating > self.motion_threshold
    }
}
