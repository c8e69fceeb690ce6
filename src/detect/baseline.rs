/// Exponentially-weighted moving average of a camera's raw difference signal.
///
/// The average tracks every observed frame, alarmed or not. Rating is
/// stateful and order-dependent: feeding the same value twice only rates the
/// same on a freshly seeded baseline.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Baseline {
    alpha: f64,
    ewma: Option<f64>,
}

impl Baseline {
    pub fn new(alpha: f64, ewma: Option<f64>) -> Self {
        Self { alpha, ewma }
    }

    pub fn ewma(&self) -> Option<f64> {
        self.ewma
    }

    /// Fold `raw_diff` into the average, then rate it against the updated average.
    pub fn observe(&mut self, raw_diff: f64) -> u8 {
        let ewma = match self.ewma {
            Some(prev) => self.alpha * raw_diff + (1.0 - self.alpha) * prev,
            None => raw_diff,
        };
        self.ewma = Some(ewma);
        motion_rating(raw_diff, ewma)
    }
}

/// `|raw - ewma| / ewma` as a percentage, clamped to `0..=100`.
pub fn motion_rating(raw_diff: f64, ewma: f64) -> u8 {
    if ewma == 0.0 || raw_diff == 0.0 {
        return 0;
    }
    let deviation = ((raw_diff - ewma) / ewma).abs() * 100.0;
    if !deviation.is_finite() {
        return 100;
    }
    deviation.round().clamp(0.0, 100.0) as u8
}
