use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;

/// Fixed-size grid of per-channel intensities in `0.0..=1.0`, stored flat in
/// row-major, channel-interleaved order.
#[derive(Clone, Debug, PartialEq)]
pub struct MotionGrid {
    width: u32,
    height: u32,
    channels: u32,
    samples: Vec<f32>,
}

impl MotionGrid {
    pub fn new(width: u32, height: u32, channels: u32, samples: Vec<f32>) -> Result<Self> {
        let expected = width
            .checked_mul(height)
            .and_then(|v| v.checked_mul(channels))
            .ok_or_else(|| anyhow!("grid dimensions overflow"))? as usize;
        if expected == 0 {
            return Err(anyhow!("grid must have at least one sample"));
        }
        if samples.len() != expected {
            return Err(anyhow!(
                "grid length mismatch: expected {}, got {}",
                expected,
                samples.len()
            ));
        }
        Ok(Self {
            width,
            height,
            channels,
            samples,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn same_shape(&self, other: &MotionGrid) -> bool {
        self.width == other.width && self.height == other.height && self.channels == other.channels
    }
}

/// Decode-and-resample capability the scorer depends on.
///
/// Implementations must not retain the input bytes beyond the call.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, bytes: &[u8], width: u32, height: u32) -> Result<MotionGrid>;
}

/// Normalizer backed by the `image` crate: any format it can decode, resampled
/// to RGB at the requested size.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageNormalizer;

impl Normalizer for ImageNormalizer {
    fn normalize(&self, bytes: &[u8], width: u32, height: u32) -> Result<MotionGrid> {
        let image = image::load_from_memory(bytes).context("decode frame")?;
        let resized = image.resize_exact(width, height, FilterType::Triangle);
        let rgb = resized.into_rgb8();
        let samples = rgb
            .into_raw()
            .into_iter()
            .map(|v| f32::from(v) / 255.0)
            .collect();
        MotionGrid::new(width, height, 3, samples)
    }
}
