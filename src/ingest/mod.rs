//! Frame ingestion.
//!
//! A `FrameSource` fetches exactly one still image per call from a camera's
//! configured URL. It does not retry, does not decode, and does not touch any
//! shared state: a failed capture simply means the caller skips this cycle.
//!
//! The ingestion layer MUST NOT:
//! - Log raw frame content
//! - Retain frames beyond handing them to the caller

pub mod http;

pub use http::HttpFrameSource;

use crate::model::CameraSource;
use crate::EpochMillis;

/// Default deadline for a single snapshot fetch.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Upper bound on accepted snapshot size.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 5 * 1024 * 1024;

/// One fetched frame, still encoded.
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedFrame {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub captured_at: EpochMillis,
}

/// Capture failures. Both kinds are recovered by skipping the cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureError {
    /// Connection failure, timeout, or truncated body.
    Fetch(String),
    /// The camera answered, but not with an image.
    InvalidResponse(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::Fetch(reason) => write!(f, "fetch failed: {}", reason),
            CaptureError::InvalidResponse(reason) => write!(f, "invalid response: {}", reason),
        }
    }
}

impl std::error::Error for CaptureError {}

pub trait FrameSource: Send + Sync {
    fn capture(&self, source: &CameraSource) -> Result<CapturedFrame, CaptureError>;
}
