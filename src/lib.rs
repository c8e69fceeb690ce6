//! Motion detection and event aggregation for polled network cameras.
//!
//! This crate implements a capture/detect/aggregate loop that runs once per
//! camera and survives execution-time limits by handing itself off to a task
//! queue.
//!
//! # Architecture
//!
//! Per frame, the poll loop runs:
//!
//! 1. **Capture**: one HTTP(S) snapshot from the camera (`ingest`).
//! 2. **Score**: reduce the frame to a fixed grid and difference it against the
//!    previous grid (`detect::score`).
//! 3. **Rate**: compare the raw difference to the camera's own moving average
//!    (`detect::Baseline`) to get a 0-100 motion rating.
//! 4. **Aggregate**: open, extend, or close the camera's event (`event`).
//!
//! Soft per-camera state (last grid, baseline, open event, pending trigger,
//! timestamps) lives in a volatile cache (`cache`). Events, frames and camera
//! sources live in the durable store (`storage`). A watchdog (`watchdog`)
//! re-arms cameras whose loop died without handing off.
//!
//! # Module Structure
//!
//! - `model`: durable records (CameraSource, CameraEvent, CameraFrame)
//! - `storage`: durable store (SQLite, in-memory)
//! - `cache`: volatile per-camera state
//! - `ingest`: frame source adapter
//! - `detect`: motion scorer and adaptive baseline
//! - `event`: event state machine
//! - `poll`: poll loop controller
//! - `queue`: task queue contract and in-process dispatcher
//! - `watchdog`: stale-loop recovery
//! - `api`: loopback control surface (manual trigger, status)

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod detect;
pub mod event;
pub mod ingest;
pub mod model;
pub mod poll;
pub mod queue;
pub mod storage;
pub mod watchdog;

pub use cache::{CacheField, CacheValue, CameraState, MemoryCache, VolatileCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ModetectConfig;
pub use detect::{Baseline, DetectionSettings, ImageNormalizer, MotionGrid, Normalizer};
pub use event::{CycleOutcome, EventMachine, Transition};
pub use ingest::{CaptureError, CapturedFrame, FrameSource, HttpFrameSource};
pub use model::{CameraEvent, CameraFrame, CameraSource, EventPeriod, NewCameraSource};
pub use poll::{PollController, PollLeases, PollOutcome, PollSettings, PollStats, PollTask};
pub use queue::{ChannelTaskQueue, Dispatcher, DispatcherHandle, RecordingTaskQueue, TaskQueue};
pub use storage::{CameraStore, EventFlag, InMemoryCameraStore, SqliteCameraStore};
pub use watchdog::Watchdog;

/// Durable identifier of a camera source.
pub type CameraId = i64;

/// Durable identifier of a camera event.
pub type EventId = i64;

/// Wall-clock time in milliseconds since the Unix epoch.
pub type EpochMillis = i64;

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:modetect_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}
