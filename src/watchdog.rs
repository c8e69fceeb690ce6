//! Stale-loop recovery.
//!
//! A poll loop that dies without handing off (crash, store failure, lost
//! queue message) leaves its camera unpolled. The watchdog notices because
//! the camera's last capture stops advancing, and enqueues a fresh task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;

use crate::cache::{self, CacheField, VolatileCache};
use crate::clock::{millis, Clock};
use crate::poll::PollTask;
use crate::queue::TaskQueue;
use crate::storage::CameraStore;
use crate::CameraId;

pub const DEFAULT_STALE_AFTER_SECS: u64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_CAMERAS: usize = 10;

pub struct Watchdog {
    store: Arc<dyn CameraStore>,
    cache: Arc<dyn VolatileCache>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    max_cameras: usize,
}

impl Watchdog {
    pub fn new(
        store: Arc<dyn CameraStore>,
        cache: Arc<dyn VolatileCache>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
        max_cameras: usize,
    ) -> Self {
        Self {
            store,
            cache,
            queue,
            clock,
            stale_after,
            max_cameras,
        }
    }

    /// Enqueue a task for every enabled camera whose last capture is missing
    /// or older than the staleness window. Returns the cameras re-armed.
    ///
    /// Only the oldest `max_cameras` enabled cameras are watched; any beyond
    /// that are reported at `warn` on every sweep.
    ///
    /// A healthy loop that receives a duplicate task drops it through the
    /// lease or the task-age guard, so over-triggering is harmless.
    pub fn sweep(&self) -> Result<Vec<CameraId>> {
        let now = self.clock.now_ms();
        let stale_ms = millis(self.stale_after);
        let mut sources = self.store.list_sources(false, usize::MAX)?;
        if sources.len() > self.max_cameras {
            let unwatched: Vec<CameraId> = sources[self.max_cameras..]
                .iter()
                .map(|source| source.id)
                .collect();
            log::warn!(
                "{} enabled cameras exceed the limit of {}; not watching {:?}",
                sources.len(),
                self.max_cameras,
                unwatched
            );
            sources.truncate(self.max_cameras);
        }

        let mut rearmed = Vec::new();
        for source in sources {
            let last_capture =
                cache::load_time(self.cache.as_ref(), source.id, CacheField::LastCapture)?;
            let stale = match last_capture {
                None => true,
                Some(at) => now - at > stale_ms,
            };
            if !stale {
                continue;
            }
            match last_capture {
                Some(at) => log::warn!(
                    "camera {} last captured {} s ago; restarting poll loop",
                    source.id,
                    (now - at) / 1000
                ),
                None => log::info!("camera {} has no capture on record; starting poll loop", source.id),
            }
            self.queue.enqueue(PollTask::new(source.id, now))?;
            rearmed.push(source.id);
        }
        Ok(rearmed)
    }

    /// Sweep immediately, then every `interval` until `shutdown` is raised.
    pub fn spawn(self, interval: Duration, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    match self.sweep() {
                        Ok(rearmed) if !rearmed.is_empty() => {
                            log::info!("watchdog re-armed cameras {:?}", rearmed)
                        }
                        Ok(_) => {}
                        Err(err) => log::error!("watchdog sweep failed: {:#}", err),
                    }
                    sleep_unless_shutdown(interval, &shutdown);
                }
            })?;
        Ok(handle)
    }
}

fn sleep_unless_shutdown(interval: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < interval && !shutdown.load(Ordering::SeqCst) {
        let nap = step.min(interval - slept);
        std::thread::sleep(nap);
        slept += nap;
    }
}
