//! Poll loop controller.
//!
//! One invocation drives one camera through repeated
//! capture -> score -> rate -> aggregate cycles until its runtime budget is
//! spent, then hands off to a fresh invocation through the task queue. All
//! continuity between invocations lives in the volatile cache.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::cache::{self, CacheField, CacheValue, CameraState, VolatileCache};
use crate::clock::{millis, Clock};
use crate::detect::{Baseline, DetectionSettings, MotionScorer, Normalizer};
use crate::event::{EventMachine, Transition};
use crate::ingest::{CapturedFrame, FrameSource};
use crate::model::CameraSource;
use crate::queue::TaskQueue;
use crate::storage::CameraStore;
use crate::{CameraId, EpochMillis};

/// Tasks older than this when picked up are assumed superseded.
pub const DEFAULT_MAX_TASK_AGE_SECS: u64 = 30;

/// Wall-clock budget of one invocation, kept under common execution ceilings.
pub const DEFAULT_RUNTIME_BUDGET_SECS: u64 = 595;

/// A request to poll one camera, stamped with when it was enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollTask {
    pub camera_id: CameraId,
    pub epoch: EpochMillis,
}

impl PollTask {
    pub fn new(camera_id: CameraId, epoch: EpochMillis) -> Self {
        Self { camera_id, epoch }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollStats {
    pub captures: u32,
    pub failures: u32,
    pub events_opened: u32,
    pub events_closed: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Task was older than the max task age. Nothing polled, nothing enqueued.
    Stale,
    /// Another invocation already holds this camera.
    Busy,
    /// Camera is disabled, deleted or unknown. No continuation.
    Stopped(PollStats),
    /// Budget or platform deadline reached; continuation enqueued.
    Requeued(PollStats),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PollSettings {
    pub max_task_age: Duration,
    pub runtime_budget: Duration,
    pub store_idle_frames: bool,
    pub detection: DetectionSettings,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_task_age: Duration::from_secs(DEFAULT_MAX_TASK_AGE_SECS),
            runtime_budget: Duration::from_secs(DEFAULT_RUNTIME_BUDGET_SECS),
            store_idle_frames: true,
            detection: DetectionSettings::default(),
        }
    }
}

/// Process-wide record of which cameras have an active invocation.
#[derive(Clone, Debug, Default)]
pub struct PollLeases {
    active: Arc<Mutex<HashSet<CameraId>>>,
}

impl PollLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, camera_id: CameraId) -> Result<Option<PollLease>> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| anyhow!("poll lease lock poisoned"))?;
        if !active.insert(camera_id) {
            return Ok(None);
        }
        Ok(Some(PollLease {
            leases: self.clone(),
            camera_id,
        }))
    }

    pub fn is_active(&self, camera_id: CameraId) -> bool {
        self.active
            .lock()
            .map(|active| active.contains(&camera_id))
            .unwrap_or(false)
    }
}

/// Held for the lifetime of one invocation; released on drop.
#[derive(Debug)]
pub struct PollLease {
    leases: PollLeases,
    camera_id: CameraId,
}

impl Drop for PollLease {
    fn drop(&mut self) {
        if let Ok(mut active) = self.leases.active.lock() {
            active.remove(&self.camera_id);
        }
    }
}

pub struct PollController {
    store: Arc<dyn CameraStore>,
    cache: Arc<dyn VolatileCache>,
    frames: Arc<dyn FrameSource>,
    scorer: MotionScorer,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    settings: PollSettings,
    leases: PollLeases,
    deadline: Arc<AtomicBool>,
}

enum Stop {
    Budget,
    Deadline,
}

impl PollController {
    pub fn new(
        store: Arc<dyn CameraStore>,
        cache: Arc<dyn VolatileCache>,
        frames: Arc<dyn FrameSource>,
        normalizer: Arc<dyn Normalizer>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        settings: PollSettings,
    ) -> Self {
        Self {
            store,
            cache,
            frames,
            scorer: MotionScorer::new(normalizer, &settings.detection),
            queue,
            clock,
            settings,
            leases: PollLeases::new(),
            deadline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag the hosting platform raises when it is about to stop this process.
    pub fn deadline_flag(&self) -> Arc<AtomicBool> {
        self.deadline.clone()
    }

    pub fn leases(&self) -> &PollLeases {
        &self.leases
    }

    /// Entry point for one delivered task.
    ///
    /// Store write failures propagate as errors; the invocation then ends
    /// without a continuation and the watchdog is responsible for recovery.
    pub fn run(&self, task: PollTask) -> Result<PollOutcome> {
        let started = self.clock.now_ms();
        let age = started - task.epoch;
        if age > millis(self.settings.max_task_age) {
            log::info!(
                "camera {} task is {} ms old; superseded, dropping",
                task.camera_id,
                age
            );
            return Ok(PollOutcome::Stale);
        }

        let Some(lease) = self.leases.try_acquire(task.camera_id)? else {
            log::info!(
                "camera {} already has an active poller; dropping task",
                task.camera_id
            );
            return Ok(PollOutcome::Busy);
        };

        let mut stats = PollStats::default();
        let stop = loop {
            if let Some(stop) = self.should_stop(started) {
                break stop;
            }

            let source = match self.store.get_source(task.camera_id)? {
                Some(source) if source.is_pollable() => source,
                _ => {
                    log::info!(
                        "camera {} disabled or deleted; stopping without handoff",
                        task.camera_id
                    );
                    return Ok(PollOutcome::Stopped(stats));
                }
            };

            let state = CameraState::load(self.cache.as_ref(), source.id)?;
            self.pace(&source, &state, started);
            if let Some(stop) = self.should_stop(started) {
                break stop;
            }

            self.cycle(&source, state, &mut stats)?;
        };

        match stop {
            Stop::Budget => log::info!(
                "camera {} budget spent after {} captures ({} failed); handing off",
                task.camera_id,
                stats.captures,
                stats.failures
            ),
            Stop::Deadline => log::info!(
                "camera {} stopping at platform deadline; handing off",
                task.camera_id
            ),
        }

        drop(lease);
        self.queue
            .enqueue(PollTask::new(task.camera_id, self.clock.now_ms()))?;
        Ok(PollOutcome::Requeued(stats))
    }

    fn should_stop(&self, started: EpochMillis) -> Option<Stop> {
        if self.deadline.load(Ordering::SeqCst) {
            return Some(Stop::Deadline);
        }
        if self.clock.now_ms() - started > millis(self.settings.runtime_budget) {
            return Some(Stop::Budget);
        }
        None
    }

    /// Sleep out the rest of the frame interval for the current cadence,
    /// never past the end of the budget.
    fn pace(&self, source: &CameraSource, state: &CameraState, started: EpochMillis) {
        let Some(last_poll) = state.last_poll else {
            return;
        };
        let interval = frame_interval_ms(source.target_fps(state.has_open_event()));
        let now = self.clock.now_ms();
        let wait = interval - (now - last_poll);
        if wait <= 0 {
            return;
        }
        let remaining = millis(self.settings.runtime_budget) - (now - started);
        let sleep_ms = wait.min(remaining.max(0) + 1);
        self.clock.sleep(Duration::from_millis(sleep_ms as u64));
    }

    /// One capture and, if it succeeds, one full aggregation step.
    fn cycle(
        &self,
        source: &CameraSource,
        mut state: CameraState,
        stats: &mut PollStats,
    ) -> Result<()> {
        let attempted_at = self.clock.now_ms();
        let frame = match self.frames.capture(source) {
            Ok(frame) => frame,
            Err(err) => {
                stats.failures += 1;
                log::warn!("camera {} capture skipped: {}", source.id, err);
                return self.mark_polled(source.id, attempted_at);
            }
        };

        let CapturedFrame {
            bytes, captured_at, ..
        } = frame;
        let (grid, raw_diff) = match self.scorer.score(state.last_grid.as_deref(), &bytes) {
            Ok(scored) => scored,
            Err(err) => {
                stats.failures += 1;
                log::warn!("camera {} frame not decodable: {:#}", source.id, err);
                return self.mark_polled(source.id, attempted_at);
            }
        };

        let mut baseline = Baseline::new(self.settings.detection.ewma_alpha, state.ewma);
        let rating = baseline.observe(raw_diff);
        log::debug!(
            "camera {} raw_diff={:.3} ewma={:.3} rating={}",
            source.id,
            raw_diff,
            baseline.ewma().unwrap_or_default(),
            rating
        );

        // Read after the fetch so a trigger sent while it was in flight applies
        // to this frame.
        let trigger = cache::pending_trigger(self.cache.as_ref(), source.id)?;
        let machine = EventMachine::new(
            self.store.as_ref(),
            self.settings.detection,
            self.settings.store_idle_frames,
        );
        let outcome = machine.apply(
            source,
            state.open_event,
            trigger.is_some(),
            captured_at,
            bytes.clone(),
            rating,
        )?;
        match outcome.transition {
            Transition::Opened(_) => stats.events_opened += 1,
            Transition::Closed(_) => stats.events_closed += 1,
            Transition::Idle | Transition::Extended(_) => {}
        }
        stats.captures += 1;

        state.last_image = Some(Arc::new(bytes));
        state.last_grid = Some(Arc::new(grid));
        state.ewma = baseline.ewma();
        state.open_event = outcome.open_event;
        state.last_capture = Some(captured_at);
        state.last_poll = Some(attempted_at);
        state.save(self.cache.as_ref(), source.id)?;
        if let Some(requested_at) = trigger {
            cache::clear_trigger(self.cache.as_ref(), source.id, requested_at)?;
        }
        Ok(())
    }

    fn mark_polled(&self, camera_id: CameraId, at: EpochMillis) -> Result<()> {
        self.cache
            .set(camera_id, CacheField::LastPoll, CacheValue::Time(at))
    }
}

fn frame_interval_ms(fps: u32) -> i64 {
    if fps == 0 {
        0
    } else {
        (1000.0 / f64::from(fps)).round() as i64
    }
}
