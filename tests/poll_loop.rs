use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use image::{ImageFormat, Rgb, RgbImage};

use modetect::cache::{self, CacheField};
use modetect::{
    CameraSource, CameraStore, CaptureError, CapturedFrame, Clock, DetectionSettings,
    FrameSource, ImageNormalizer, InMemoryCameraStore, ManualClock, MemoryCache,
    NewCameraSource, PollController, PollOutcome, PollSettings, PollTask, RecordingTaskQueue,
    SqliteCameraStore, VolatileCache, Watchdog,
};

const START: i64 = 1_700_000_000_000;

fn solid_png(value: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(64, 48, Rgb([value, value, value]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).expect("encode png");
    out.into_inner()
}

type CaptureHook = Box<dyn Fn(usize) + Send + Sync>;

/// Plays back scripted capture results, then repeats `fallback` forever.
struct ScriptedSource {
    clock: ManualClock,
    script: Mutex<VecDeque<Result<Vec<u8>, CaptureError>>>,
    fallback: Vec<u8>,
    attempts: Mutex<Vec<i64>>,
    hook: Option<CaptureHook>,
}

impl ScriptedSource {
    fn new(clock: ManualClock, script: Vec<Result<Vec<u8>, CaptureError>>) -> Self {
        Self {
            clock,
            script: Mutex::new(script.into()),
            fallback: solid_png(120),
            attempts: Mutex::new(Vec::new()),
            hook: None,
        }
    }

    fn with_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    fn attempts(&self) -> Vec<i64> {
        self.attempts.lock().unwrap().clone()
    }
}

impl FrameSource for ScriptedSource {
    fn capture(&self, _source: &CameraSource) -> Result<CapturedFrame, CaptureError> {
        let now = self.clock.now_ms();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(now);
            attempts.len()
        };
        if let Some(hook) = &self.hook {
            hook(attempt);
        }
        let next = self.script.lock().unwrap().pop_front();
        let bytes = match next {
            Some(result) => result?,
            None => self.fallback.clone(),
        };
        Ok(CapturedFrame {
            bytes,
            content_type: "image/png".to_string(),
            captured_at: now,
        })
    }
}

struct Harness {
    store: Arc<dyn CameraStore>,
    cache: Arc<MemoryCache>,
    queue: Arc<RecordingTaskQueue>,
    clock: ManualClock,
    frames: Arc<ScriptedSource>,
    controller: PollController,
    camera: i64,
}

fn settings(budget_secs: u64) -> PollSettings {
    PollSettings {
        max_task_age: Duration::from_secs(30),
        runtime_budget: Duration::from_secs(budget_secs),
        store_idle_frames: true,
        detection: DetectionSettings::default(),
    }
}

fn harness_with(
    store: Arc<dyn CameraStore>,
    frames: impl FnOnce(ManualClock) -> ScriptedSource,
    budget_secs: u64,
) -> Result<Harness> {
    let clock = ManualClock::new(START);
    let camera = store.insert_source(&NewCameraSource::new("yard", "http://10.0.0.9/snap.jpg"), 0)?;
    let cache = Arc::new(MemoryCache::new());
    let queue = Arc::new(RecordingTaskQueue::new());
    let frames = Arc::new(frames(clock.clone()));
    let controller = PollController::new(
        store.clone(),
        cache.clone(),
        frames.clone(),
        Arc::new(ImageNormalizer),
        queue.clone(),
        Arc::new(clock.clone()),
        settings(budget_secs),
    );
    Ok(Harness {
        store,
        cache,
        queue,
        clock,
        frames,
        controller,
        camera,
    })
}

fn harness(script: Vec<Result<Vec<u8>, CaptureError>>, budget_secs: u64) -> Result<Harness> {
    harness_with(
        Arc::new(InMemoryCameraStore::new()),
        |clock| ScriptedSource::new(clock, script),
        budget_secs,
    )
}

#[test]
fn stale_task_aborts_without_polling_or_requeue() -> Result<()> {
    let h = harness(Vec::new(), 10)?;
    let outcome = h
        .controller
        .run(PollTask::new(h.camera, START - 40_000))?;
    assert_eq!(outcome, PollOutcome::Stale);
    assert!(h.frames.attempts().is_empty());
    assert!(h.queue.tasks().is_empty());
    assert_eq!(h.clock.now_ms(), START);
    Ok(())
}

#[test]
fn budget_exhaustion_hands_off_continuation() -> Result<()> {
    let h = harness(Vec::new(), 10)?;
    let outcome = h.controller.run(PollTask::new(h.camera, START - 5_000))?;

    // Idle cadence is 1 fps: captures at 0 s through 10 s, then the
    // shortened final sleep crosses the budget.
    let attempts = h.frames.attempts();
    assert_eq!(attempts.len(), 11);
    assert!(attempts.windows(2).all(|w| w[1] - w[0] == 1_000));
    let PollOutcome::Requeued(stats) = outcome else {
        panic!("expected requeue, got {:?}", outcome);
    };
    assert_eq!(stats.captures, 11);
    assert_eq!(stats.failures, 0);

    let tasks = h.queue.tasks();
    assert_eq!(tasks, vec![PollTask::new(h.camera, h.clock.now_ms())]);
    assert!(h.clock.now_ms() - START > 10_000);
    assert!(!h.controller.leases().is_active(h.camera));

    assert_eq!(
        cache::load_time(h.cache.as_ref(), h.camera, CacheField::LastCapture)?,
        attempts.last().copied()
    );
    assert_eq!(h.store.count_frames(h.camera, 0)?, 11);
    Ok(())
}

#[test]
fn continuation_resumes_from_cached_state() -> Result<()> {
    let h = harness(Vec::new(), 3)?;
    h.controller.run(PollTask::new(h.camera, START))?;
    let handoff = h.queue.tasks()[0];
    let ewma_before = h.cache.get(h.camera, CacheField::Ewma)?;
    assert!(ewma_before.is_some());

    let outcome = h.controller.run(handoff)?;
    assert!(matches!(outcome, PollOutcome::Requeued(_)));
    assert_eq!(h.queue.tasks().len(), 2);
    // Pacing picked up the cached last poll instead of capturing immediately.
    let attempts = h.frames.attempts();
    assert!(attempts.windows(2).all(|w| w[1] - w[0] >= 1_000));
    Ok(())
}

#[test]
fn disabled_camera_stops_without_requeue() -> Result<()> {
    let h = harness(Vec::new(), 10)?;
    h.store.set_source_enabled(h.camera, false, 1)?;
    let outcome = h.controller.run(PollTask::new(h.camera, START))?;
    assert!(matches!(outcome, PollOutcome::Stopped(_)));
    assert!(h.frames.attempts().is_empty());
    assert!(h.queue.tasks().is_empty());
    Ok(())
}

#[test]
fn camera_disabled_mid_run_stops_at_next_iteration() -> Result<()> {
    let store: Arc<dyn CameraStore> = Arc::new(InMemoryCameraStore::new());
    let hook_store = store.clone();
    let h = harness_with(
        store,
        move |clock| {
            ScriptedSource::new(clock, Vec::new()).with_hook(move |attempt| {
                if attempt == 3 {
                    let _ = hook_store.set_source_enabled(1, false, 0);
                }
            })
        },
        60,
    )?;
    assert_eq!(h.camera, 1);
    let outcome = h.controller.run(PollTask::new(h.camera, START))?;
    let PollOutcome::Stopped(stats) = outcome else {
        panic!("expected stop, got {:?}", outcome);
    };
    assert_eq!(stats.captures, 3);
    assert!(h.queue.tasks().is_empty());
    Ok(())
}

#[test]
fn capture_failures_skip_cycle_and_keep_polling() -> Result<()> {
    let script = vec![
        Err(CaptureError::Fetch("timed out".to_string())),
        Ok(solid_png(120)),
        Err(CaptureError::InvalidResponse("http status 503".to_string())),
        Ok(b"not an image".to_vec()),
    ];
    let h = harness(script, 5)?;
    let outcome = h.controller.run(PollTask::new(h.camera, START))?;
    let PollOutcome::Requeued(stats) = outcome else {
        panic!("expected requeue, got {:?}", outcome);
    };
    assert_eq!(h.frames.attempts().len(), 6);
    assert_eq!(stats.failures, 3);
    assert_eq!(stats.captures, 3);
    assert_eq!(h.store.count_frames(h.camera, 0)?, 3);
    assert_eq!(h.queue.tasks().len(), 1);
    Ok(())
}

#[test]
fn alarmed_cadence_while_event_open_then_idle_cadence() -> Result<()> {
    let h = harness(Vec::new(), 5)?;
    cache::request_trigger(h.cache.as_ref(), h.camera, START)?;

    let outcome = h.controller.run(PollTask::new(h.camera, START))?;
    let PollOutcome::Requeued(stats) = outcome else {
        panic!("expected requeue, got {:?}", outcome);
    };
    assert_eq!(stats.events_opened, 1);
    assert_eq!(stats.events_closed, 1);

    let gaps: Vec<i64> = h
        .frames
        .attempts()
        .windows(2)
        .map(|w| w[1] - w[0])
        .collect();
    // Open at 0 ms; 10 fps until 2.1 s of quiet closes the event; then 1 fps.
    assert_eq!(gaps.len(), 23);
    assert!(gaps[..21].iter().all(|gap| *gap == 100));
    assert!(gaps[21..].iter().all(|gap| *gap == 1_000));

    let events = h.store.events_for_camera(h.camera, None)?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].total_frames, 22);
    assert_eq!(events[0].alarm_frames, 1);
    assert_eq!(cache::load_open_event(h.cache.as_ref(), h.camera)?, None);
    assert_eq!(cache::pending_trigger(h.cache.as_ref(), h.camera)?, None);
    Ok(())
}

/// Harness whose frame source requests a manual trigger while capture
/// number `on_attempt` is in flight.
fn harness_triggering_on(on_attempt: usize, budget_secs: u64) -> Result<Harness> {
    let cache_slot: Arc<Mutex<Option<Arc<MemoryCache>>>> = Arc::new(Mutex::new(None));
    let hook_cache = cache_slot.clone();
    let h = harness_with(
        Arc::new(InMemoryCameraStore::new()),
        move |clock| {
            let hook_clock = clock.clone();
            ScriptedSource::new(clock, Vec::new()).with_hook(move |attempt| {
                if attempt == on_attempt {
                    if let Some(cache) = hook_cache.lock().unwrap().as_ref() {
                        let _ = cache::request_trigger(cache.as_ref(), 1, hook_clock.now_ms());
                    }
                }
            })
        },
        budget_secs,
    )?;
    assert_eq!(h.camera, 1);
    *cache_slot.lock().unwrap() = Some(h.cache.clone());
    Ok(h)
}

#[test]
fn trigger_arriving_during_fetch_is_not_lost() -> Result<()> {
    let h = harness_triggering_on(2, 1)?;

    h.controller.run(PollTask::new(h.camera, START))?;
    let events = h.store.events_for_camera(h.camera, None)?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_start, START + 1_000);
    assert_eq!(
        cache::load_open_event(h.cache.as_ref(), h.camera)?,
        Some(events[0].id)
    );
    assert_eq!(cache::pending_trigger(h.cache.as_ref(), h.camera)?, None);
    Ok(())
}

#[test]
fn trigger_during_open_event_extends_it() -> Result<()> {
    let h = harness_triggering_on(20, 5)?;
    cache::request_trigger(h.cache.as_ref(), h.camera, START)?;

    let outcome = h.controller.run(PollTask::new(h.camera, START))?;
    let PollOutcome::Requeued(stats) = outcome else {
        panic!("expected requeue, got {:?}", outcome);
    };
    assert_eq!(stats.events_opened, 1);
    assert_eq!(stats.events_closed, 1);

    // Capture 20 lands at 1.9 s and counts as motion, so the 2 s close delay
    // runs from there: the event closes on the 4.0 s frame.
    let events = h.store.events_for_camera(h.camera, None)?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].alarm_frames, 2);
    assert_eq!(events[0].last_motion_time, START + 1_900);
    assert_eq!(events[0].event_end, START + 4_000);
    assert_eq!(events[0].total_frames, 41);
    assert_eq!(cache::pending_trigger(h.cache.as_ref(), h.camera)?, None);
    Ok(())
}

#[test]
fn second_concurrent_invocation_is_busy() -> Result<()> {
    let h = harness(Vec::new(), 10)?;
    let lease = h.controller.leases().try_acquire(h.camera)?.expect("lease");
    let outcome = h.controller.run(PollTask::new(h.camera, START))?;
    assert_eq!(outcome, PollOutcome::Busy);
    assert!(h.frames.attempts().is_empty());
    assert!(h.queue.tasks().is_empty());
    drop(lease);
    assert!(matches!(
        h.controller.run(PollTask::new(h.camera, START))?,
        PollOutcome::Requeued(_)
    ));
    Ok(())
}

#[test]
fn store_failure_ends_invocation_and_watchdog_recovers() -> Result<()> {
    let uri = modetect::shared_memory_uri();
    let store: Arc<dyn CameraStore> = Arc::new(SqliteCameraStore::open(&uri)?);
    let h = harness_with(
        store,
        |clock| ScriptedSource::new(clock, Vec::new()),
        30,
    )?;

    // Succeed once so the camera has a last capture on record.
    let first = run_fresh(&h, 0)?;
    assert!(matches!(first, PollOutcome::Requeued(_)));
    let handoffs = h.queue.tasks().len();

    let saboteur = rusqlite::Connection::open_with_flags(
        &uri,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_URI,
    )?;
    saboteur.execute_batch("DROP TABLE camera_frames;")?;

    let task = PollTask::new(h.camera, h.clock.now_ms());
    assert!(h.controller.run(task).is_err());
    assert_eq!(h.queue.tasks().len(), handoffs);
    assert!(!h.controller.leases().is_active(h.camera));

    let watchdog = Watchdog::new(
        h.store.clone(),
        h.cache.clone(),
        h.queue.clone(),
        Arc::new(h.clock.clone()),
        Duration::from_secs(300),
        10,
    );
    assert!(watchdog.sweep()?.is_empty());
    h.clock.advance(Duration::from_secs(301));
    assert_eq!(watchdog.sweep()?, vec![h.camera]);
    assert_eq!(h.queue.tasks().len(), handoffs + 1);
    Ok(())
}

fn run_fresh(h: &Harness, age_ms: i64) -> Result<PollOutcome> {
    h.controller
        .run(PollTask::new(h.camera, h.clock.now_ms() - age_ms))
}
