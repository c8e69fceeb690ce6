use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;
use image::{ImageFormat, Rgb, RgbImage};

use modetect::detect::{MotionScorer, MISSING_PREVIOUS_SENTINEL};
use modetect::{
    Baseline, CameraSource, CameraStore, DetectionSettings, EventId, EventMachine,
    ImageNormalizer, NewCameraSource, SqliteCameraStore, Transition,
};

fn solid_png(width: u32, height: u32, value: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([value, value, value]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).expect("encode png");
    out.into_inner()
}

fn sqlite_camera(close_delay: f64) -> Result<(SqliteCameraStore, CameraSource)> {
    let store = SqliteCameraStore::open(&modetect::shared_memory_uri())?;
    let mut new = NewCameraSource::new("driveway", "http://10.0.0.7/snapshot.jpg");
    new.event_close_delay = close_delay;
    let id = store.insert_source(&new, 0)?;
    let source = store.get_source(id)?.expect("camera");
    Ok((store, source))
}

/// Runs frames through scorer, baseline and event machine the way one poll
/// cycle does, carrying grid, ewma and open event between frames.
struct Pipeline<'a> {
    store: &'a SqliteCameraStore,
    source: CameraSource,
    scorer: MotionScorer,
    settings: DetectionSettings,
    grid: Option<modetect::MotionGrid>,
    ewma: Option<f64>,
    open_event: Option<EventId>,
}

impl<'a> Pipeline<'a> {
    fn new(store: &'a SqliteCameraStore, source: CameraSource) -> Self {
        let settings = DetectionSettings::default();
        Self {
            store,
            source,
            scorer: MotionScorer::new(Arc::new(ImageNormalizer), &settings),
            settings,
            grid: None,
            ewma: None,
            open_event: None,
        }
    }

    fn feed(&mut self, at: i64, image: Vec<u8>) -> Result<(f64, u8, Transition)> {
        let (grid, raw) = self.scorer.score(self.grid.as_ref(), &image)?;
        let mut baseline = Baseline::new(self.settings.ewma_alpha, self.ewma);
        let rating = baseline.observe(raw);
        let machine = EventMachine::new(self.store, self.settings, true);
        let outcome = machine.apply(&self.source, self.open_event, false, at, image, rating)?;
        self.grid = Some(grid);
        self.ewma = baseline.ewma();
        self.open_event = outcome.open_event;
        Ok((raw, rating, outcome.transition))
    }
}

#[test]
fn first_frame_takes_sentinel_path_and_opens_nothing() -> Result<()> {
    let (store, source) = sqlite_camera(2.0)?;
    let camera = source.id;
    let mut pipeline = Pipeline::new(&store, source);

    let (raw, rating, transition) = pipeline.feed(1_000, solid_png(320, 240, 90))?;
    assert_eq!(raw, MISSING_PREVIOUS_SENTINEL);
    assert_eq!(rating, 0);
    assert_eq!(transition, Transition::Idle);
    assert_eq!(pipeline.ewma, Some(MISSING_PREVIOUS_SENTINEL));
    assert!(store.events_for_camera(camera, None)?.is_empty());
    assert_eq!(store.count_frames(camera, 0)?, 1);
    Ok(())
}

#[test]
fn constant_scene_rates_zero_after_seeding() -> Result<()> {
    let (store, source) = sqlite_camera(2.0)?;
    let mut pipeline = Pipeline::new(&store, source);
    let frame = solid_png(160, 120, 128);

    pipeline.feed(0, frame.clone())?;
    for step in 1..6 {
        let (raw, rating, transition) = pipeline.feed(step * 1_000, frame.clone())?;
        assert_eq!(raw, 0.0);
        assert_eq!(rating, 0);
        assert_eq!(transition, Transition::Idle);
    }
    Ok(())
}

#[test]
fn scene_change_opens_event_and_quiet_closes_it() -> Result<()> {
    let (store, source) = sqlite_camera(2.0)?;
    let camera = source.id;
    let mut pipeline = Pipeline::new(&store, source);
    let gray = solid_png(200, 150, 100);
    let white = solid_png(200, 150, 255);

    for step in 0..4 {
        let (_, rating, transition) = pipeline.feed(step * 1_000, gray.clone())?;
        assert_eq!(rating, 0);
        assert_eq!(transition, Transition::Idle);
    }

    let (raw, rating, transition) = pipeline.feed(4_000, white.clone())?;
    assert!(raw > 500_000.0, "raw diff {}", raw);
    assert_eq!(rating, 100);
    let Transition::Opened(event_id) = transition else {
        panic!("expected open, got {:?}", transition);
    };

    // Same scene again: no change, quiet but inside the close delay.
    let (_, rating, transition) = pipeline.feed(5_000, white.clone())?;
    assert_eq!(rating, 0);
    assert_eq!(transition, Transition::Extended(event_id));

    let (_, _, transition) = pipeline.feed(6_500, white)?;
    assert_eq!(transition, Transition::Closed(event_id));
    assert_eq!(pipeline.open_event, None);

    let event = store.get_event(event_id)?.expect("event");
    assert_eq!(event.event_start, 4_000);
    assert_eq!(event.event_end, 6_500);
    assert_eq!(event.last_motion_time, 4_000);
    assert_eq!(event.total_frames, 3);
    assert_eq!(event.alarm_frames, 1);
    assert_eq!(event.max_motion_rating, 100);
    assert_eq!(store.frames_for_event(event_id)?.len(), 3);
    assert_eq!(store.count_frames(camera, 0)?, 7);
    Ok(())
}

#[test]
fn replay_keeps_one_open_event_and_consistent_totals() -> Result<()> {
    let (store, source) = sqlite_camera(1.0)?;
    let machine = EventMachine::new(&store, DetectionSettings::default(), true);

    // (time ms, rating). Two bursts separated by a quiet gap longer than the
    // close delay, then a burst that is still open at the end.
    let script: &[(i64, u8)] = &[
        (0, 5),
        (500, 80),
        (700, 20),
        (900, 51),
        (1_200, 50),
        (1_800, 10),
        (2_100, 0),
        (3_000, 12),
        (3_200, 99),
        (3_300, 100),
        (3_600, 60),
        (4_000, 3),
    ];

    let mut open_event = None;
    let mut opened = Vec::new();
    for &(at, rating) in script {
        let was_open = open_event.is_some();
        let outcome = machine.apply(&source, open_event, false, at, vec![rating], rating)?;
        if let Transition::Opened(id) = outcome.transition {
            assert!(!was_open, "opened {} while another event was open", id);
            opened.push(id);
        }
        open_event = outcome.open_event;

        for event in store.events_for_camera(source.id, None)? {
            assert_eq!(
                event.avg_motion_rating,
                event.total_motion_rating as f64 / f64::from(event.total_frames)
            );
            let frames = store.frames_for_event(event.id)?;
            assert_eq!(frames.len() as u32, event.total_frames);
            assert!(frames.windows(2).all(|w| w[0].image_time <= w[1].image_time));
        }
    }

    assert_eq!(opened.len(), 2);
    assert_eq!(open_event, Some(opened[1]));

    let first = store.get_event(opened[0])?.expect("first event");
    assert_eq!(first.event_start, 500);
    assert_eq!(first.last_motion_time, 900);
    // 50 is not motion, so the burst went quiet at 900 and closed at 2_100.
    assert_eq!(first.event_end, 2_100);
    assert_eq!(first.total_frames, 6);
    assert_eq!(first.alarm_frames, 2);
    assert_eq!(first.total_motion_rating, 80 + 20 + 51 + 50 + 10);

    let second = store.get_event(opened[1])?.expect("second event");
    assert_eq!(second.event_start, 3_200);
    assert_eq!(second.alarm_frames, 3);
    assert_eq!(second.max_motion_rating, 100);

    // Idle frames stay unlinked: 0 and 3_000.
    assert_eq!(store.count_frames(source.id, 0)?, script.len() as u64);
    Ok(())
}

#[test]
fn trigger_opens_event_on_quiet_frame() -> Result<()> {
    let (store, source) = sqlite_camera(2.0)?;
    let machine = EventMachine::new(&store, DetectionSettings::default(), true);
    let outcome = machine.apply(&source, None, true, 10_000, vec![0], 0)?;
    let Transition::Opened(id) = outcome.transition else {
        panic!("expected open, got {:?}", outcome.transition);
    };
    let event = store.get_event(id)?.expect("event");
    assert_eq!(event.alarm_frames, 1);
    assert_eq!(event.max_motion_rating, 0);
    assert_eq!(outcome.open_event, Some(id));
    Ok(())
}
