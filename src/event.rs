//! Event state machine.
//!
//! A camera is either Idle (no open event) or Active (exactly one open event,
//! whose id the cache holds). Each captured frame moves it:
//!
//! | state  | motion | effect                                          | next          |
//! |--------|--------|-------------------------------------------------|---------------|
//! | Idle   | no     | record unlinked frame                           | Idle          |
//! | Idle   | yes    | create event + first frame                      | Active        |
//! | Active | yes    | append frame, extend totals, bump last motion   | Active        |
//! | Active | no     | append frame, extend totals, maybe close        | Idle / Active |
//!
//! A pending manual trigger counts as motion in either state. A closed event
//! is never reopened; the next burst of motion starts a new one.

use anyhow::Result;

use crate::detect::DetectionSettings;
use crate::model::{CameraEvent, CameraFrame, CameraSource};
use crate::storage::CameraStore;
use crate::{EpochMillis, EventId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// No event open before or after this frame.
    Idle,
    Opened(EventId),
    Extended(EventId),
    /// The frame was appended, then the event closed.
    Closed(EventId),
}

impl Transition {
    pub fn open_event(self) -> Option<EventId> {
        match self {
            Transition::Opened(id) | Transition::Extended(id) => Some(id),
            Transition::Idle | Transition::Closed(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Open event to persist for the next cycle.
    pub open_event: Option<EventId>,
    pub transition: Transition,
    pub alarmed: bool,
}

pub struct EventMachine<'a> {
    store: &'a dyn CameraStore,
    settings: DetectionSettings,
    store_idle_frames: bool,
}

impl<'a> EventMachine<'a> {
    pub fn new(
        store: &'a dyn CameraStore,
        settings: DetectionSettings,
        store_idle_frames: bool,
    ) -> Self {
        Self {
            store,
            settings,
            store_idle_frames,
        }
    }

    /// Apply one rated frame. Durable writes for the frame happen atomically
    /// before the new open event is returned, so a failed write leaves the
    /// previous one in force.
    pub fn apply(
        &self,
        source: &CameraSource,
        open_event: Option<EventId>,
        triggered: bool,
        captured_at: EpochMillis,
        image: Vec<u8>,
        rating: u8,
    ) -> Result<CycleOutcome> {
        let motion = triggered || self.settings.is_motion(rating);
        if triggered {
            log::info!("camera {} manual trigger consumed", source.id);
        }

        let frame = CameraFrame::new(source.id, captured_at, image, rating, motion);

        if let Some(id) = open_event {
            match self.store.get_event(id)? {
                Some(event) if event.camera_id == source.id && !event.deleted => {
                    return self.extend(source, event, frame, captured_at, rating, motion);
                }
                _ => {
                    log::warn!(
                        "camera {} open event {} is gone; continuing as idle",
                        source.id,
                        id
                    );
                }
            }
        }

        if motion {
            let event = CameraEvent::open(source.id, captured_at, rating);
            let id = self.store.open_event(&event, &frame)?;
            log::info!(
                "camera {} event {} opened (rating {})",
                source.id,
                id,
                rating
            );
            return Ok(CycleOutcome {
                open_event: Some(id),
                transition: Transition::Opened(id),
                alarmed: true,
            });
        }

        if self.store_idle_frames {
            self.store.record_frame(&frame)?;
        }
        Ok(CycleOutcome {
            open_event: None,
            transition: Transition::Idle,
            alarmed: false,
        })
    }

    fn extend(
        &self,
        source: &CameraSource,
        mut event: CameraEvent,
        frame: CameraFrame,
        captured_at: EpochMillis,
        rating: u8,
        motion: bool,
    ) -> Result<CycleOutcome> {
        event.apply_frame(captured_at, rating, motion);
        self.store.extend_event(&event, &frame)?;

        let quiet_for = captured_at - event.last_motion_time;
        if !motion && quiet_for > source.close_delay_ms() {
            log::info!(
                "camera {} event {} closed after {} frames ({} alarmed, max rating {})",
                source.id,
                event.id,
                event.total_frames,
                event.alarm_frames,
                event.max_motion_rating
            );
            return Ok(CycleOutcome {
                open_event: None,
                transition: Transition::Closed(event.id),
                alarmed: false,
            });
        }

        Ok(CycleOutcome {
            open_event: Some(event.id),
            transition: Transition::Extended(event.id),
            alarmed: motion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewCameraSource;
    use crate::storage::InMemoryCameraStore;

    fn setup(close_delay: f64) -> Result<(InMemoryCameraStore, CameraSource)> {
        let store = InMemoryCameraStore::new();
        let mut new = NewCameraSource::new("porch", "http://cam/snap.jpg");
        new.event_close_delay = close_delay;
        let id = store.insert_source(&new, 0)?;
        let source = store.get_source(id)?.expect("source");
        Ok((store, source))
    }

    #[test]
    fn idle_without_motion_records_unlinked_frame() -> Result<()> {
        let (store, source) = setup(2.0)?;
        let machine = EventMachine::new(&store, DetectionSettings::default(), true);
        let outcome = machine.apply(&source, None, false, 1_000, vec![1], 50)?;
        assert_eq!(outcome.transition, Transition::Idle);
        assert_eq!(outcome.open_event, None);
        assert_eq!(store.count_frames(source.id, 0)?, 1);
        assert!(store.events_for_camera(source.id, None)?.is_empty());
        Ok(())
    }

    #[test]
    fn idle_frames_can_be_skipped() -> Result<()> {
        let (store, source) = setup(2.0)?;
        let machine = EventMachine::new(&store, DetectionSettings::default(), false);
        machine.apply(&source, None, false, 1_000, vec![1], 0)?;
        assert_eq!(store.count_frames(source.id, 0)?, 0);
        Ok(())
    }

    #[test]
    fn motion_opens_then_extends() -> Result<()> {
        let (store, source) = setup(2.0)?;
        let machine = EventMachine::new(&store, DetectionSettings::default(), true);

        let opened = machine.apply(&source, None, false, 1_000, vec![1], 90)?;
        let Transition::Opened(id) = opened.transition else {
            panic!("expected open, got {:?}", opened.transition);
        };
        assert_eq!(opened.open_event, Some(id));

        let extended = machine.apply(&source, opened.open_event, false, 1_100, vec![2], 70)?;
        assert_eq!(extended.transition, Transition::Extended(id));

        let event = store.get_event(id)?.expect("event");
        assert_eq!(event.total_frames, 2);
        assert_eq!(event.alarm_frames, 2);
        assert_eq!(event.total_motion_rating, 160);
        assert_eq!(event.max_motion_rating, 90);
        assert_eq!(event.avg_motion_rating, 80.0);
        assert_eq!(event.last_motion_time, 1_100);
        assert_eq!(store.frames_for_event(id)?.len(), 2);
        Ok(())
    }

    #[test]
    fn quiet_frame_past_delay_closes_event() -> Result<()> {
        let (store, source) = setup(2.0)?;
        let machine = EventMachine::new(&store, DetectionSettings::default(), true);
        let opened = machine.apply(&source, None, false, -3_000, vec![1], 90)?;

        let closed = machine.apply(&source, opened.open_event, false, 0, vec![2], 10)?;
        let Transition::Closed(id) = closed.transition else {
            panic!("expected close, got {:?}", closed.transition);
        };
        assert_eq!(closed.open_event, None);
        let event = store.get_event(id)?.expect("event");
        assert_eq!(event.total_frames, 2);
        assert_eq!(event.alarm_frames, 1);
        assert_eq!(event.event_end, 0);
        assert_eq!(event.last_motion_time, -3_000);
        Ok(())
    }

    #[test]
    fn quiet_frame_within_delay_keeps_event_open() -> Result<()> {
        let (store, source) = setup(2.0)?;
        let machine = EventMachine::new(&store, DetectionSettings::default(), true);
        let opened = machine.apply(&source, None, false, 0, vec![1], 90)?;
        let quiet = machine.apply(&source, opened.open_event, false, 2_000, vec![2], 10)?;
        assert!(matches!(quiet.transition, Transition::Extended(_)));
        assert!(!quiet.alarmed);
        Ok(())
    }

    #[test]
    fn trigger_forces_new_event() -> Result<()> {
        let (store, source) = setup(2.0)?;
        let machine = EventMachine::new(&store, DetectionSettings::default(), true);
        let outcome = machine.apply(&source, None, true, 500, vec![1], 0)?;
        let Transition::Opened(id) = outcome.transition else {
            panic!("expected open, got {:?}", outcome.transition);
        };
        assert!(outcome.alarmed);
        assert_eq!(outcome.open_event, Some(id));
        Ok(())
    }

    #[test]
    fn trigger_on_open_event_counts_as_motion() -> Result<()> {
        let (store, source) = setup(2.0)?;
        let machine = EventMachine::new(&store, DetectionSettings::default(), true);
        let opened = machine.apply(&source, None, false, 0, vec![1], 90)?;
        let id = opened.open_event.expect("open event");

        let triggered = machine.apply(&source, Some(id), true, 1_900, vec![2], 0)?;
        assert_eq!(triggered.transition, Transition::Extended(id));
        assert!(triggered.alarmed);

        let event = store.get_event(id)?.expect("event");
        assert_eq!(event.last_motion_time, 1_900);
        assert_eq!(event.alarm_frames, 2);
        assert_eq!(event.max_motion_rating, 90);

        // Quiet is now measured from the trigger, not the original motion.
        let quiet = machine.apply(&source, Some(id), false, 3_900, vec![3], 0)?;
        assert_eq!(quiet.transition, Transition::Extended(id));
        let closed = machine.apply(&source, Some(id), false, 4_000, vec![4], 0)?;
        assert_eq!(closed.transition, Transition::Closed(id));
        Ok(())
    }

    #[test]
    fn lost_event_falls_back_to_idle() -> Result<()> {
        let (store, source) = setup(2.0)?;
        let machine = EventMachine::new(&store, DetectionSettings::default(), true);
        let outcome = machine.apply(&source, Some(404), false, 500, vec![1], 0)?;
        assert_eq!(outcome.transition, Transition::Idle);
        assert_eq!(outcome.open_event, None);
        Ok(())
    }

    #[test]
    fn closed_event_is_never_reopened() -> Result<()> {
        let (store, source) = setup(0.0)?;
        let machine = EventMachine::new(&store, DetectionSettings::default(), true);
        let first = machine.apply(&source, None, false, 0, vec![], 90)?;
        let closed = machine.apply(&source, first.open_event, false, 10, vec![], 0)?;
        assert!(matches!(closed.transition, Transition::Closed(_)));
        let second = machine.apply(&source, closed.open_event, false, 20, vec![], 90)?;
        assert_ne!(second.transition.open_event(), first.transition.open_event());
        assert_eq!(store.events_for_camera(source.id, None)?.len(), 2);
        Ok(())
    }
}
