//! Durable records: camera sources, events and frames.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{CameraId, EpochMillis, EventId};

pub const DEFAULT_POLL_MAX_FPS: u32 = 1;
pub const DEFAULT_ALERT_MAX_FPS: u32 = 10;
pub const DEFAULT_EVENT_CLOSE_DELAY_SECS: f64 = 2.0;

/// Operator-owned camera configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CameraSource {
    pub id: CameraId,
    pub name: String,
    pub url: String,
    pub auth_user: Option<String>,
    #[serde(skip_serializing)]
    pub auth_pass: Option<String>,
    /// Frame-rate cap while no event is open.
    pub poll_max_fps: u32,
    /// Frame-rate cap while an event is open.
    pub alert_max_fps: u32,
    /// Seconds of no motion before an open event closes.
    pub event_close_delay: f64,
    pub creation_time: EpochMillis,
    pub last_edited: Option<EpochMillis>,
    pub enabled: bool,
    pub deleted: bool,
}

impl CameraSource {
    /// Basic-auth credentials, only when both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.auth_user.as_deref(), self.auth_pass.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    pub fn is_pollable(&self) -> bool {
        self.enabled && !self.deleted
    }

    /// Cadence for the current state: alarmed while an event is open, idle otherwise.
    pub fn target_fps(&self, alarmed: bool) -> u32 {
        if alarmed {
            self.alert_max_fps
        } else {
            self.poll_max_fps
        }
    }

    pub fn close_delay_ms(&self) -> i64 {
        (self.event_close_delay.max(0.0) * 1000.0).round() as i64
    }
}

/// Fields an operator supplies when registering or editing a camera.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NewCameraSource {
    pub name: String,
    pub url: String,
    pub auth_user: Option<String>,
    pub auth_pass: Option<String>,
    pub poll_max_fps: u32,
    pub alert_max_fps: u32,
    pub event_close_delay: f64,
    pub enabled: bool,
}

impl NewCameraSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            auth_user: None,
            auth_pass: None,
            poll_max_fps: DEFAULT_POLL_MAX_FPS,
            alert_max_fps: DEFAULT_ALERT_MAX_FPS,
            event_close_delay: DEFAULT_EVENT_CLOSE_DELAY_SECS,
            enabled: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("camera name must not be empty"));
        }
        let url = url::Url::parse(&self.url).map_err(|e| anyhow!("invalid camera url: {}", e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported camera url scheme '{}'; expected http(s)",
                url.scheme()
            ));
        }
        if self.poll_max_fps == 0 || self.alert_max_fps == 0 {
            return Err(anyhow!("frame-rate caps must be greater than zero"));
        }
        if !self.event_close_delay.is_finite() || self.event_close_delay < 0.0 {
            return Err(anyhow!("event close delay must be a non-negative number"));
        }
        Ok(())
    }
}

/// A run of frames with motion, plus the trailing quiet frames before it closed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CameraEvent {
    pub id: EventId,
    pub camera_id: CameraId,
    pub event_start: EpochMillis,
    pub event_end: EpochMillis,
    pub last_motion_time: EpochMillis,
    pub total_frames: u32,
    pub alarm_frames: u32,
    pub total_motion_rating: u64,
    pub max_motion_rating: u8,
    pub avg_motion_rating: f64,
    pub comments: Option<String>,
    pub category: Option<String>,
    pub viewed: bool,
    pub archived: bool,
    pub deleted: bool,
}

impl CameraEvent {
    /// A fresh event seeded from the frame that opened it.
    pub fn open(camera_id: CameraId, at: EpochMillis, rating: u8) -> Self {
        Self {
            id: 0,
            camera_id,
            event_start: at,
            event_end: at,
            last_motion_time: at,
            total_frames: 1,
            alarm_frames: 1,
            total_motion_rating: u64::from(rating),
            max_motion_rating: rating,
            avg_motion_rating: f64::from(rating),
            comments: None,
            category: None,
            viewed: false,
            archived: false,
            deleted: false,
        }
    }

    /// Fold one more frame into the running totals.
    ///
    /// Derived fields are recomputed on every call so a partially written
    /// event is always self-consistent.
    pub fn apply_frame(&mut self, at: EpochMillis, rating: u8, alarmed: bool) {
        self.total_frames += 1;
        if alarmed {
            self.alarm_frames += 1;
            self.last_motion_time = at;
        }
        self.total_motion_rating += u64::from(rating);
        self.max_motion_rating = self.max_motion_rating.max(rating);
        self.avg_motion_rating = self.total_motion_rating as f64 / f64::from(self.total_frames);
        self.event_end = self.event_end.max(at);
    }

    pub fn duration_ms(&self) -> i64 {
        self.event_end - self.event_start
    }
}

/// One captured frame. Never mutated after insertion.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CameraFrame {
    pub id: i64,
    pub camera_id: CameraId,
    pub event_id: Option<EventId>,
    pub image_time: EpochMillis,
    #[serde(skip)]
    pub full_size_image: Vec<u8>,
    pub motion_rating: u8,
    pub alarmed: bool,
}

impl CameraFrame {
    pub fn new(
        camera_id: CameraId,
        image_time: EpochMillis,
        image: Vec<u8>,
        motion_rating: u8,
        alarmed: bool,
    ) -> Self {
        Self {
            id: 0,
            camera_id,
            event_id: None,
            image_time,
            full_size_image: image,
            motion_rating,
            alarmed,
        }
    }
}

/// Browsing windows over event start times, on UTC day boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPeriod {
    Today,
    Yesterday,
    Week,
    Month,
    All,
}

impl EventPeriod {
    /// Half-open `[from, to)` window, or `None` for `All`.
    pub fn range(self, now_ms: EpochMillis) -> Result<Option<(EpochMillis, EpochMillis)>> {
        let now: DateTime<Utc> = DateTime::from_timestamp_millis(now_ms)
            .ok_or_else(|| anyhow!("timestamp {} out of range", now_ms))?;
        let today = now.date_naive();
        let range = match self {
            EventPeriod::All => return Ok(None),
            EventPeriod::Today => (day_start_ms(today), i64::MAX),
            EventPeriod::Yesterday => {
                let yesterday = today - ChronoDuration::days(1);
                (day_start_ms(yesterday), day_start_ms(today))
            }
            EventPeriod::Week => {
                let offset = i64::from(today.weekday().num_days_from_monday());
                (day_start_ms(today - ChronoDuration::days(offset)), i64::MAX)
            }
            EventPeriod::Month => {
                let first = today
                    .with_day(1)
                    .ok_or_else(|| anyhow!("cannot compute start of month"))?;
                (day_start_ms(first), i64::MAX)
            }
        };
        Ok(Some(range))
    }
}

impl std::str::FromStr for EventPeriod {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "today" => Ok(EventPeriod::Today),
            "yesterday" => Ok(EventPeriod::Yesterday),
            "week" => Ok(EventPeriod::Week),
            "month" => Ok(EventPeriod::Month),
            "all" => Ok(EventPeriod::All),
            other => Err(anyhow!(
                "unknown period '{}'; expected today|yesterday|week|month|all",
                other
            )),
        }
    }
}

fn day_start_ms(day: NaiveDate) -> EpochMillis {
    day.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0)
}
