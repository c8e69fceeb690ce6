use std::sync::Mutex;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::model::{CameraEvent, CameraFrame, CameraSource, NewCameraSource};
use crate::{open_db_connection, CameraId, EpochMillis, EventId};

/// Operator-visible lifecycle flags on an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventFlag {
    Viewed,
    Archived,
    Deleted,
}

impl EventFlag {
    fn column(self) -> &'static str {
        match self {
            EventFlag::Viewed => "viewed",
            EventFlag::Archived => "archived",
            EventFlag::Deleted => "deleted",
        }
    }
}

/// Durable store for camera sources, events and frames.
///
/// Every method is atomic per call. `open_event` and `extend_event` write the
/// event and its frame in one transaction so running totals never disagree
/// with the frames actually stored.
pub trait CameraStore: Send + Sync {
    fn insert_source(&self, source: &NewCameraSource, now: EpochMillis) -> Result<CameraId>;

    fn update_source(&self, id: CameraId, source: &NewCameraSource, now: EpochMillis) -> Result<()>;

    fn set_source_enabled(&self, id: CameraId, enabled: bool, now: EpochMillis) -> Result<()>;

    /// Soft delete. The garbage collector owns the real removal.
    fn mark_source_deleted(&self, id: CameraId, now: EpochMillis) -> Result<()>;

    fn get_source(&self, id: CameraId) -> Result<Option<CameraSource>>;

    /// Non-deleted sources, oldest first, at most `limit`.
    fn list_sources(&self, include_disabled: bool, limit: usize) -> Result<Vec<CameraSource>>;

    /// Insert a new event and its first frame. Returns the event id.
    fn open_event(&self, event: &CameraEvent, frame: &CameraFrame) -> Result<EventId>;

    /// Persist the updated totals of `event` and append `frame` to it.
    fn extend_event(&self, event: &CameraEvent, frame: &CameraFrame) -> Result<()>;

    /// Append a frame captured while no event was open.
    fn record_frame(&self, frame: &CameraFrame) -> Result<i64>;

    fn get_event(&self, id: EventId) -> Result<Option<CameraEvent>>;

    /// Non-deleted events whose start falls in `[from, to)`, oldest first.
    fn events_for_camera(
        &self,
        camera_id: CameraId,
        range: Option<(EpochMillis, EpochMillis)>,
    ) -> Result<Vec<CameraEvent>>;

    /// Frames of one event in capture order.
    fn frames_for_event(&self, event_id: EventId) -> Result<Vec<CameraFrame>>;

    fn count_frames(&self, camera_id: CameraId, since: EpochMillis) -> Result<u64>;

    fn count_events(&self, camera_id: CameraId, since: EpochMillis) -> Result<u64>;

    fn set_event_flag(&self, id: EventId, flag: EventFlag, value: bool) -> Result<()>;

    fn mark_event_viewed(&self, id: EventId) -> Result<()> {
        self.set_event_flag(id, EventFlag::Viewed, true)
    }

    fn archive_event(&self, id: EventId) -> Result<()> {
        self.set_event_flag(id, EventFlag::Archived, true)
    }

    /// Soft delete; the event drops out of browsing queries.
    fn mark_event_deleted(&self, id: EventId) -> Result<()> {
        self.set_event_flag(id, EventFlag::Deleted, true)
    }
}

pub struct SqliteCameraStore {
    conn: Mutex<Connection>,
}

const SOURCE_COLUMNS: &str = "id, name, url, auth_user, auth_pass, poll_max_fps, alert_max_fps, \
     event_close_delay, creation_time, last_edited, enabled, deleted";

const EVENT_COLUMNS: &str = "id, camera_id, event_start, event_end, last_motion_time, \
     total_frames, alarm_frames, total_motion_rating, max_motion_rating, avg_motion_rating, \
     comments, category, viewed, archived, deleted";

const FRAME_COLUMNS: &str =
    "id, camera_id, event_id, image_time, full_size_image, motion_rating, alarmed";

impl SqliteCameraStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("camera store lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS camera_sources (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              url TEXT NOT NULL,
              auth_user TEXT,
              auth_pass TEXT,
              poll_max_fps INTEGER NOT NULL DEFAULT 1,
              alert_max_fps INTEGER NOT NULL DEFAULT 10,
              event_close_delay REAL NOT NULL DEFAULT 2.0,
              creation_time INTEGER NOT NULL,
              last_edited INTEGER,
              enabled INTEGER NOT NULL DEFAULT 1,
              deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS camera_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id INTEGER NOT NULL REFERENCES camera_sources(id),
              event_start INTEGER NOT NULL,
              event_end INTEGER NOT NULL,
              last_motion_time INTEGER NOT NULL,
              total_frames INTEGER NOT NULL DEFAULT 0,
              alarm_frames INTEGER NOT NULL DEFAULT 0,
              total_motion_rating INTEGER NOT NULL DEFAULT 0,
              max_motion_rating INTEGER NOT NULL DEFAULT 0,
              avg_motion_rating REAL NOT NULL DEFAULT 0,
              comments TEXT,
              category TEXT,
              viewed INTEGER NOT NULL DEFAULT 0,
              archived INTEGER NOT NULL DEFAULT 0,
              deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS camera_frames (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id INTEGER NOT NULL REFERENCES camera_sources(id),
              event_id INTEGER REFERENCES camera_events(id),
              image_time INTEGER NOT NULL,
              full_size_image BLOB NOT NULL,
              motion_rating INTEGER NOT NULL DEFAULT 0,
              alarmed INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_events_camera_start ON camera_events(camera_id, event_start);
            CREATE INDEX IF NOT EXISTS idx_frames_camera_time ON camera_frames(camera_id, image_time);
            CREATE INDEX IF NOT EXISTS idx_frames_event ON camera_frames(event_id, image_time);
            "#,
        )?;
        Ok(())
    }
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<CameraSource> {
    Ok(CameraSource {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        auth_user: row.get(3)?,
        auth_pass: row.get(4)?,
        poll_max_fps: row.get(5)?,
        alert_max_fps: row.get(6)?,
        event_close_delay: row.get(7)?,
        creation_time: row.get(8)?,
        last_edited: row.get(9)?,
        enabled: row.get(10)?,
        deleted: row.get(11)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<CameraEvent> {
    let total_motion_rating: i64 = row.get(7)?;
    Ok(CameraEvent {
        id: row.get(0)?,
        camera_id: row.get(1)?,
        event_start: row.get(2)?,
        event_end: row.get(3)?,
        last_motion_time: row.get(4)?,
        total_frames: row.get(5)?,
        alarm_frames: row.get(6)?,
        total_motion_rating: total_motion_rating.max(0) as u64,
        max_motion_rating: row.get(8)?,
        avg_motion_rating: row.get(9)?,
        comments: row.get(10)?,
        category: row.get(11)?,
        viewed: row.get(12)?,
        archived: row.get(13)?,
        deleted: row.get(14)?,
    })
}

fn frame_from_row(row: &Row<'_>) -> rusqlite::Result<CameraFrame> {
    Ok(CameraFrame {
        id: row.get(0)?,
        camera_id: row.get(1)?,
        event_id: row.get(2)?,
        image_time: row.get(3)?,
        full_size_image: row.get(4)?,
        motion_rating: row.get(5)?,
        alarmed: row.get(6)?,
    })
}

fn insert_frame(conn: &Connection, frame: &CameraFrame, event_id: Option<EventId>) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO camera_frames(camera_id, event_id, image_time, full_size_image, motion_rating, alarmed)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            frame.camera_id,
            event_id,
            frame.image_time,
            frame.full_size_image,
            frame.motion_rating,
            frame.alarmed
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn total_as_i64(event: &CameraEvent) -> Result<i64> {
    i64::try_from(event.total_motion_rating)
        .map_err(|_| anyhow!("event total motion rating exceeds i64 range"))
}

impl CameraStore for SqliteCameraStore {
    fn insert_source(&self, source: &NewCameraSource, now: EpochMillis) -> Result<CameraId> {
        source.validate()?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO camera_sources(name, url, auth_user, auth_pass, poll_max_fps, alert_max_fps,
                                       event_close_delay, creation_time, enabled, deleted)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)
            "#,
            params![
                source.name,
                source.url,
                source.auth_user,
                source.auth_pass,
                source.poll_max_fps,
                source.alert_max_fps,
                source.event_close_delay,
                now,
                source.enabled
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_source(&self, id: CameraId, source: &NewCameraSource, now: EpochMillis) -> Result<()> {
        source.validate()?;
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE camera_sources
            SET name = ?2, url = ?3, auth_user = ?4, auth_pass = ?5, poll_max_fps = ?6,
                alert_max_fps = ?7, event_close_delay = ?8, enabled = ?9, last_edited = ?10
            WHERE id = ?1 AND deleted = 0
            "#,
            params![
                id,
                source.name,
                source.url,
                source.auth_user,
                source.auth_pass,
                source.poll_max_fps,
                source.alert_max_fps,
                source.event_close_delay,
                source.enabled,
                now
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("camera {} not found", id));
        }
        Ok(())
    }

    fn set_source_enabled(&self, id: CameraId, enabled: bool, now: EpochMillis) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE camera_sources SET enabled = ?2, last_edited = ?3 WHERE id = ?1 AND deleted = 0",
            params![id, enabled, now],
        )?;
        if changed == 0 {
            return Err(anyhow!("camera {} not found", id));
        }
        Ok(())
    }

    fn mark_source_deleted(&self, id: CameraId, now: EpochMillis) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE camera_sources SET deleted = 1, last_edited = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        if changed == 0 {
            return Err(anyhow!("camera {} not found", id));
        }
        Ok(())
    }

    fn get_source(&self, id: CameraId) -> Result<Option<CameraSource>> {
        let conn = self.lock()?;
        let source = conn
            .query_row(
                &format!("SELECT {} FROM camera_sources WHERE id = ?1", SOURCE_COLUMNS),
                params![id],
                source_from_row,
            )
            .optional()?;
        Ok(source)
    }

    fn list_sources(&self, include_disabled: bool, limit: usize) -> Result<Vec<CameraSource>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM camera_sources WHERE deleted = 0 AND (enabled = 1 OR ?1) \
             ORDER BY creation_time ASC, id ASC LIMIT ?2",
            SOURCE_COLUMNS
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![include_disabled, limit], source_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn open_event(&self, event: &CameraEvent, frame: &CameraFrame) -> Result<EventId> {
        let total = total_as_i64(event)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO camera_events(camera_id, event_start, event_end, last_motion_time, total_frames,
                                      alarm_frames, total_motion_rating, max_motion_rating,
                                      avg_motion_rating, viewed, archived, deleted)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, 0)
            "#,
            params![
                event.camera_id,
                event.event_start,
                event.event_end,
                event.last_motion_time,
                event.total_frames,
                event.alarm_frames,
                total,
                event.max_motion_rating,
                event.avg_motion_rating
            ],
        )?;
        let event_id = tx.last_insert_rowid();
        insert_frame(&tx, frame, Some(event_id))?;
        tx.commit()?;
        Ok(event_id)
    }

    fn extend_event(&self, event: &CameraEvent, frame: &CameraFrame) -> Result<()> {
        let total = total_as_i64(event)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            r#"
            UPDATE camera_events
            SET event_end = ?2, last_motion_time = ?3, total_frames = ?4, alarm_frames = ?5,
                total_motion_rating = ?6, max_motion_rating = ?7, avg_motion_rating = ?8
            WHERE id = ?1
            "#,
            params![
                event.id,
                event.event_end,
                event.last_motion_time,
                event.total_frames,
                event.alarm_frames,
                total,
                event.max_motion_rating,
                event.avg_motion_rating
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("event {} not found", event.id));
        }
        insert_frame(&tx, frame, Some(event.id))?;
        tx.commit()?;
        Ok(())
    }

    fn record_frame(&self, frame: &CameraFrame) -> Result<i64> {
        let conn = self.lock()?;
        insert_frame(&conn, frame, None)
    }

    fn get_event(&self, id: EventId) -> Result<Option<CameraEvent>> {
        let conn = self.lock()?;
        let event = conn
            .query_row(
                &format!("SELECT {} FROM camera_events WHERE id = ?1", EVENT_COLUMNS),
                params![id],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    fn events_for_camera(
        &self,
        camera_id: CameraId,
        range: Option<(EpochMillis, EpochMillis)>,
    ) -> Result<Vec<CameraEvent>> {
        let (from, to) = range.unwrap_or((i64::MIN, i64::MAX));
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM camera_events WHERE camera_id = ?1 AND deleted = 0 \
             AND event_start >= ?2 AND event_start < ?3 ORDER BY event_start ASC, id ASC",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![camera_id, from, to], event_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn frames_for_event(&self, event_id: EventId) -> Result<Vec<CameraFrame>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM camera_frames WHERE event_id = ?1 ORDER BY image_time ASC, id ASC",
            FRAME_COLUMNS
        ))?;
        let rows = stmt.query_map(params![event_id], frame_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn count_frames(&self, camera_id: CameraId, since: EpochMillis) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM camera_frames WHERE camera_id = ?1 AND image_time >= ?2",
            params![camera_id, since],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn count_events(&self, camera_id: CameraId, since: EpochMillis) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM camera_events WHERE camera_id = ?1 AND deleted = 0 AND event_start >= ?2",
            params![camera_id, since],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn set_event_flag(&self, id: EventId, flag: EventFlag, value: bool) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            &format!("UPDATE camera_events SET {} = ?2 WHERE id = ?1", flag.column()),
            params![id, value],
        )?;
        if changed == 0 {
            return Err(anyhow!("event {} not found", id));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryTables {
    sources: Vec<CameraSource>,
    events: Vec<CameraEvent>,
    frames: Vec<CameraFrame>,
}

/// Store for tests and ephemeral runs. Same semantics as the SQLite store.
#[derive(Debug, Default)]
pub struct InMemoryCameraStore {
    tables: Mutex<InMemoryTables>,
}

impl InMemoryCameraStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryTables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("camera store lock poisoned"))
    }
}

fn next_id(len: usize) -> i64 {
    len as i64 + 1
}

impl CameraStore for InMemoryCameraStore {
    fn insert_source(&self, source: &NewCameraSource, now: EpochMillis) -> Result<CameraId> {
        source.validate()?;
        let mut tables = self.lock()?;
        let id = next_id(tables.sources.len());
        tables.sources.push(CameraSource {
            id,
            name: source.name.clone(),
            url: source.url.clone(),
            auth_user: source.auth_user.clone(),
            auth_pass: source.auth_pass.clone(),
            poll_max_fps: source.poll_max_fps,
            alert_max_fps: source.alert_max_fps,
            event_close_delay: source.event_close_delay,
            creation_time: now,
            last_edited: None,
            enabled: source.enabled,
            deleted: false,
        });
        Ok(id)
    }

    fn update_source(&self, id: CameraId, source: &NewCameraSource, now: EpochMillis) -> Result<()> {
        source.validate()?;
        let mut tables = self.lock()?;
        let existing = tables
            .sources
            .iter_mut()
            .find(|s| s.id == id && !s.deleted)
            .ok_or_else(|| anyhow!("camera {} not found", id))?;
        existing.name = source.name.clone();
        existing.url = source.url.clone();
        existing.auth_user = source.auth_user.clone();
        existing.auth_pass = source.auth_pass.clone();
        existing.poll_max_fps = source.poll_max_fps;
        existing.alert_max_fps = source.alert_max_fps;
        existing.event_close_delay = source.event_close_delay;
        existing.enabled = source.enabled;
        existing.last_edited = Some(now);
        Ok(())
    }

    fn set_source_enabled(&self, id: CameraId, enabled: bool, now: EpochMillis) -> Result<()> {
        let mut tables = self.lock()?;
        let existing = tables
            .sources
            .iter_mut()
            .find(|s| s.id == id && !s.deleted)
            .ok_or_else(|| anyhow!("camera {} not found", id))?;
        existing.enabled = enabled;
        existing.last_edited = Some(now);
        Ok(())
    }

    fn mark_source_deleted(&self, id: CameraId, now: EpochMillis) -> Result<()> {
        let mut tables = self.lock()?;
        let existing = tables
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| anyhow!("camera {} not found", id))?;
        existing.deleted = true;
        existing.last_edited = Some(now);
        Ok(())
    }

    fn get_source(&self, id: CameraId) -> Result<Option<CameraSource>> {
        let tables = self.lock()?;
        Ok(tables.sources.iter().find(|s| s.id == id).cloned())
    }

    fn list_sources(&self, include_disabled: bool, limit: usize) -> Result<Vec<CameraSource>> {
        let tables = self.lock()?;
        let mut out: Vec<CameraSource> = tables
            .sources
            .iter()
            .filter(|s| !s.deleted && (s.enabled || include_disabled))
            .cloned()
            .collect();
        out.sort_by_key(|s| (s.creation_time, s.id));
        out.truncate(limit);
        Ok(out)
    }

    fn open_event(&self, event: &CameraEvent, frame: &CameraFrame) -> Result<EventId> {
        let mut tables = self.lock()?;
        let event_id = next_id(tables.events.len());
        let mut stored = event.clone();
        stored.id = event_id;
        tables.events.push(stored);
        let mut stored_frame = frame.clone();
        stored_frame.id = next_id(tables.frames.len());
        stored_frame.event_id = Some(event_id);
        tables.frames.push(stored_frame);
        Ok(event_id)
    }

    fn extend_event(&self, event: &CameraEvent, frame: &CameraFrame) -> Result<()> {
        let mut tables = self.lock()?;
        let existing = tables
            .events
            .iter_mut()
            .find(|e| e.id == event.id)
            .ok_or_else(|| anyhow!("event {} not found", event.id))?;
        existing.event_end = event.event_end;
        existing.last_motion_time = event.last_motion_time;
        existing.total_frames = event.total_frames;
        existing.alarm_frames = event.alarm_frames;
        existing.total_motion_rating = event.total_motion_rating;
        existing.max_motion_rating = event.max_motion_rating;
        existing.avg_motion_rating = event.avg_motion_rating;
        let mut stored_frame = frame.clone();
        stored_frame.id = next_id(tables.frames.len());
        stored_frame.event_id = Some(event.id);
        tables.frames.push(stored_frame);
        Ok(())
    }

    fn record_frame(&self, frame: &CameraFrame) -> Result<i64> {
        let mut tables = self.lock()?;
        let id = next_id(tables.frames.len());
        let mut stored = frame.clone();
        stored.id = id;
        stored.event_id = None;
        tables.frames.push(stored);
        Ok(id)
    }

    fn get_event(&self, id: EventId) -> Result<Option<CameraEvent>> {
        let tables = self.lock()?;
        Ok(tables.events.iter().find(|e| e.id == id).cloned())
    }

    fn events_for_camera(
        &self,
        camera_id: CameraId,
        range: Option<(EpochMillis, EpochMillis)>,
    ) -> Result<Vec<CameraEvent>> {
        let (from, to) = range.unwrap_or((i64::MIN, i64::MAX));
        let tables = self.lock()?;
        let mut out: Vec<CameraEvent> = tables
            .events
            .iter()
            .filter(|e| {
                e.camera_id == camera_id && !e.deleted && e.event_start >= from && e.event_start < to
            })
            .cloned()
            .collect();
        out.sort_by_key(|e| (e.event_start, e.id));
        Ok(out)
    }

    fn frames_for_event(&self, event_id: EventId) -> Result<Vec<CameraFrame>> {
        let tables = self.lock()?;
        let mut out: Vec<CameraFrame> = tables
            .frames
            .iter()
            .filter(|f| f.event_id == Some(event_id))
            .cloned()
            .collect();
        out.sort_by_key(|f| (f.image_time, f.id));
        Ok(out)
    }

    fn count_frames(&self, camera_id: CameraId, since: EpochMillis) -> Result<u64> {
        let tables = self.lock()?;
        Ok(tables
            .frames
            .iter()
            .filter(|f| f.camera_id == camera_id && f.image_time >= since)
            .count() as u64)
    }

    fn count_events(&self, camera_id: CameraId, since: EpochMillis) -> Result<u64> {
        let tables = self.lock()?;
        Ok(tables
            .events
            .iter()
            .filter(|e| e.camera_id == camera_id && !e.deleted && e.event_start >= since)
            .count() as u64)
    }

    fn set_event_flag(&self, id: EventId, flag: EventFlag, value: bool) -> Result<()> {
        let mut tables = self.lock()?;
        let existing = tables
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| anyhow!("event {} not found", id))?;
        match flag {
            EventFlag::Viewed => existing.viewed = value,
            EventFlag::Archived => existing.archived = value,
            EventFlag::Deleted => existing.deleted = value,
        }
        Ok(())
    }
}
