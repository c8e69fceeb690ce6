//! Volatile per-camera state.
//!
//! Everything here may vanish at any time. The engine treats a missing entry
//! as "never seen": the next comparison reports no prior frame and the
//! baseline reseeds itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::detect::MotionGrid;
use crate::{CameraId, EpochMillis, EventId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheField {
    /// Last captured raw frame bytes.
    LastImage,
    /// Last normalized grid.
    LastGrid,
    /// Moving average of the raw difference signal.
    Ewma,
    /// Id of the open event.
    OpenEvent,
    /// Pending operator request, stamped with when it was made.
    ManualTrigger,
    /// Time of last successful capture.
    LastCapture,
    /// Time of last poll attempt.
    LastPoll,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CacheValue {
    Bytes(Arc<Vec<u8>>),
    Grid(Arc<MotionGrid>),
    Float(f64),
    Time(EpochMillis),
    Event(EventId),
}

/// Key-value store keyed by `(camera, field)`. No durability, no cross-key
/// transactions.
pub trait VolatileCache: Send + Sync {
    fn get(&self, camera_id: CameraId, field: CacheField) -> Result<Option<CacheValue>>;

    fn set(&self, camera_id: CameraId, field: CacheField, value: CacheValue) -> Result<()>;

    fn delete(&self, camera_id: CameraId, field: CacheField) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<(CameraId, CacheField), CacheValue>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every field for one camera, as a cache eviction would.
    pub fn evict_camera(&self, camera_id: CameraId) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("volatile cache lock poisoned"))?;
        entries.retain(|(id, _), _| *id != camera_id);
        Ok(())
    }
}

impl VolatileCache for MemoryCache {
    fn get(&self, camera_id: CameraId, field: CacheField) -> Result<Option<CacheValue>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("volatile cache lock poisoned"))?;
        Ok(entries.get(&(camera_id, field)).cloned())
    }

    fn set(&self, camera_id: CameraId, field: CacheField, value: CacheValue) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("volatile cache lock poisoned"))?;
        entries.insert((camera_id, field), value);
        Ok(())
    }

    fn delete(&self, camera_id: CameraId, field: CacheField) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("volatile cache lock poisoned"))?;
        entries.remove(&(camera_id, field));
        Ok(())
    }
}

/// Typed snapshot of one camera's soft state.
///
/// Loaded from the cache at the top of a cycle, threaded through the scorer,
/// baseline and event machine, and written back once the cycle's durable
/// writes have succeeded. A pending manual trigger is not part of the
/// snapshot: the operator may set it at any moment, and saving must not
/// clobber it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CameraState {
    pub last_image: Option<Arc<Vec<u8>>>,
    pub last_grid: Option<Arc<MotionGrid>>,
    pub ewma: Option<f64>,
    pub open_event: Option<EventId>,
    pub last_capture: Option<EpochMillis>,
    pub last_poll: Option<EpochMillis>,
}

impl CameraState {
    pub fn load(cache: &dyn VolatileCache, camera_id: CameraId) -> Result<Self> {
        let mut state = Self::default();
        if let Some(CacheValue::Bytes(bytes)) = cache.get(camera_id, CacheField::LastImage)? {
            state.last_image = Some(bytes);
        }
        if let Some(CacheValue::Grid(grid)) = cache.get(camera_id, CacheField::LastGrid)? {
            state.last_grid = Some(grid);
        }
        if let Some(CacheValue::Float(ewma)) = cache.get(camera_id, CacheField::Ewma)? {
            state.ewma = Some(ewma);
        }
        state.open_event = load_open_event(cache, camera_id)?;
        state.last_capture = load_time(cache, camera_id, CacheField::LastCapture)?;
        state.last_poll = load_time(cache, camera_id, CacheField::LastPoll)?;
        Ok(state)
    }

    pub fn save(&self, cache: &dyn VolatileCache, camera_id: CameraId) -> Result<()> {
        put(
            cache,
            camera_id,
            CacheField::LastImage,
            self.last_image.clone().map(CacheValue::Bytes),
        )?;
        put(
            cache,
            camera_id,
            CacheField::LastGrid,
            self.last_grid.clone().map(CacheValue::Grid),
        )?;
        put(
            cache,
            camera_id,
            CacheField::Ewma,
            self.ewma.map(CacheValue::Float),
        )?;
        put(
            cache,
            camera_id,
            CacheField::OpenEvent,
            self.open_event.map(CacheValue::Event),
        )?;
        put(
            cache,
            camera_id,
            CacheField::LastCapture,
            self.last_capture.map(CacheValue::Time),
        )?;
        put(
            cache,
            camera_id,
            CacheField::LastPoll,
            self.last_poll.map(CacheValue::Time),
        )?;
        Ok(())
    }

    pub fn has_open_event(&self) -> bool {
        self.open_event.is_some()
    }
}

pub fn load_open_event(cache: &dyn VolatileCache, camera_id: CameraId) -> Result<Option<EventId>> {
    match cache.get(camera_id, CacheField::OpenEvent)? {
        Some(CacheValue::Event(id)) => Ok(Some(id)),
        _ => Ok(None),
    }
}

pub fn load_time(
    cache: &dyn VolatileCache,
    camera_id: CameraId,
    field: CacheField,
) -> Result<Option<EpochMillis>> {
    match cache.get(camera_id, field)? {
        Some(CacheValue::Time(at)) => Ok(Some(at)),
        _ => Ok(None),
    }
}

/// Ask the next cycle for this camera to treat its frame as motion: an idle
/// camera opens an event, an open event is kept alive.
pub fn request_trigger(
    cache: &dyn VolatileCache,
    camera_id: CameraId,
    requested_at: EpochMillis,
) -> Result<()> {
    cache.set(
        camera_id,
        CacheField::ManualTrigger,
        CacheValue::Time(requested_at),
    )
}

/// When the pending trigger was requested, if there is one.
pub fn pending_trigger(
    cache: &dyn VolatileCache,
    camera_id: CameraId,
) -> Result<Option<EpochMillis>> {
    load_time(cache, camera_id, CacheField::ManualTrigger)
}

/// Consume the trigger stamped `requested_at`. A newer request that landed
/// since it was read stays pending for the next cycle.
pub fn clear_trigger(
    cache: &dyn VolatileCache,
    camera_id: CameraId,
    requested_at: EpochMillis,
) -> Result<()> {
    if pending_trigger(cache, camera_id)? == Some(requested_at) {
        cache.delete(camera_id, CacheField::ManualTrigger)?;
    }
    Ok(())
}

fn put(
    cache: &dyn VolatileCache,
    camera_id: CameraId,
    field: CacheField,
    value: Option<CacheValue>,
) -> Result<()> {
    match value {
        Some(value) => cache.set(camera_id, field, value),
        None => cache.delete(camera_id, field),
    }
}
