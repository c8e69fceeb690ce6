use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::detect::{
    DetectionSettings, DEFAULT_DIFF_SCALE, DEFAULT_EWMA_ALPHA, DEFAULT_GRID_SIZE,
    DEFAULT_MOTION_THRESHOLD,
};
use crate::ingest::{DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_MAX_FRAME_BYTES};
use crate::poll::{PollSettings, DEFAULT_MAX_TASK_AGE_SECS, DEFAULT_RUNTIME_BUDGET_SECS};
use crate::watchdog::{DEFAULT_MAX_CAMERAS, DEFAULT_STALE_AFTER_SECS, DEFAULT_SWEEP_INTERVAL_SECS};

const DEFAULT_DB_PATH: &str = "modetect.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8798";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ModetectConfigFile {
    db_path: Option<String>,
    max_cameras: Option<usize>,
    api: Option<ApiConfigFile>,
    detection: Option<DetectionConfigFile>,
    polling: Option<PollingConfigFile>,
    watchdog: Option<WatchdogConfigFile>,
    recording: Option<RecordingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectionConfigFile {
    grid_size: Option<u32>,
    ewma_alpha: Option<f64>,
    motion_threshold: Option<u8>,
    diff_scale: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PollingConfigFile {
    fetch_timeout_secs: Option<u64>,
    max_task_age_secs: Option<u64>,
    runtime_budget_secs: Option<u64>,
    max_frame_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct WatchdogConfigFile {
    stale_after_secs: Option<u64>,
    interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecordingConfigFile {
    store_idle_frames: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ModetectConfig {
    pub db_path: String,
    pub api_addr: String,
    pub max_cameras: usize,
    pub detection: DetectionSettings,
    pub polling: PollingConfig,
    pub watchdog: WatchdogConfig,
    pub store_idle_frames: bool,
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub fetch_timeout: Duration,
    pub max_task_age: Duration,
    pub runtime_budget: Duration,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub stale_after: Duration,
    pub interval: Duration,
}

impl ModetectConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MODETECT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ModetectConfigFile) -> Self {
        let detection = file.detection.unwrap_or_default();
        let polling = file.polling.unwrap_or_default();
        let watchdog = file.watchdog.unwrap_or_default();
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            max_cameras: file.max_cameras.unwrap_or(DEFAULT_MAX_CAMERAS),
            detection: DetectionSettings {
                grid_size: detection.grid_size.unwrap_or(DEFAULT_GRID_SIZE),
                ewma_alpha: detection.ewma_alpha.unwrap_or(DEFAULT_EWMA_ALPHA),
                motion_threshold: detection
                    .motion_threshold
                    .unwrap_or(DEFAULT_MOTION_THRESHOLD),
                diff_scale: detection.diff_scale.unwrap_or(DEFAULT_DIFF_SCALE),
            },
            polling: PollingConfig {
                fetch_timeout: Duration::from_secs(
                    polling
                        .fetch_timeout_secs
                        .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
                ),
                max_task_age: Duration::from_secs(
                    polling.max_task_age_secs.unwrap_or(DEFAULT_MAX_TASK_AGE_SECS),
                ),
                runtime_budget: Duration::from_secs(
                    polling
                        .runtime_budget_secs
                        .unwrap_or(DEFAULT_RUNTIME_BUDGET_SECS),
                ),
                max_frame_bytes: polling.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES),
            },
            watchdog: WatchdogConfig {
                stale_after: Duration::from_secs(
                    watchdog.stale_after_secs.unwrap_or(DEFAULT_STALE_AFTER_SECS),
                ),
                interval: Duration::from_secs(
                    watchdog.interval_secs.unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
                ),
            },
            store_idle_frames: file
                .recording
                .and_then(|recording| recording.store_idle_frames)
                .unwrap_or(true),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("MODETECT_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("MODETECT_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Some(secs) = env_secs("MODETECT_RUNTIME_BUDGET_SECS")? {
            self.polling.runtime_budget = secs;
        }
        if let Some(secs) = env_secs("MODETECT_MAX_TASK_AGE_SECS")? {
            self.polling.max_task_age = secs;
        }
        if let Some(secs) = env_secs("MODETECT_WATCHDOG_STALE_SECS")? {
            self.watchdog.stale_after = secs;
        }
        if let Ok(threshold) = std::env::var("MODETECT_MOTION_THRESHOLD") {
            self.detection.motion_threshold = threshold.trim().parse().map_err(|_| {
                anyhow!("MODETECT_MOTION_THRESHOLD must be an integer between 0 and 100")
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let alpha = self.detection.ewma_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(anyhow!("detection.ewma_alpha must be in (0, 1], got {}", alpha));
        }
        if self.detection.grid_size == 0 {
            return Err(anyhow!("detection.grid_size must be greater than zero"));
        }
        if self.detection.motion_threshold > 100 {
            return Err(anyhow!(
                "detection.motion_threshold must be at most 100, got {}",
                self.detection.motion_threshold
            ));
        }
        if !(self.detection.diff_scale.is_finite() && self.detection.diff_scale > 0.0) {
            return Err(anyhow!("detection.diff_scale must be a positive number"));
        }
        if self.polling.fetch_timeout >= self.polling.runtime_budget {
            return Err(anyhow!(
                "polling.fetch_timeout_secs must be shorter than polling.runtime_budget_secs"
            ));
        }
        if self.polling.max_frame_bytes == 0 {
            return Err(anyhow!("polling.max_frame_bytes must be greater than zero"));
        }
        if self.watchdog.interval.is_zero() {
            return Err(anyhow!("watchdog.interval_secs must be greater than zero"));
        }
        if self.max_cameras == 0 {
            return Err(anyhow!("max_cameras must be greater than zero"));
        }
        Ok(())
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            max_task_age: self.polling.max_task_age,
            runtime_budget: self.polling.runtime_budget,
            store_idle_frames: self.store_idle_frames,
            detection: self.detection,
        }
    }
}

fn read_config_file(path: &Path) -> Result<ModetectConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    match std::env::var(key) {
        Ok(value) => {
            let secs: u64 = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be an integer number of seconds", key))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}
