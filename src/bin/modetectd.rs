//! modetectd - motion detection daemon
//!
//! This daemon:
//! 1. Opens the durable camera store and an in-process volatile cache
//! 2. Serves poll tasks from an in-process queue, one thread per invocation
//! 3. Runs the watchdog, whose first sweep starts every enabled camera
//! 4. Serves the loopback control API (manual trigger, status)
//! 5. On Ctrl-C, stops loops at their next boundary and drains

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use modetect::{
    api::{ApiConfig, ApiServer},
    ChannelTaskQueue, Clock, Dispatcher, HttpFrameSource, ImageNormalizer, MemoryCache,
    ModetectConfig, PollController, SqliteCameraStore, SystemClock, Watchdog,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ModetectConfig::load()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(SqliteCameraStore::open(&config.db_path)?);
    let cache = Arc::new(MemoryCache::new());
    let frames = Arc::new(HttpFrameSource::new(
        config.polling.fetch_timeout,
        config.polling.max_frame_bytes,
        clock.clone(),
    ));
    let (queue, receiver) = ChannelTaskQueue::new();
    let queue = Arc::new(queue);

    let controller = Arc::new(PollController::new(
        store.clone(),
        cache.clone(),
        frames,
        Arc::new(ImageNormalizer),
        queue.clone(),
        clock.clone(),
        config.poll_settings(),
    ));
    let deadline = controller.deadline_flag();
    let dispatcher = Dispatcher::new(controller, receiver).spawn()?;

    let api_handle = ApiServer::new(
        ApiConfig {
            addr: config.api_addr.clone(),
            max_cameras: config.max_cameras,
        },
        store.clone(),
        cache.clone(),
    )
    .spawn()?;

    let watchdog_stop = Arc::new(AtomicBool::new(false));
    let watchdog = Watchdog::new(
        store,
        cache,
        queue,
        clock,
        config.watchdog.stale_after,
        config.max_cameras,
    )
    .spawn(config.watchdog.interval, watchdog_stop.clone())?;

    log::info!("modetectd running. writing to {}", config.db_path);
    log::info!(
        "budget={}s max_task_age={}s threshold={} alpha={}",
        config.polling.runtime_budget.as_secs(),
        config.polling.max_task_age.as_secs(),
        config.detection.motion_threshold,
        config.detection.ewma_alpha
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping poll loops...");
    watchdog_stop.store(true, Ordering::SeqCst);
    deadline.store(true, Ordering::SeqCst);
    if watchdog.join().is_err() {
        log::error!("watchdog thread panicked");
    }
    api_handle.stop()?;
    dispatcher.stop()?;
    log::info!("modetectd stopped");
    Ok(())
}
