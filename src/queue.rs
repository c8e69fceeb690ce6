//! Task queue contract and the in-process dispatcher that serves it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::poll::{PollController, PollTask};

/// Accepts poll work items and delivers each at least once, possibly late.
///
/// Consumers tolerate duplicates and late delivery through the epoch guard in
/// `PollController::run`.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: PollTask) -> Result<()>;
}

/// Queue backed by an mpsc channel, drained by a `Dispatcher`.
#[derive(Clone)]
pub struct ChannelTaskQueue {
    sender: Sender<PollTask>,
}

impl ChannelTaskQueue {
    pub fn new() -> (Self, Receiver<PollTask>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl TaskQueue for ChannelTaskQueue {
    fn enqueue(&self, task: PollTask) -> Result<()> {
        self.sender
            .send(task)
            .map_err(|_| anyhow!("task queue closed; dropped task for camera {}", task.camera_id))
    }
}

/// Queue that only remembers what it was given.
#[derive(Debug, Default)]
pub struct RecordingTaskQueue {
    tasks: Mutex<Vec<PollTask>>,
}

impl RecordingTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<PollTask> {
        self.tasks
            .lock()
            .map(|tasks| tasks.clone())
            .unwrap_or_default()
    }
}

impl TaskQueue for RecordingTaskQueue {
    fn enqueue(&self, task: PollTask) -> Result<()> {
        self.tasks
            .lock()
            .map_err(|_| anyhow!("recording queue lock poisoned"))?
            .push(task);
        Ok(())
    }
}

/// Runs each delivered task on its own thread.
///
/// Tasks for different cameras run fully in parallel; the controller's lease
/// keeps a camera to one active invocation.
pub struct Dispatcher {
    controller: Arc<PollController>,
    receiver: Receiver<PollTask>,
}

pub struct DispatcherHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Stop accepting tasks and wait for running invocations to return.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("dispatcher thread panicked"))?;
        }
        Ok(())
    }
}

impl Dispatcher {
    pub fn new(controller: Arc<PollController>, receiver: Receiver<PollTask>) -> Self {
        Self {
            controller,
            receiver,
        }
    }

    pub fn spawn(self) -> Result<DispatcherHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("poll-dispatcher".to_string())
            .spawn(move || self.run(shutdown_thread))?;
        Ok(DispatcherHandle {
            shutdown,
            join: Some(join),
        })
    }

    fn run(self, shutdown: Arc<AtomicBool>) {
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match self.receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(task) => {
                    let controller = self.controller.clone();
                    let spawned = std::thread::Builder::new()
                        .name(format!("poll-camera-{}", task.camera_id))
                        .spawn(move || run_task(&controller, task));
                    match spawned {
                        Ok(handle) => workers.push(handle),
                        Err(err) => log::error!(
                            "camera {} poll thread failed to start: {}",
                            task.camera_id,
                            err
                        ),
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            workers.retain(|worker| !worker.is_finished());
        }

        for worker in workers {
            if worker.join().is_err() {
                log::error!("poll thread panicked");
            }
        }
    }
}

fn run_task(controller: &PollController, task: PollTask) {
    match controller.run(task) {
        Ok(outcome) => log::debug!("camera {} invocation finished: {:?}", task.camera_id, outcome),
        Err(err) => log::error!(
            "camera {} invocation aborted without handoff: {:#}",
            task.camera_id,
            err
        ),
    }
}
