//! Enhancement queue - admission control, serialization and cancellation

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use flume::Sender;
use image::RgbaImage;
use log::{debug, warn};

use super::cache::ImageEnhancementCache;
use super::engine::{EngineAdapter, InferenceEngine};
use super::job::{CancellationHandle, EnhancementJob};
use super::progress::{Progress, ProgressCell};
use super::request::{EnhanceFault, EnhanceRequest, JobOutcome};
use super::window::ReadingWindow;
use super::worker::enhancement_worker;

/// Queue tuning
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueConfig {
    /// How many positions behind the reader a waiting job may fall before the
    /// worker discards it instead of running it
    pub staleness_tolerance: usize,
}

/// Schedules enhancement jobs onto a single engine worker.
///
/// Every engine call happens on one dedicated thread, so no two inferences
/// ever overlap. `process` blocks its caller until the job is done and must
/// be called from a background thread, never from the viewer thread.
pub struct EnhancementQueue {
    window: Arc<ReadingWindow>,
    progress: Arc<ProgressCell>,
    request_tx: Sender<EnhanceRequest>,
    jobs: Mutex<HashMap<usize, CancellationHandle>>,
    completed: Mutex<HashSet<usize>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EnhancementQueue {
    /// Start the worker thread that owns `engine`
    pub fn spawn(
        engine: Box<dyn InferenceEngine>,
        cache: Arc<ImageEnhancementCache>,
        window: Arc<ReadingWindow>,
        config: QueueConfig,
    ) -> Result<Self> {
        let progress = Arc::new(ProgressCell::new());
        let adapter = EngineAdapter::new(engine, Arc::clone(&progress));
        let (request_tx, request_rx) = flume::unbounded();

        let worker_window = Arc::clone(&window);
        let worker = std::thread::Builder::new()
            .name("enhancement-worker".to_string())
            .spawn(move || {
                enhancement_worker(
                    adapter,
                    request_rx,
                    cache,
                    worker_window,
                    config.staleness_tolerance,
                );
            })
            .context("Failed to spawn enhancement worker")?;

        Ok(Self {
            window,
            progress,
            request_tx,
            jobs: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashSet::new()),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn window(&self) -> &Arc<ReadingWindow> {
        &self.window
    }

    pub fn progress_cell(&self) -> &Arc<ProgressCell> {
        &self.progress
    }

    /// Cheap, non-blocking admission check
    pub fn should_process(&self, item: usize) -> bool {
        self.window.contains(item)
    }

    /// Move the reading position. Completion records behind it are dropped.
    pub fn set_position(&self, position: usize) {
        self.window.set_position(position);
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|item| *item >= position);
    }

    /// Run a job and return the enhanced image, or `None` for any failure
    pub fn process(&self, job: EnhancementJob) -> Option<RgbaImage> {
        self.process_job(job).into_image()
    }

    /// Like [`process`](Self::process), keeping the reason and cache path
    pub fn process_job(&self, job: EnhancementJob) -> JobOutcome {
        let item = job.item;

        if !self.should_process(item) {
            debug!("Skipping page {item} - outside reading window");
            return JobOutcome::Dropped(EnhanceFault::OutOfWindow);
        }
        if job.cancel.is_cancelled() {
            return JobOutcome::Dropped(EnhanceFault::Cancelled);
        }

        let (reply_tx, reply_rx) = flume::bounded(1);
        if self
            .request_tx
            .send(EnhanceRequest::Process {
                job,
                reply: reply_tx,
            })
            .is_err()
        {
            warn!("Enhancement worker is gone, page {item} stays unenhanced");
            return JobOutcome::Dropped(EnhanceFault::WorkerGone);
        }

        reply_rx
            .recv()
            .unwrap_or(JobOutcome::Dropped(EnhanceFault::WorkerGone))
    }

    /// Record that interest in `item` is satisfied. Idempotent.
    ///
    /// Only completion bookkeeping: a job registered for `item` stays
    /// registered, since it may be a newer submission than the one that
    /// finished. See [`finish_job`](Self::finish_job).
    pub fn mark_completed(&self, item: usize) {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item);
    }

    pub fn is_completed(&self, item: usize) -> bool {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&item)
    }

    /// Tie a cancellation handle to `item`. A different job already
    /// registered for the same item is superseded and cancelled.
    pub fn register_job(&self, item: usize, handle: CancellationHandle) {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&item);

        let previous = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item, handle.clone());

        if let Some(previous) = previous {
            if !previous.same_job(&handle) {
                debug!("Page {item} resubmitted, cancelling the earlier job");
                previous.cancel();
            }
        }
    }

    /// Forget the registration of a job that has ended, however it ended.
    /// A newer job registered for the same item is left alone.
    pub fn finish_job(&self, item: usize, handle: &CancellationHandle) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.get(&item).is_some_and(|current| current.same_job(handle)) {
            jobs.remove(&item);
        }
    }

    /// Cancel and forget whatever job is registered for `item`.
    /// No-op when nothing is registered.
    pub fn remove_page(&self, item: usize) {
        let handle = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&item);

        if let Some(handle) = handle {
            debug!("Cancelling enhancement of page {item}");
            handle.cancel();
        }
    }

    /// Cancel every registered job
    pub fn cancel_all(&self) {
        let handles: Vec<_> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.cancel();
        }
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Packed progress: item id in the high 32 bits, percent in the low 32
    pub fn packed_progress(&self) -> u64 {
        self.progress.packed()
    }

    pub fn progress(&self) -> Progress {
        self.progress.load()
    }

    /// Cancel outstanding jobs, stop the worker and wait for it
    pub fn shutdown(&self) {
        self.cancel_all();
        let _ = self.request_tx.send(EnhanceRequest::Shutdown);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("Enhancement worker panicked");
            }
        }
    }
}

impl Drop for EnhancementQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
