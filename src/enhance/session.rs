//! Viewer-side glue: decides per page between cache, queue and nothing
//!
//! The viewer hands over decoded pages and polls for events; it never blocks
//! on the engine. Each scheduled page gets its own background thread which
//! waits for the queue, with a progress poller scoped to that wait.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use flume::{Receiver, Sender};
use image::RgbaImage;
use log::{debug, error, warn};

use super::cache::ImageEnhancementCache;
use super::job::{CancellationHandle, EnhancementJob};
use super::progress::{PageStatus, ProgressPoller};
use super::queue::EnhancementQueue;
use super::request::JobOutcome;
use super::types::{CollectionId, EnhanceParams};

#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    pub enabled: bool,
    pub show_status: bool,
    pub progress_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            show_status: true,
            progress_interval: Duration::from_millis(100),
        }
    }
}

/// What happened to a submitted page
#[derive(Debug)]
pub enum Submission {
    /// Enhancement is switched off
    Disabled,
    /// Outside the reading window
    Skipped,
    /// Already enhanced with the current parameters
    CacheHit(PathBuf),
    /// Running in the background; results arrive as [`PageEvent`]s
    Scheduled(CancellationHandle),
}

/// Enhanced result handed to the viewer
#[derive(Debug)]
pub enum EnhancedPage {
    /// Decode from this file
    Cached(PathBuf),
    /// Persisting failed; the only copy of the result
    Raw(RgbaImage),
}

#[derive(Debug)]
pub enum PageEvent {
    Status { item: usize, status: PageStatus },
    Enhanced { item: usize, page: EnhancedPage },
    /// No enhancement; keep showing the original
    Unchanged { item: usize },
}

pub struct PageEnhancer {
    queue: Arc<EnhancementQueue>,
    cache: Arc<ImageEnhancementCache>,
    collection: CollectionId,
    params: EnhanceParams,
    config_hash: String,
    config: SessionConfig,
    events_tx: Sender<PageEvent>,
    events_rx: Receiver<PageEvent>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PageEnhancer {
    pub fn new(
        queue: Arc<EnhancementQueue>,
        cache: Arc<ImageEnhancementCache>,
        collection: CollectionId,
        params: EnhanceParams,
        config: SessionConfig,
    ) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            queue,
            cache,
            collection,
            config_hash: params.config_hash(),
            params,
            config,
            events_tx,
            events_rx,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn queue(&self) -> &Arc<EnhancementQueue> {
        &self.queue
    }

    pub fn set_reading_position(&self, item: usize) {
        self.queue.set_position(item);
    }

    pub fn remove_page(&self, item: usize) {
        self.queue.remove_page(item);
    }

    /// Offer a freshly decoded page. Ownership of `image` moves to the
    /// background job if one is scheduled; otherwise it is dropped here.
    pub fn submit_page(&self, item: usize, image: RgbaImage) -> Submission {
        if !self.config.enabled {
            return Submission::Disabled;
        }
        self.emit_status(item, PageStatus::Raw);

        if !self.queue.should_process(item) {
            debug!("Skipping page {item} - outside reading window");
            return Submission::Skipped;
        }

        if let Err(e) = self.cache.init() {
            error!("Enhancement cache unavailable: {e:#}");
        }

        if let Some(path) = self
            .cache
            .get_cached_image(self.collection, item, &self.config_hash)
        {
            debug!("Cache hit for page {item} (collection {})", self.collection);
            self.queue.mark_completed(item);
            self.emit_status(item, PageStatus::Processed);
            self.maybe_sweep(item);
            return Submission::CacheHit(path);
        }

        let handle = CancellationHandle::new();
        self.queue.register_job(item, handle.clone());

        let task = PageTask {
            item,
            image,
            handle: handle.clone(),
            queue: Arc::clone(&self.queue),
            cache: Arc::clone(&self.cache),
            collection: self.collection,
            params: self.params,
            config_hash: self.config_hash.clone(),
            config: self.config,
            events: self.events_tx.clone(),
        };

        let spawned = std::thread::Builder::new()
            .name(format!("enhance-page-{item}"))
            .spawn(move || task.run());

        match spawned {
            Ok(thread) => {
                let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
                threads.retain(|t| !t.is_finished());
                threads.push(thread);
                Submission::Scheduled(handle)
            }
            Err(e) => {
                warn!("Failed to start enhancement of page {item}: {e}");
                self.queue.remove_page(item);
                Submission::Skipped
            }
        }
    }

    /// Drain events posted since the last call
    pub fn poll_events(&self) -> Vec<PageEvent> {
        self.events_rx.try_iter().collect()
    }

    /// Receiver for blocking consumers
    pub fn events(&self) -> &Receiver<PageEvent> {
        &self.events_rx
    }

    /// Cancel every outstanding page and wait for the page threads
    pub fn shutdown(&self) {
        self.queue.cancel_all();
        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for thread in threads {
            let _ = thread.join();
        }
    }

    fn emit_status(&self, item: usize, status: PageStatus) {
        if self.config.show_status {
            let _ = self.events_tx.send(PageEvent::Status { item, status });
        }
    }

    fn maybe_sweep(&self, item: usize) {
        sweep_if_due(&self.cache, self.collection, item);
    }
}

impl Drop for PageEnhancer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sweep_if_due(cache: &ImageEnhancementCache, collection: CollectionId, item: usize) {
    if cache.should_sweep(item) {
        if let Err(e) = cache.clear_old_cache(collection, item) {
            warn!("Failed to evict old cache entries of collection {collection}: {e:#}");
        }
    }
}

/// Everything a page thread needs, moved into it at spawn
struct PageTask {
    item: usize,
    image: RgbaImage,
    handle: CancellationHandle,
    queue: Arc<EnhancementQueue>,
    cache: Arc<ImageEnhancementCache>,
    collection: CollectionId,
    params: EnhanceParams,
    config_hash: String,
    config: SessionConfig,
    events: Sender<PageEvent>,
}

/// Drops this task's entry from the queue's job registry on every exit path
struct Registration {
    queue: Arc<EnhancementQueue>,
    item: usize,
    handle: CancellationHandle,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.queue.finish_job(self.item, &self.handle);
    }
}

impl PageTask {
    fn run(self) {
        let item = self.item;
        let registration = Registration {
            queue: Arc::clone(&self.queue),
            item,
            handle: self.handle.clone(),
        };

        // Double-check before heavy processing
        if !self.queue.should_process(item) || self.handle.is_cancelled() {
            debug!("Cancelled page {item} - behind reading progress");
            drop(registration);
            let _ = self.events.send(PageEvent::Unchanged { item });
            return;
        }

        let poller = self.config.show_status.then(|| {
            let events = self.events.clone();
            ProgressPoller::start(
                Arc::clone(self.queue.progress_cell()),
                item,
                self.config.progress_interval,
                move |status| {
                    let _ = events.send(PageEvent::Status { item, status });
                },
            )
        });

        let job = EnhancementJob::new(
            item,
            self.image,
            self.params,
            self.collection,
            self.config_hash,
        )
        .with_cancellation(self.handle);
        let outcome = self.queue.process_job(job);

        if let Some(poller) = poller {
            poller.stop();
        }
        drop(registration);

        match outcome {
            JobOutcome::Enhanced { image, cached } => {
                self.queue.mark_completed(item);
                let page = match cached {
                    Some(path) => {
                        sweep_if_due(&self.cache, self.collection, item);
                        EnhancedPage::Cached(path)
                    }
                    None => EnhancedPage::Raw(image),
                };
                if self.config.show_status {
                    let _ = self.events.send(PageEvent::Status {
                        item,
                        status: PageStatus::Processed,
                    });
                }
                let _ = self.events.send(PageEvent::Enhanced { item, page });
            }
            JobOutcome::Dropped(fault) => {
                debug!("Page {item} not enhanced: {fault}");
                let _ = self.events.send(PageEvent::Unchanged { item });
            }
        }
    }
}
