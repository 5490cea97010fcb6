//! Progress reporting between the engine and any number of observers
//!
//! The engine overwrites a single packed 64-bit value while it runs; observers
//! poll it without taking a lock. The packing only exists at that boundary,
//! everything else works with [`Progress`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use flume::{RecvTimeoutError, Sender};
use log::{trace, warn};

/// Which item the engine is working on and how far along it is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub item: i32,
    pub percent: i32,
}

impl Progress {
    /// Reported while no job is running
    pub const IDLE: Progress = Progress {
        item: -1,
        percent: 0,
    };

    #[must_use]
    pub const fn new(item: i32, percent: i32) -> Self {
        Self { item, percent }
    }

    /// Progress for a page index; indices beyond `i32::MAX` are never reported
    #[must_use]
    pub fn for_item(item: usize, percent: i32) -> Self {
        Self {
            item: i32::try_from(item).unwrap_or(-1),
            percent: percent.clamp(0, 100),
        }
    }

    /// High 32 bits hold the item id, low 32 bits the percentage
    #[must_use]
    pub const fn encode(self) -> u64 {
        ((self.item as u32 as u64) << 32) | (self.percent as u32 as u64)
    }

    #[must_use]
    pub const fn decode(packed: u64) -> Self {
        Self {
            item: (packed >> 32) as u32 as i32,
            percent: (packed & 0xFFFF_FFFF) as u32 as i32,
        }
    }

    #[must_use]
    pub fn is_for(&self, item: usize) -> bool {
        self.item >= 0 && self.item as usize == item
    }
}

/// Lock-free cell holding the packed progress value
#[derive(Debug)]
pub struct ProgressCell {
    packed: AtomicU64,
}

impl Default for ProgressCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            packed: AtomicU64::new(Progress::IDLE.encode()),
        }
    }

    pub fn store(&self, progress: Progress) {
        self.packed.store(progress.encode(), Ordering::Release);
    }

    pub fn reset(&self) {
        self.store(Progress::IDLE);
    }

    pub fn packed(&self) -> u64 {
        self.packed.load(Ordering::Acquire)
    }

    pub fn load(&self) -> Progress {
        Progress::decode(self.packed())
    }

    /// Status as seen by the observer of `item`. A different item running
    /// means this one is still waiting, whatever its old percentage was.
    pub fn status_for(&self, item: usize) -> PageStatus {
        let progress = self.load();
        if progress.is_for(item) {
            PageStatus::Processing(progress.percent.clamp(0, 100) as u8)
        } else {
            PageStatus::Queued
        }
    }
}

/// What a viewer shows next to a page
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageStatus {
    Raw,
    Queued,
    Processing(u8),
    Processed,
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageStatus::Raw => write!(f, "RAW"),
            PageStatus::Queued => write!(f, "QUEUED"),
            PageStatus::Processing(p) => write!(f, "PROCESSING: {p}%"),
            PageStatus::Processed => write!(f, "PROCESSED"),
        }
    }
}

/// Periodic progress observer whose lifetime is bound to one job.
///
/// Started right before submission; dropping it stops and joins the polling
/// thread, so every exit path of the job tears the poller down.
pub struct ProgressPoller {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressPoller {
    pub fn start<F>(
        cell: Arc<ProgressCell>,
        item: usize,
        interval: Duration,
        mut on_status: F,
    ) -> Self
    where
        F: FnMut(PageStatus) + Send + 'static,
    {
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);

        let spawned = std::thread::Builder::new()
            .name(format!("progress-{item}"))
            .spawn(move || {
                let mut last = None;
                loop {
                    let status = cell.status_for(item);
                    if last != Some(status) {
                        trace!("Page {item} status: {status}");
                        on_status(status);
                        last = Some(status);
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to start progress poller for page {item}: {e}");
                None
            }
        };

        Self {
            stop: Some(stop_tx),
            handle,
        }
    }

    /// Stop polling and wait for the poller thread to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Disconnecting the channel wakes the poller immediately
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn packing_round_trips_item_and_percent() {
        let packed = Progress::new(7, 42).encode();
        assert_eq!(packed >> 32, 7);
        assert_eq!(packed & 0xFFFF_FFFF, 42);
        assert_eq!(Progress::decode(packed), Progress::new(7, 42));
    }

    #[test]
    fn idle_progress_matches_no_item() {
        let idle = Progress::decode(Progress::IDLE.encode());
        assert_eq!(idle, Progress::IDLE);
        assert!(!idle.is_for(0));
    }

    #[test]
    fn status_is_queued_when_another_item_runs() {
        let cell = ProgressCell::new();
        cell.store(Progress::for_item(3, 80));
        assert_eq!(cell.status_for(3), PageStatus::Processing(80));
        assert_eq!(cell.status_for(4), PageStatus::Queued);
        cell.reset();
        assert_eq!(cell.status_for(3), PageStatus::Queued);
    }

    #[test]
    fn status_labels() {
        assert_eq!(PageStatus::Raw.to_string(), "RAW");
        assert_eq!(PageStatus::Queued.to_string(), "QUEUED");
        assert_eq!(PageStatus::Processing(42).to_string(), "PROCESSING: 42%");
        assert_eq!(PageStatus::Processed.to_string(), "PROCESSED");
    }

    #[test]
    fn poller_reports_changes_and_stops_on_drop() {
        let cell = Arc::new(ProgressCell::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let poller = ProgressPoller::start(cell.clone(), 5, Duration::from_millis(5), move |s| {
            sink.lock().unwrap().push(s);
        });

        std::thread::sleep(Duration::from_millis(30));
        cell.store(Progress::for_item(5, 50));
        std::thread::sleep(Duration::from_millis(30));
        drop(poller);

        let frozen = seen.lock().unwrap().clone();
        assert_eq!(frozen.first(), Some(&PageStatus::Queued));
        assert!(frozen.contains(&PageStatus::Processing(50)));

        // No more updates after the poller is gone
        cell.store(Progress::for_item(5, 90));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(*seen.lock().unwrap(), frozen);
    }
}
