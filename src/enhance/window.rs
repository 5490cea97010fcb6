//! Reading window shared between the viewer thread and the worker

use std::sync::atomic::{AtomicUsize, Ordering};

/// Default preload distance when enhancement is disabled
pub const DEFAULT_PRELOAD_DISTANCE: usize = 4;

/// Current reading position plus how far ahead work is admitted.
///
/// Written from the viewer, read from the worker. Readers see a recent value,
/// not necessarily the latest one.
#[derive(Debug)]
pub struct ReadingWindow {
    position: AtomicUsize,
    preload: AtomicUsize,
}

impl Default for ReadingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_PRELOAD_DISTANCE)
    }
}

impl ReadingWindow {
    #[must_use]
    pub fn new(preload: usize) -> Self {
        Self {
            position: AtomicUsize::new(0),
            preload: AtomicUsize::new(preload),
        }
    }

    pub fn position(&self) -> usize {
        self.position.load(Ordering::Relaxed)
    }

    pub fn set_position(&self, position: usize) {
        self.position.store(position, Ordering::Relaxed);
    }

    pub fn preload(&self) -> usize {
        self.preload.load(Ordering::Relaxed)
    }

    pub fn set_preload(&self, preload: usize) {
        self.preload.store(preload, Ordering::Relaxed);
    }

    /// True iff `item` lies in `[position, position + preload]`
    pub fn contains(&self, item: usize) -> bool {
        self.contains_with_slack(item, 0)
    }

    /// Like [`contains`](Self::contains), but tolerates items up to `slack`
    /// positions behind the reader.
    pub fn contains_with_slack(&self, item: usize, slack: usize) -> bool {
        let position = self.position();
        let horizon = position.saturating_add(self.preload());
        item.saturating_add(slack) >= position && item <= horizon
    }

    /// True iff the reader has moved past `item`
    pub fn is_behind(&self, item: usize) -> bool {
        item < self.position()
    }
}
