//! Units of work and their cancellation handles

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use image::RgbaImage;

use super::types::{CollectionId, EnhanceParams};

/// Shared flag telling a job to stop.
///
/// Cloned between the submitter, the queue's registry and the worker. Each job
/// gets its own handle, so cancelling one page never touches another's job.
#[derive(Clone, Debug, Default)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// True if both handles control the same job
    pub fn same_job(&self, other: &CancellationHandle) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

/// One page to enhance. Owns the decoded input; it is released when the job
/// is dropped, whichever way the job ends.
#[derive(Debug)]
pub struct EnhancementJob {
    pub item: usize,
    pub collection: CollectionId,
    pub params: EnhanceParams,
    pub config_hash: String,
    pub image: RgbaImage,
    pub cancel: CancellationHandle,
}

impl EnhancementJob {
    #[must_use]
    pub fn new(
        item: usize,
        image: RgbaImage,
        params: EnhanceParams,
        collection: CollectionId,
        config_hash: impl Into<String>,
    ) -> Self {
        Self {
            item,
            collection,
            params,
            config_hash: config_hash.into(),
            image,
            cancel: CancellationHandle::new(),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}
