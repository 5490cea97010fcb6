//! Worker messages, faults and job outcomes

use std::path::PathBuf;

use flume::Sender;
use image::RgbaImage;

use super::job::EnhancementJob;
use super::types::ModelVariant;

/// Request sent to the enhancement worker
#[derive(Debug)]
pub enum EnhanceRequest {
    /// Run one job and send the outcome back on `reply`
    Process {
        job: EnhancementJob,
        reply: Sender<JobOutcome>,
    },

    /// Stop the worker after the current job
    Shutdown,
}

/// Cache failures carried across the worker boundary
#[derive(Debug, thiserror::Error)]
#[error("{detail}")]
pub struct CacheError {
    detail: String,
}

impl CacheError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Why a job produced no result
#[derive(Debug, thiserror::Error)]
pub enum EnhanceFault {
    #[error("page left the reading window")]
    OutOfWindow,

    #[error("input {width}x{height} exceeds limit {max_width}x{max_height}")]
    TooLarge {
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
    },

    #[error("{} engine is not initialized", .0.as_str())]
    NotInitialized(ModelVariant),

    #[error("engine returned no output")]
    EngineFailed,

    #[error("job was cancelled")]
    Cancelled,

    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    #[error("enhancement worker is not running")]
    WorkerGone,
}

/// Result of a job as seen by the consumer
#[derive(Debug)]
pub enum JobOutcome {
    /// The engine produced `image`; `cached` is `None` when persisting failed
    Enhanced {
        image: RgbaImage,
        cached: Option<PathBuf>,
    },

    /// No result. The consumer keeps showing the original page.
    Dropped(EnhanceFault),
}

impl JobOutcome {
    /// Collapse to "result or nothing", the only distinction callers act on
    #[must_use]
    pub fn into_image(self) -> Option<RgbaImage> {
        match self {
            JobOutcome::Enhanced { image, .. } => Some(image),
            JobOutcome::Dropped(_) => None,
        }
    }

    #[must_use]
    pub fn is_enhanced(&self) -> bool {
        matches!(self, JobOutcome::Enhanced { .. })
    }
}
