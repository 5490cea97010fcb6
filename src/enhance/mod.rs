//! Background page enhancement

mod cache;
mod engine;
mod job;
mod progress;
mod queue;
mod request;
mod session;
mod types;
mod window;
mod worker;

pub use cache::{ImageEnhancementCache, RetentionPolicy, config_hash, full_config_hash};
pub use engine::{EngineAdapter, InferenceEngine, ResampleEngine, RunContext, fast_resize};
pub use job::{CancellationHandle, EnhancementJob};
pub use progress::{PageStatus, Progress, ProgressCell, ProgressPoller};
pub use queue::{EnhancementQueue, QueueConfig};
pub use request::{CacheError, EnhanceFault, JobOutcome};
pub use session::{EnhancedPage, PageEnhancer, PageEvent, SessionConfig, Submission};
pub use types::*;
pub use window::{DEFAULT_PRELOAD_DISTANCE, ReadingWindow};
