//! Enhancement worker - the only thread that touches the engine

use std::sync::Arc;

use flume::Receiver;
use log::{debug, error, info, warn};

use super::cache::ImageEnhancementCache;
use super::engine::EngineAdapter;
use super::job::EnhancementJob;
use super::request::{CacheError, EnhanceFault, EnhanceRequest, JobOutcome};
use super::window::ReadingWindow;

/// Main worker loop - runs in a dedicated thread and executes jobs serially
#[expect(
    clippy::needless_pass_by_value,
    reason = "Values moved into thread, need ownership"
)]
pub fn enhancement_worker(
    mut adapter: EngineAdapter,
    requests: Receiver<EnhanceRequest>,
    cache: Arc<ImageEnhancementCache>,
    window: Arc<ReadingWindow>,
    staleness_tolerance: usize,
) {
    for request in requests.iter() {
        match request {
            EnhanceRequest::Process { job, reply } => {
                let item = job.item;
                let outcome = handle_job(&mut adapter, job, &cache, &window, staleness_tolerance);
                if reply.send(outcome).is_err() {
                    debug!("Submitter of page {item} went away before the result arrived");
                }
            }

            EnhanceRequest::Shutdown => break,
        }
    }
    debug!("Enhancement worker stopped");
}

fn handle_job(
    adapter: &mut EngineAdapter,
    job: EnhancementJob,
    cache: &ImageEnhancementCache,
    window: &ReadingWindow,
    staleness_tolerance: usize,
) -> JobOutcome {
    let EnhancementJob {
        item,
        collection,
        params,
        config_hash,
        image,
        cancel,
    } = job;

    if cancel.is_cancelled() {
        debug!("Page {item} cancelled before start");
        return JobOutcome::Dropped(EnhanceFault::Cancelled);
    }

    // The reader may have moved on while this job waited for the engine
    if !window.contains_with_slack(item, staleness_tolerance) {
        debug!(
            "Dropping page {item}: outside window at position {}",
            window.position()
        );
        return JobOutcome::Dropped(EnhanceFault::OutOfWindow);
    }

    let output = match adapter.run(item, image, &params, &cancel) {
        Ok(output) => output,
        Err(fault @ EnhanceFault::TooLarge { .. }) => {
            info!("Skipping page {item}: {fault}");
            return JobOutcome::Dropped(fault);
        }
        Err(EnhanceFault::Cancelled) => {
            debug!("Page {item} cancelled");
            return JobOutcome::Dropped(EnhanceFault::Cancelled);
        }
        Err(fault) => {
            warn!("Enhancement of page {item} failed: {fault}");
            return JobOutcome::Dropped(fault);
        }
    };

    // A finished result is valid for its key even if nobody wants it any more
    let cached = match cache.store(collection, item, &config_hash, &output) {
        Ok(path) => Some(path),
        Err(e) => {
            let fault = EnhanceFault::from(CacheError::from(e));
            error!("Page {item} enhanced but not cached: {fault}");
            None
        }
    };

    if cancel.is_cancelled() {
        debug!("Page {item} cancelled while running, result discarded");
        return JobOutcome::Dropped(EnhanceFault::Cancelled);
    }

    JobOutcome::Enhanced {
        image: output,
        cached,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enhance::cache::RetentionPolicy;
    use crate::enhance::engine::{InferenceEngine, RunContext};
    use crate::enhance::progress::ProgressCell;
    use crate::enhance::types::{CollectionId, EngineInit, EnhanceParams};
    use image::RgbaImage;
    use tempfile::TempDir;

    struct Doubler {
        fail: bool,
    }

    impl InferenceEngine for Doubler {
        fn initialize(&mut self, _init: &EngineInit) -> bool {
            true
        }

        fn run(&mut self, input: RgbaImage, _ctx: &RunContext<'_>) -> Option<RgbaImage> {
            if self.fail {
                return None;
            }
            let (w, h) = input.dimensions();
            Some(RgbaImage::new(w * 2, h * 2))
        }
    }

    fn fixture(fail: bool) -> (EngineAdapter, ImageEnhancementCache, ReadingWindow, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache =
            ImageEnhancementCache::new(temp_dir.path().to_path_buf(), RetentionPolicy::default());
        let adapter = EngineAdapter::new(Box::new(Doubler { fail }), Arc::new(ProgressCell::new()));
        (adapter, cache, ReadingWindow::new(4), temp_dir)
    }

    fn job(item: usize) -> EnhancementJob {
        EnhancementJob::new(
            item,
            RgbaImage::new(4, 4),
            EnhanceParams::default(),
            CollectionId::new(1),
            "hash",
        )
    }

    #[test]
    fn success_is_cached() {
        let (mut adapter, cache, window, _dir) = fixture(false);
        let outcome = handle_job(&mut adapter, job(2), &cache, &window, 0);
        match outcome {
            JobOutcome::Enhanced { image, cached } => {
                assert_eq!(image.dimensions(), (8, 8));
                assert_eq!(cached, cache.get_cached_image(CollectionId::new(1), 2, "hash"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn engine_failure_writes_nothing() {
        let (mut adapter, cache, window, _dir) = fixture(true);
        let outcome = handle_job(&mut adapter, job(2), &cache, &window, 0);
        assert!(matches!(outcome, JobOutcome::Dropped(EnhanceFault::EngineFailed)));
        assert!(cache.get_cached_image(CollectionId::new(1), 2, "hash").is_none());
    }

    #[test]
    fn stale_job_is_dropped_unless_tolerated() {
        let (mut adapter, cache, window, _dir) = fixture(false);
        window.set_position(5);

        let outcome = handle_job(&mut adapter, job(4), &cache, &window, 0);
        assert!(matches!(outcome, JobOutcome::Dropped(EnhanceFault::OutOfWindow)));

        let outcome = handle_job(&mut adapter, job(4), &cache, &window, 1);
        assert!(outcome.is_enhanced());
    }

    #[test]
    fn cache_failure_still_hands_back_image() {
        let (mut adapter, _, window, dir) = fixture(false);
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let cache = ImageEnhancementCache::new(blocker, RetentionPolicy::default());

        let outcome = handle_job(&mut adapter, job(1), &cache, &window, 0);
        match outcome {
            JobOutcome::Enhanced { image, cached } => {
                assert!(cached.is_none());
                assert_eq!(image.dimensions(), (8, 8));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
