use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;
use page_enhancer::enhance::{
    CollectionId, EngineInit, EnhanceParams, EnhancedPage, EnhancementQueue,
    ImageEnhancementCache, InferenceEngine, PageEnhancer, PageEvent, QueueConfig,
    ReadingWindow, RetentionPolicy, RunContext, SessionConfig, Submission,
};
use tempfile::TempDir;

/// Waits for a permit before every run
struct GatedEngine {
    entered: flume::Sender<usize>,
    gate: flume::Receiver<()>,
}

impl InferenceEngine for GatedEngine {
    fn initialize(&mut self, _init: &EngineInit) -> bool {
        true
    }

    fn run(&mut self, input: RgbaImage, ctx: &RunContext<'_>) -> Option<RgbaImage> {
        let _ = self.entered.send(ctx.item);
        let _ = self.gate.recv();
        Some(input)
    }
}

struct Fixture {
    enhancer: PageEnhancer,
    entered: flume::Receiver<usize>,
    gate: flume::Sender<()>,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let (entered_tx, entered_rx) = flume::unbounded();
    let (gate_tx, gate_rx) = flume::unbounded();

    let cache = Arc::new(ImageEnhancementCache::new(
        dir.path().to_path_buf(),
        RetentionPolicy::default(),
    ));
    let queue = EnhancementQueue::spawn(
        Box::new(GatedEngine {
            entered: entered_tx,
            gate: gate_rx,
        }),
        Arc::clone(&cache),
        Arc::new(ReadingWindow::new(4)),
        QueueConfig::default(),
    )
    .unwrap();
    let config = SessionConfig {
        show_status: false,
        ..SessionConfig::default()
    };
    let enhancer = PageEnhancer::new(
        Arc::new(queue),
        cache,
        CollectionId::new(5),
        EnhanceParams::default(),
        config,
    );

    Fixture {
        enhancer,
        entered: entered_rx,
        gate: gate_tx,
        _dir: dir,
    }
}

fn next_event(enhancer: &PageEnhancer) -> PageEvent {
    enhancer
        .events()
        .recv_timeout(Duration::from_secs(10))
        .unwrap()
}

#[test]
fn test_resubmission_supersedes_running_job() {
    let f = fixture();

    let first = match f.enhancer.submit_page(1, RgbaImage::new(4, 4)) {
        Submission::Scheduled(handle) => handle,
        other => panic!("expected scheduling, got {other:?}"),
    };
    assert_eq!(f.entered.recv_timeout(Duration::from_secs(5)).unwrap(), 1);

    assert!(matches!(
        f.enhancer.submit_page(1, RgbaImage::new(4, 4)),
        Submission::Scheduled(_)
    ));
    assert!(first.is_cancelled());

    f.gate.send(()).unwrap();
    assert!(matches!(
        next_event(&f.enhancer),
        PageEvent::Unchanged { item: 1 }
    ));

    // The replacement job runs once the engine is free
    assert_eq!(f.entered.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    f.gate.send(()).unwrap();
    match next_event(&f.enhancer) {
        PageEvent::Enhanced {
            item: 1,
            page: EnhancedPage::Cached(path),
        } => assert!(path.exists()),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn test_moving_past_a_waiting_page_drops_it() {
    let f = fixture();

    f.enhancer.submit_page(0, RgbaImage::new(4, 4));
    assert_eq!(f.entered.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    f.enhancer.submit_page(2, RgbaImage::new(4, 4));

    f.enhancer.set_reading_position(3);
    f.gate.send(()).unwrap();

    let mut results = Vec::new();
    while results.len() < 2 {
        match next_event(&f.enhancer) {
            PageEvent::Enhanced { item, .. } => results.push((item, true)),
            PageEvent::Unchanged { item } => results.push((item, false)),
            PageEvent::Status { .. } => {}
        }
    }
    results.sort_unstable();
    assert_eq!(results, vec![(0, true), (2, false)]);
    assert!(f.entered.try_recv().is_err());
}

#[test]
fn test_shutdown_cancels_pending_pages() {
    let f = fixture();

    f.enhancer.submit_page(0, RgbaImage::new(4, 4));
    assert_eq!(f.entered.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
    let waiting = match f.enhancer.submit_page(1, RgbaImage::new(4, 4)) {
        Submission::Scheduled(handle) => handle,
        other => panic!("expected scheduling, got {other:?}"),
    };

    std::thread::scope(|s| {
        s.spawn(|| f.enhancer.shutdown());
        while !waiting.is_cancelled() {
            std::thread::sleep(Duration::from_millis(1));
        }
        f.gate.send(()).unwrap();
    });

    assert_eq!(f.enhancer.queue().pending_jobs(), 0);
    assert!(f.entered.try_recv().is_err());
}
