use image::{Rgba, RgbaImage};
use page_enhancer::enhance::{
    CollectionId, EnhanceParams, ImageEnhancementCache, ModelVariant, RetentionPolicy,
    config_hash,
};
use tempfile::TempDir;

fn cache(dir: &TempDir) -> ImageEnhancementCache {
    ImageEnhancementCache::new(dir.path().to_path_buf(), RetentionPolicy::default())
}

fn tile(seed: u8) -> RgbaImage {
    RgbaImage::from_pixel(3, 3, Rgba([seed, 0, 0, 255]))
}

#[test]
fn test_clear_old_cache_keeps_window_and_other_collections() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir);
    let book = CollectionId::new(1);
    let other = CollectionId::new(2);
    let hash = EnhanceParams::default().config_hash();

    for item in [0, 4, 5, 30, 50, 51] {
        cache.store(book, item, &hash, &tile(item as u8)).unwrap();
    }
    cache.store(other, 0, &hash, &tile(0)).unwrap();
    cache.store(other, 99, &hash, &tile(99)).unwrap();

    // Retention around 30 is [25, 50]
    let removed = cache.clear_old_cache(book, 30).unwrap();

    assert_eq!(removed, 4);
    assert_eq!(cache.cached_items(book).unwrap(), vec![30, 50]);
    assert_eq!(cache.cached_items(other).unwrap(), vec![0, 99]);
}

#[test]
fn test_clear_old_cache_spares_temp_files_in_window() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir);
    let book = CollectionId::new(3);
    let hash = EnhanceParams::default().config_hash();

    let kept = cache.store(book, 10, &hash, &tile(1)).unwrap();
    let writing = kept.with_extension("tmp");
    let abandoned = cache.entry_path(book, 1, &hash).with_extension("tmp");
    std::fs::write(&writing, b"partial").unwrap();
    std::fs::write(&abandoned, b"partial").unwrap();

    assert_eq!(cache.clear_old_cache(book, 10).unwrap(), 1);

    assert!(kept.exists());
    assert!(writing.exists());
    assert!(!abandoned.exists());
}

#[test]
fn test_every_parameter_changes_the_hash() {
    let base = EnhanceParams::default();
    let variants = [
        EnhanceParams {
            model: ModelVariant::RealEsrgan,
            ..base
        },
        EnhanceParams {
            noise_level: 1,
            ..base
        },
        EnhanceParams { scale: 4, ..base },
        EnhanceParams {
            input_scale: 50,
            ..base
        },
        EnhanceParams {
            max_width: 1024,
            ..base
        },
        EnhanceParams {
            max_height: 1024,
            ..base
        },
    ];

    let dir = TempDir::new().unwrap();
    let cache = cache(&dir);
    let book = CollectionId::new(1);
    cache.store(book, 0, &base.config_hash(), &tile(0)).unwrap();

    for changed in variants {
        assert_ne!(changed.config_hash(), base.config_hash(), "{changed:?}");
        assert!(cache.get_cached_image(book, 0, &changed.config_hash()).is_none());
    }
    assert!(cache.get_cached_image(book, 0, &base.config_hash()).is_some());
}

#[test]
fn test_hash_is_stable() {
    assert_eq!(config_hash(0, 2, 100), config_hash(0, 2, 100));
    assert_eq!(config_hash(0, 2, 100).len(), 32);
    assert!(
        EnhanceParams::default()
            .config_hash()
            .ends_with("_m0_w2048_h2048")
    );
}

#[test]
fn test_results_survive_reopening() {
    let dir = TempDir::new().unwrap();
    let hash = EnhanceParams::default().config_hash();
    let book = CollectionId::new(8);

    let stored = cache(&dir).store(book, 12, &hash, &tile(200)).unwrap();

    let reopened = cache(&dir);
    reopened.init().unwrap();
    let path = reopened.get_cached_image(book, 12, &hash).unwrap();
    assert_eq!(path, stored);
    assert_eq!(image::open(&path).unwrap().to_rgba8(), tile(200));
}

#[test]
fn test_store_overwrites_in_place() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir);
    let hash = EnhanceParams::default().config_hash();
    let book = CollectionId::new(1);

    cache.store(book, 1, &hash, &tile(1)).unwrap();
    let path = cache.store(book, 1, &hash, &tile(2)).unwrap();

    let files = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
    assert_eq!(files, 1);
    assert_eq!(image::open(&path).unwrap().to_rgba8(), tile(2));
}

#[test]
fn test_clear_all_then_reuse() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("enhanced");
    let cache = ImageEnhancementCache::new(root.clone(), RetentionPolicy::default());
    let hash = EnhanceParams::default().config_hash();

    cache.store(CollectionId::new(1), 0, &hash, &tile(0)).unwrap();
    cache.clear_all().unwrap();
    assert!(!root.exists());

    cache.store(CollectionId::new(1), 0, &hash, &tile(0)).unwrap();
    assert!(cache.get_cached_image(CollectionId::new(1), 0, &hash).is_some());
}
