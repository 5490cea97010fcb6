//! On-disk cache of enhanced pages
//!
//! One PNG per `(collection, item, config hash)`:
//! `<root>/<collection>/<item:06>_<hash>.png`. The layout is stable across
//! restarts and distinct hashes never share a file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use image::{ImageFormat, RgbaImage};
use log::{debug, warn};

use super::types::{CollectionId, EnhanceParams, ModelVariant};

const APP_NAME: &str = "page-enhancer";
const RESULT_EXTENSION: &str = "png";
const TEMP_EXTENSION: &str = "tmp";

/// Eviction policy around the reading position
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Items kept behind the reference index
    pub behind: usize,
    /// Items kept ahead of the reference index
    pub ahead: usize,
    /// Sweep on every Nth item instead of every access
    pub sweep_every: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            behind: 5,
            ahead: 20,
            sweep_every: 5,
        }
    }
}

impl RetentionPolicy {
    #[must_use]
    pub fn retains(&self, item: usize, reference: usize) -> bool {
        item >= reference.saturating_sub(self.behind)
            && item <= reference.saturating_add(self.ahead)
    }
}

/// Digest of the parameters that affect output pixels, before the model and
/// size-limit suffix is appended.
#[must_use]
pub fn config_hash(noise_level: i32, scale: u32, input_scale: u32) -> String {
    let canonical = format!("n{noise_level}_s{scale}_i{input_scale}");
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

/// Full cache key for a parameter set
#[must_use]
pub fn full_config_hash(
    noise_level: i32,
    scale: u32,
    input_scale: u32,
    model: ModelVariant,
    max_width: u32,
    max_height: u32,
) -> String {
    format!(
        "{}_m{}_w{max_width}_h{max_height}",
        config_hash(noise_level, scale, input_scale),
        model.id()
    )
}

impl EnhanceParams {
    #[must_use]
    pub fn config_hash(&self) -> String {
        full_config_hash(
            self.noise_level,
            self.scale,
            self.input_scale,
            self.model,
            self.max_width,
            self.max_height,
        )
    }
}

pub struct ImageEnhancementCache {
    root: PathBuf,
    retention: RetentionPolicy,
    initialized: Mutex<bool>,
}

impl ImageEnhancementCache {
    #[must_use]
    pub fn new(root: PathBuf, retention: RetentionPolicy) -> Self {
        Self {
            root,
            retention,
            initialized: Mutex::new(false),
        }
    }

    /// Cache under the platform cache directory
    pub fn in_user_cache_dir(retention: RetentionPolicy) -> Result<Self> {
        let root = dirs::cache_dir()
            .context("Could not determine cache directory")?
            .join(APP_NAME)
            .join("enhanced");
        Ok(Self::new(root, retention))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Create the storage root. Safe to call any number of times.
    pub fn init(&self) -> Result<()> {
        let mut initialized = self
            .initialized
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *initialized {
            return Ok(());
        }

        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create cache directory: {:?}", self.root))?;
        debug!("Enhancement cache ready at {:?}", self.root);
        *initialized = true;
        Ok(())
    }

    fn collection_dir(&self, collection: CollectionId) -> PathBuf {
        self.root.join(collection.to_string())
    }

    /// Where the result for a key lives, whether or not it exists yet
    #[must_use]
    pub fn entry_path(&self, collection: CollectionId, item: usize, config_hash: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{item:06}_{config_hash}.{RESULT_EXTENSION}"))
    }

    /// Path of the cached result, `None` on a miss
    #[must_use]
    pub fn get_cached_image(
        &self,
        collection: CollectionId,
        item: usize,
        config_hash: &str,
    ) -> Option<PathBuf> {
        let path = self.entry_path(collection, item, config_hash);
        path.is_file().then_some(path)
    }

    /// Persist a result, replacing any previous file for the key.
    ///
    /// Encodes to a sibling temp file and renames it over the final path, so
    /// readers see either the old file or the new one.
    pub fn store(
        &self,
        collection: CollectionId,
        item: usize,
        config_hash: &str,
        image: &RgbaImage,
    ) -> Result<PathBuf> {
        self.init()?;

        let path = self.entry_path(collection, item, config_hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {parent:?}"))?;
        }

        let temp = path.with_extension(TEMP_EXTENSION);
        let written = image
            .save_with_format(&temp, ImageFormat::Png)
            .with_context(|| format!("Failed to encode result: {temp:?}"))
            .and_then(|()| {
                fs::rename(&temp, &path)
                    .with_context(|| format!("Failed to move result into place: {path:?}"))
            });

        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        debug!("Cached page {item} of collection {collection} at {path:?}");
        Ok(path)
    }

    /// Whether `item` should trigger a sweep
    #[must_use]
    pub fn should_sweep(&self, item: usize) -> bool {
        self.retention.sweep_every > 0 && item % self.retention.sweep_every == 0
    }

    /// Remove this collection's entries outside the retention window around
    /// `reference`. Returns how many files were removed.
    ///
    /// Temp files inside the window are left alone; the worker may be writing
    /// one of them right now.
    pub fn clear_old_cache(&self, collection: CollectionId, reference: usize) -> Result<usize> {
        let dir = self.collection_dir(collection);
        if !dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in
            fs::read_dir(&dir).with_context(|| format!("Failed to read cache directory: {dir:?}"))?
        {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }

            let stale = parse_entry(&path)
                .is_some_and(|entry| !self.retention.retains(entry.item, reference));

            if stale {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to evict cached page {path:?}: {e}"),
                }
            }
        }

        if removed > 0 {
            debug!(
                "Evicted {removed} cached pages of collection {collection} around page {reference}"
            );
        }
        Ok(removed)
    }

    /// Remove every entry of one collection
    pub fn clear_collection(&self, collection: CollectionId) -> Result<()> {
        let dir = self.collection_dir(collection);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove cache directory: {dir:?}"))?;
        }
        Ok(())
    }

    /// Remove the whole cache; `init` recreates the root on next use
    pub fn clear_all(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)
                .with_context(|| format!("Failed to remove cache directory: {:?}", self.root))?;
        }
        *self
            .initialized
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
        Ok(())
    }

    /// Item indices cached for a collection, sorted
    pub fn cached_items(&self, collection: CollectionId) -> Result<Vec<usize>> {
        let dir = self.collection_dir(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut items = Vec::new();
        for entry in fs::read_dir(&dir)? {
            if let Some(ParsedEntry { item, temp: false }) = parse_entry(&entry?.path()) {
                items.push(item);
            }
        }
        items.sort_unstable();
        Ok(items)
    }
}

struct ParsedEntry {
    item: usize,
    temp: bool,
}

fn parse_entry(path: &Path) -> Option<ParsedEntry> {
    let temp = match path.extension()?.to_str()? {
        RESULT_EXTENSION => false,
        TEMP_EXTENSION => true,
        _ => return None,
    };
    let stem = path.file_stem()?.to_str()?;
    let (item, _hash) = stem.split_once('_')?;
    Some(ParsedEntry {
        item: item.parse().ok()?,
        temp,
    })
}
