//! page-enhancer command line front end
//!
//! Drives the enhancement services the way a page viewer would: pages of a
//! directory are read in order, the reading window slides forward and pages
//! ahead of the reader are enhanced in the background.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, error, info, warn};
use simplelog::{Config, LevelFilter, WriteLogger};

use page_enhancer::enhance::{
    CollectionId, EnhancedPage, EnhancementQueue, PageEnhancer, PageEvent, ReadingWindow,
    ResampleEngine, Submission,
};
use page_enhancer::panic_handler;
use page_enhancer::settings::Settings;

const PAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "tif", "tiff"];
const PAGE_RESULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "page-enhancer")]
#[command(version)]
#[command(about = "Upscale the pages of an image collection ahead of the reader")]
struct Cli {
    /// Settings file (default: <config dir>/page-enhancer/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "page-enhancer.log")]
    log_file: PathBuf,

    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a directory of page images in order, enhancing ahead of the reader
    Enhance {
        dir: PathBuf,
        #[arg(long)]
        collection: u64,
        /// Page to start reading at
        #[arg(long, default_value_t = 0)]
        start: usize,
    },
    /// Print the cache key of the current settings
    Hash,
    /// Evict cached results of a collection, or of everything with --all
    Clear {
        #[arg(long, required_unless_present = "all", conflicts_with = "all")]
        collection: Option<u64>,
        /// Keep the retention window around this page instead of purging
        #[arg(long, requires = "collection")]
        reference: Option<usize>,
        /// Remove every cached result of every collection
        #[arg(long)]
        all: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// What the reader ends up seeing for a page
enum PageResult {
    Cached(PathBuf),
    Uncached,
    Original,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    WriteLogger::init(
        cli.log_level.into(),
        Config::default(),
        File::create(&cli.log_file)
            .with_context(|| format!("Failed to create log file {:?}", cli.log_file))?,
    )?;
    panic_handler::initialize_panic_handler();

    info!("Starting page-enhancer");
    let settings = Settings::load(cli.config.as_deref());

    let result = match cli.command {
        Commands::Enhance {
            dir,
            collection,
            start,
        } => run_enhance(&settings, &dir, CollectionId::new(collection), start),
        Commands::Hash => {
            let params = settings.enhance_params();
            println!(
                "{} ({}, noise {}, scale {}, input {}%)",
                params.config_hash(),
                params.model.as_str(),
                params.noise_level,
                params.effective_scale(),
                params.input_scale
            );
            Ok(())
        }
        Commands::Clear {
            collection,
            reference,
            all,
        } => run_clear(&settings, collection.map(CollectionId::new), reference, all),
    };

    if let Err(e) = &result {
        error!("Command failed: {e:#}");
    }
    info!("Shutting down page-enhancer");
    result
}

fn run_clear(
    settings: &Settings,
    collection: Option<CollectionId>,
    reference: Option<usize>,
    all: bool,
) -> Result<()> {
    let cache = settings.cache()?;
    match (collection, reference) {
        (Some(collection), Some(reference)) => {
            let removed = cache.clear_old_cache(collection, reference)?;
            println!("Removed {removed} cached pages of collection {collection}");
        }
        (Some(collection), None) => {
            cache.clear_collection(collection)?;
            println!("Purged collection {collection}");
        }
        (None, _) if all => {
            cache.clear_all()?;
            println!("Purged every collection under {:?}", cache.root());
        }
        (None, _) => bail!("Either --collection or --all is required"),
    }
    Ok(())
}

fn run_enhance(
    settings: &Settings,
    dir: &Path,
    collection: CollectionId,
    start: usize,
) -> Result<()> {
    let pages = list_pages(dir)?;
    if pages.is_empty() {
        bail!("No page images found in {dir:?}");
    }
    if start >= pages.len() {
        bail!("Start page {start} is past the last page {}", pages.len() - 1);
    }
    info!(
        "Enhancing {} pages of {dir:?} as collection {collection}",
        pages.len()
    );

    let cache = Arc::new(settings.cache()?);
    let window = Arc::new(ReadingWindow::new(settings.preload_distance()));
    let queue = EnhancementQueue::spawn(
        Box::new(ResampleEngine::new()),
        Arc::clone(&cache),
        Arc::clone(&window),
        settings.queue_config(),
    )?;
    let enhancer = PageEnhancer::new(
        Arc::new(queue),
        cache,
        collection,
        settings.enhance_params(),
        settings.session_config(),
    );

    let mut submitted = HashSet::new();
    let mut results: HashMap<usize, PageResult> = HashMap::new();

    for position in start..pages.len() {
        enhancer.set_reading_position(position);

        for item in position..=last_preloaded(position, window.preload(), pages.len()) {
            if !submitted.insert(item) {
                continue;
            }
            let image = match image::open(&pages[item]) {
                Ok(image) => image.to_rgba8(),
                Err(e) => {
                    warn!("Failed to decode {:?}: {e}", pages[item]);
                    results.insert(item, PageResult::Original);
                    continue;
                }
            };
            match enhancer.submit_page(item, image) {
                Submission::CacheHit(path) => {
                    results.insert(item, PageResult::Cached(path));
                }
                Submission::Scheduled(_) => {}
                Submission::Disabled | Submission::Skipped => {
                    results.insert(item, PageResult::Original);
                }
            }
        }

        while !results.contains_key(&position) {
            match enhancer.events().recv_timeout(PAGE_RESULT_TIMEOUT) {
                Ok(PageEvent::Status { item, status }) => debug!("Page {item}: {status}"),
                Ok(PageEvent::Enhanced { item, page }) => {
                    let result = match page {
                        EnhancedPage::Cached(path) => PageResult::Cached(path),
                        EnhancedPage::Raw(_) => PageResult::Uncached,
                    };
                    results.insert(item, result);
                }
                Ok(PageEvent::Unchanged { item }) => {
                    results.insert(item, PageResult::Original);
                }
                Err(e) => {
                    warn!("Gave up waiting for page {position}: {e}");
                    results.insert(position, PageResult::Original);
                }
            }
        }

        let name = pages[position]
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let shown = match results.remove(&position) {
            Some(PageResult::Cached(path)) => path.display().to_string(),
            Some(PageResult::Uncached) => "enhanced, not cached".to_string(),
            Some(PageResult::Original) | None => "original".to_string(),
        };
        println!("{position:>5}  {name}  ->  {shown}");
    }

    enhancer.shutdown();
    enhancer.queue().shutdown();
    Ok(())
}

/// Last page to submit while reading `position` of `len` pages
fn last_preloaded(position: usize, preload: usize, len: usize) -> usize {
    position.saturating_add(preload).min(len.saturating_sub(1))
}

/// Page images of `dir` in reading order
fn list_pages(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pages: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {dir:?}"))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| PAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    pages.sort();
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("page-enhancer").chain(args.iter().copied()))
    }

    #[test]
    fn preload_stops_at_the_last_page() {
        assert_eq!(last_preloaded(3, 4, 20), 7);
        assert_eq!(last_preloaded(18, 4, 20), 19);
        assert_eq!(last_preloaded(5, usize::MAX, 20), 19);
    }

    #[test]
    fn clear_needs_a_collection_or_all() {
        assert!(parse(&["clear"]).is_err());
        assert!(parse(&["clear", "--all", "--collection", "3"]).is_err());
        assert!(parse(&["clear", "--all", "--reference", "3"]).is_err());

        let Commands::Clear { collection, all, .. } = parse(&["clear", "--all"]).unwrap().command
        else {
            panic!("expected clear");
        };
        assert_eq!(collection, None);
        assert!(all);
    }

    #[test]
    fn clear_all_purges_every_collection() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.cache_dir = Some(dir.path().join("enhanced"));
        let cache = settings.cache().unwrap();
        let hash = settings.enhance_params().config_hash();
        let page = image::RgbaImage::new(2, 2);
        for collection in [1, 2] {
            cache.store(CollectionId::new(collection), 0, &hash, &page).unwrap();
        }

        run_clear(&settings, None, None, true).unwrap();

        assert!(!dir.path().join("enhanced").exists());
    }
}
