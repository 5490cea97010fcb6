//! Boundary to the inference engine
//!
//! The engine itself is opaque: it is initialized for one model variant,
//! then runs one blocking inference at a time. [`EngineAdapter`] owns the
//! engine, translates queue parameters into init calls, enforces the input
//! size ceiling and applies the optional pre-downscale.

use std::num::NonZeroU32;
use std::sync::Arc;

use anyhow::{Context, Result};
use fast_image_resize as fr;
use image::{RgbaImage, imageops};
use log::{debug, info, warn};

use super::job::CancellationHandle;
use super::progress::{Progress, ProgressCell};
use super::request::EnhanceFault;
use super::types::{EngineInit, EnhanceParams};

/// Per-run view the engine gets of its job
pub struct RunContext<'a> {
    pub item: usize,
    pub scale: u32,
    cancel: &'a CancellationHandle,
    progress: &'a ProgressCell,
}

impl<'a> RunContext<'a> {
    pub fn new(
        item: usize,
        scale: u32,
        cancel: &'a CancellationHandle,
        progress: &'a ProgressCell,
    ) -> Self {
        Self {
            item,
            scale,
            cancel,
            progress,
        }
    }

    pub fn report(&self, percent: i32) {
        self.progress.store(Progress::for_item(self.item, percent));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Single-consumer upscaling engine.
///
/// Not reentrant: the queue guarantees `run` is never entered twice at once.
pub trait InferenceEngine: Send {
    /// Load the model for `init`. Returns false if it could not be loaded.
    fn initialize(&mut self, init: &EngineInit) -> bool;

    /// Consume `input` and return the upscaled image, or `None` on failure
    fn run(&mut self, input: RgbaImage, ctx: &RunContext<'_>) -> Option<RgbaImage>;
}

/// Resets the shared progress to idle when the run ends, however it ends
struct ProgressScope<'a>(&'a ProgressCell);

impl Drop for ProgressScope<'_> {
    fn drop(&mut self) {
        self.0.reset();
    }
}

pub struct EngineAdapter {
    engine: Box<dyn InferenceEngine>,
    active: Option<EngineInit>,
    progress: Arc<ProgressCell>,
}

impl EngineAdapter {
    pub fn new(engine: Box<dyn InferenceEngine>, progress: Arc<ProgressCell>) -> Self {
        Self {
            engine,
            active: None,
            progress,
        }
    }

    pub fn progress(&self) -> &Arc<ProgressCell> {
        &self.progress
    }

    /// Re-initialize only when the variant or its parameters changed
    pub fn ensure_initialized(&mut self, init: EngineInit) -> bool {
        if self.active == Some(init) {
            return true;
        }

        self.active = None;
        if self.engine.initialize(&init) {
            info!("Initialized {} engine: {init:?}", init.variant().as_str());
            self.active = Some(init);
            true
        } else {
            warn!("Failed to initialize {} engine: {init:?}", init.variant().as_str());
            false
        }
    }

    /// Size ceiling first, then the optional pre-downscale.
    /// An oversized page is skipped outright, never shrunk to fit.
    pub fn prepare(
        &self,
        image: RgbaImage,
        params: &EnhanceParams,
    ) -> Result<RgbaImage, EnhanceFault> {
        let (width, height) = image.dimensions();
        if params.exceeds_size_limit(width, height) {
            return Err(EnhanceFault::TooLarge {
                width,
                height,
                max_width: params.max_width,
                max_height: params.max_height,
            });
        }

        if params.input_scale == 0 || params.input_scale >= 100 {
            return Ok(image);
        }

        let new_width = percent_of(width, params.input_scale);
        let new_height = percent_of(height, params.input_scale);
        debug!("Pre-scaling input: {width}x{height} -> {new_width}x{new_height}");

        match fast_resize(&image, new_width, new_height) {
            Ok(scaled) => Ok(scaled),
            Err(e) => {
                warn!("Pre-scaling failed, using full-size input: {e:#}");
                Ok(image)
            }
        }
    }

    /// Run one job through the engine. Blocking; call from the worker only.
    pub fn run(
        &mut self,
        item: usize,
        image: RgbaImage,
        params: &EnhanceParams,
        cancel: &CancellationHandle,
    ) -> Result<RgbaImage, EnhanceFault> {
        let input = self.prepare(image, params)?;

        if !self.ensure_initialized(params.engine_init()) {
            return Err(EnhanceFault::NotInitialized(params.model));
        }

        if cancel.is_cancelled() {
            return Err(EnhanceFault::Cancelled);
        }

        let progress = Arc::clone(&self.progress);
        let _scope = ProgressScope(&progress);
        progress.store(Progress::for_item(item, 0));

        let ctx = RunContext::new(item, params.effective_scale(), cancel, &progress);
        self.engine.run(input, &ctx).ok_or(EnhanceFault::EngineFailed)
    }
}

/// `percent` of `value`, at least 1. Never larger than `value` for
/// percentages below 100.
fn percent_of(value: u32, percent: u32) -> u32 {
    let scaled = u64::from(value) * u64::from(percent) / 100;
    u32::try_from(scaled).unwrap_or(u32::MAX).max(1)
}

/// Output size of an upscale, `None` if it does not fit an RGBA buffer
fn scaled_dimensions(width: u32, height: u32, scale: u32) -> Option<(u32, u32)> {
    let out_width = width.checked_mul(scale)?;
    let out_height = height.checked_mul(scale)?;
    let bytes = u64::from(out_width)
        .checked_mul(u64::from(out_height))?
        .checked_mul(4)?;
    usize::try_from(bytes).ok()?;
    Some((out_width, out_height))
}

/// Lanczos3 resize of an RGBA image
pub fn fast_resize(src: &RgbaImage, new_width: u32, new_height: u32) -> Result<RgbaImage> {
    let (src_width, src_height) = src.dimensions();

    let src_image = fr::Image::from_vec_u8(
        NonZeroU32::new(src_width).context("Invalid width")?,
        NonZeroU32::new(src_height).context("Invalid height")?,
        src.as_raw().clone(),
        fr::PixelType::U8x4,
    )?;

    let dst_width = NonZeroU32::new(new_width).context("Invalid target width")?;
    let dst_height = NonZeroU32::new(new_height).context("Invalid target height")?;
    let mut dst_image = fr::Image::new(dst_width, dst_height, fr::PixelType::U8x4);

    let mut resizer = fr::Resizer::new(fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3));
    resizer.resize(&src_image.view(), &mut dst_image.view_mut())?;

    RgbaImage::from_raw(new_width, new_height, dst_image.into_vec())
        .context("Failed to create ImageBuffer")
}

/// CPU reference engine: Lanczos3 upscaling in horizontal bands.
///
/// Stands in for a neural model wherever none is available. Reports progress
/// after every band and stops between bands once cancelled.
pub struct ResampleEngine {
    max_scale: u32,
    bands: u32,
    ready: bool,
}

impl Default for ResampleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ResampleEngine {
    const DEFAULT_BANDS: u32 = 8;
    const DEFAULT_MAX_SCALE: u32 = 4;

    #[must_use]
    pub fn new() -> Self {
        Self {
            max_scale: Self::DEFAULT_MAX_SCALE,
            bands: Self::DEFAULT_BANDS,
            ready: false,
        }
    }

    /// Scales above `max_scale` fail to initialize, like a missing model file
    #[must_use]
    pub fn with_max_scale(mut self, max_scale: u32) -> Self {
        self.max_scale = max_scale.max(1);
        self
    }

    #[must_use]
    pub fn with_bands(mut self, bands: u32) -> Self {
        self.bands = bands.max(1);
        self
    }
}

impl InferenceEngine for ResampleEngine {
    fn initialize(&mut self, init: &EngineInit) -> bool {
        let scale = match *init {
            EngineInit::RealCugan { scale, .. }
            | EngineInit::RealEsrgan { scale }
            | EngineInit::Waifu2x { scale, .. } => scale,
            EngineInit::Nose => 1,
        };
        self.ready = scale >= 1 && scale <= self.max_scale;
        self.ready
    }

    fn run(&mut self, input: RgbaImage, ctx: &RunContext<'_>) -> Option<RgbaImage> {
        if !self.ready {
            return None;
        }

        let scale = ctx.scale.clamp(1, self.max_scale);
        let (width, height) = input.dimensions();
        let Some((out_width, out_height)) = scaled_dimensions(width, height, scale) else {
            warn!(
                "Page {} is too large to upscale {scale}x: {width}x{height}",
                ctx.item
            );
            return None;
        };
        let mut output = RgbaImage::new(out_width, out_height);

        let band_height = height.div_ceil(self.bands).max(1);
        let mut top = 0;
        while top < height {
            if ctx.is_cancelled() {
                debug!("Resample of page {} cancelled at row {top}", ctx.item);
                return None;
            }

            let rows = band_height.min(height - top);
            let band = imageops::crop_imm(&input, 0, top, width, rows).to_image();
            let scaled = match fast_resize(&band, out_width, rows * scale) {
                Ok(scaled) => scaled,
                Err(e) => {
                    warn!("Resample of page {} failed: {e:#}", ctx.item);
                    return None;
                }
            };
            imageops::replace(&mut output, &scaled, 0, i64::from(top * scale));

            top += rows;
            let percent = u64::from(top) * 100 / u64::from(height);
            ctx.report(i32::try_from(percent).unwrap_or(100));
        }

        Some(output)
    }
}
