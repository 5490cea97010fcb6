use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::enhance::{
    DEFAULT_PRELOAD_DISTANCE, EnhanceParams, ImageEnhancementCache, ModelVariant, QueueConfig,
    RetentionPolicy, SessionConfig,
};

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "page-enhancer";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub model: ModelVariant,

    /// -1..=3
    #[serde(default)]
    pub noise_level: i32,

    #[serde(default = "default_scale")]
    pub scale: u32,

    /// Pre-downscale in percent; 100 leaves the input alone
    #[serde(default = "default_input_scale")]
    pub input_scale: u32,

    #[serde(default = "default_max_dimension")]
    pub max_width: u32,

    #[serde(default = "default_max_dimension")]
    pub max_height: u32,

    #[serde(default = "default_preload_size")]
    pub preload_size: usize,

    #[serde(default = "default_true")]
    pub show_status: bool,

    /// Positions behind the reader a waiting job may fall and still run
    #[serde(default)]
    pub staleness_tolerance: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    #[serde(default = "default_retain_behind")]
    pub cache_retain_behind: usize,

    #[serde(default = "default_retain_ahead")]
    pub cache_retain_ahead: usize,

    #[serde(default = "default_sweep_every")]
    pub cache_sweep_every: usize,

    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_scale() -> u32 {
    2
}

fn default_input_scale() -> u32 {
    100
}

fn default_max_dimension() -> u32 {
    2048
}

fn default_preload_size() -> usize {
    DEFAULT_PRELOAD_DISTANCE
}

fn default_retain_behind() -> usize {
    RetentionPolicy::default().behind
}

fn default_retain_ahead() -> usize {
    RetentionPolicy::default().ahead
}

fn default_sweep_every() -> usize {
    RetentionPolicy::default().sweep_every
}

fn default_progress_interval_ms() -> u64 {
    100
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            enabled: true,
            model: ModelVariant::default(),
            noise_level: 0,
            scale: default_scale(),
            input_scale: default_input_scale(),
            max_width: default_max_dimension(),
            max_height: default_max_dimension(),
            preload_size: default_preload_size(),
            show_status: true,
            staleness_tolerance: 0,
            cache_dir: None,
            cache_retain_behind: default_retain_behind(),
            cache_retain_ahead: default_retain_ahead(),
            cache_sweep_every: default_sweep_every(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

impl Settings {
    /// Load from `path`, or from the default location when `None`.
    /// A missing file is created with defaults; an unreadable one falls back
    /// to defaults without touching the file.
    pub fn load(path: Option<&Path>) -> Self {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) => path,
                None => {
                    warn!("Could not determine config directory, using default settings");
                    return Self::default();
                }
            },
        };

        if !path.exists() {
            info!("Settings file not found, creating with defaults at {path:?}");
            let settings = Self::default();
            settings.save(&path);
            return settings;
        }

        Self::load_from_path(&path).unwrap_or_default()
    }

    fn load_from_path(path: &Path) -> Option<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                error!("Failed to read settings file {path:?}: {e}");
                return None;
            }
        };

        match serde_yaml::from_str::<Settings>(&content) {
            Ok(mut settings) => {
                debug!("Loaded settings from {path:?}");
                if settings.version < CURRENT_VERSION {
                    migrate_settings(&mut settings);
                    settings.save(path);
                }
                Some(settings.sanitized())
            }
            Err(e) => {
                error!("Failed to parse settings file {path:?}: {e}");
                None
            }
        }
    }

    pub fn save(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                if let Err(e) = fs::create_dir_all(parent) {
                    error!("Failed to create config directory {parent:?}: {e}");
                    return;
                }
            }
        }

        let content = match serde_yaml::to_string(self) {
            Ok(body) => format!("{SETTINGS_HEADER}{body}"),
            Err(e) => {
                error!("Failed to serialize settings: {e}");
                return;
            }
        };

        match fs::write(path, content) {
            Ok(()) => debug!("Saved settings to {path:?}"),
            Err(e) => error!("Failed to save settings to {path:?}: {e}"),
        }
    }

    /// Clamp values the engine cannot take
    fn sanitized(mut self) -> Self {
        if !(-1..=3).contains(&self.noise_level) {
            warn!("noise_level {} out of range, clamping", self.noise_level);
            self.noise_level = self.noise_level.clamp(-1, 3);
        }
        if self.scale == 0 {
            warn!("scale 0 is invalid, using {}", default_scale());
            self.scale = default_scale();
        }
        if self.input_scale == 0 || self.input_scale > 100 {
            warn!("input_scale {} out of range, disabling pre-downscale", self.input_scale);
            self.input_scale = default_input_scale();
        }
        self
    }

    pub fn enhance_params(&self) -> EnhanceParams {
        EnhanceParams {
            model: self.model,
            noise_level: self.noise_level,
            scale: self.scale,
            input_scale: self.input_scale,
            max_width: self.max_width,
            max_height: self.max_height,
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            behind: self.cache_retain_behind,
            ahead: self.cache_retain_ahead,
            sweep_every: self.cache_sweep_every,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            staleness_tolerance: self.staleness_tolerance,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            enabled: self.enabled,
            show_status: self.show_status,
            progress_interval: Duration::from_millis(self.progress_interval_ms.max(1)),
        }
    }

    /// How far ahead of the reader pages are admitted
    pub fn preload_distance(&self) -> usize {
        if self.enabled {
            self.preload_size
        } else {
            DEFAULT_PRELOAD_DISTANCE
        }
    }

    pub fn cache(&self) -> anyhow::Result<ImageEnhancementCache> {
        match &self.cache_dir {
            Some(dir) => Ok(ImageEnhancementCache::new(dir.clone(), self.retention())),
            None => ImageEnhancementCache::in_user_cache_dir(self.retention()),
        }
    }
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );

    // Future migrations go here:
    // if settings.version < 2 {
    //     migrate_v1_to_v2(settings);
    // }

    settings.version = CURRENT_VERSION;
}

const SETTINGS_HEADER: &str = r#"# page-enhancer settings
#
# model: real_cugan | real_esrgan | nose | waifu2x
# noise_level: -1..3 (waifu2x uses noise_level - 1)
# input_scale: percent to shrink pages by before enhancement, 100 = off
# Pages larger than max_width x max_height are never enhanced.

"#;
