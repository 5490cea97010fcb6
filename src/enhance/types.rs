//! Identifiers and parameters shared by the enhancement pipeline

use serde::{Deserialize, Serialize};

/// Identifies the collection (book, chapter, archive) a page belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionId(pub u64);

impl CollectionId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CollectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upscaling model selected by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    #[default]
    RealCugan,
    RealEsrgan,
    Nose,
    Waifu2x,
}

impl ModelVariant {
    /// Stable numeric id, part of the persisted cache key
    pub fn id(&self) -> u8 {
        match self {
            ModelVariant::RealCugan => 0,
            ModelVariant::RealEsrgan => 1,
            ModelVariant::Nose => 2,
            ModelVariant::Waifu2x => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::RealCugan => "Real-CUGAN",
            ModelVariant::RealEsrgan => "Real-ESRGAN",
            ModelVariant::Nose => "Nose",
            ModelVariant::Waifu2x => "waifu2x",
        }
    }
}

/// Engine initialization request. Each variant has its own parameter shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineInit {
    RealCugan { noise_level: i32, scale: u32 },
    RealEsrgan { scale: u32 },
    Nose,
    Waifu2x { noise_level: i32, scale: u32 },
}

impl EngineInit {
    #[must_use]
    pub fn variant(&self) -> ModelVariant {
        match self {
            EngineInit::RealCugan { .. } => ModelVariant::RealCugan,
            EngineInit::RealEsrgan { .. } => ModelVariant::RealEsrgan,
            EngineInit::Nose => ModelVariant::Nose,
            EngineInit::Waifu2x { .. } => ModelVariant::Waifu2x,
        }
    }
}

/// Every parameter that changes the bytes an enhancement produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhanceParams {
    pub model: ModelVariant,
    pub noise_level: i32,
    pub scale: u32,
    /// Pre-downscale factor in percent, 100 disables it
    pub input_scale: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for EnhanceParams {
    fn default() -> Self {
        Self {
            model: ModelVariant::RealCugan,
            noise_level: 0,
            scale: 2,
            input_scale: 100,
            max_width: 2048,
            max_height: 2048,
        }
    }
}

impl EnhanceParams {
    /// Translate user parameters into the engine's init call.
    /// waifu2x numbers its noise levels from zero and only ships 2x models.
    #[must_use]
    pub fn engine_init(&self) -> EngineInit {
        match self.model {
            ModelVariant::RealCugan => EngineInit::RealCugan {
                noise_level: self.noise_level,
                scale: self.scale,
            },
            ModelVariant::RealEsrgan => EngineInit::RealEsrgan { scale: self.scale },
            ModelVariant::Nose => EngineInit::Nose,
            ModelVariant::Waifu2x => EngineInit::Waifu2x {
                noise_level: self.noise_level - 1,
                scale: 2,
            },
        }
    }

    /// Scale factor actually handed to the engine run
    #[must_use]
    pub fn effective_scale(&self) -> u32 {
        match self.model {
            ModelVariant::Waifu2x => 2,
            _ => self.scale.max(1),
        }
    }

    #[must_use]
    pub fn exceeds_size_limit(&self, width: u32, height: u32) -> bool {
        width > self.max_width || height > self.max_height
    }
}
