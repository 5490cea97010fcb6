pub mod enhance;
pub mod panic_handler;
pub mod settings;

pub use enhance::{
    EnhanceParams, EnhancementQueue, ImageEnhancementCache, InferenceEngine, PageEnhancer,
    ReadingWindow,
};
pub use settings::Settings;
