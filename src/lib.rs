pub mod cache;
pub mod jobs;
pub mod panic_handler;
pub mod pdf;
pub mod settings;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cache::{CacheConfig, CacheEvent, CacheStats, CacheValue, TwoTierCache};
pub use jobs::{JobKind, JobState, WorkerConfig, WorkerCoordinator, WorkerError};
pub use pdf::{Bitmap, PageRenderQueue, PageStatus, RenderConfig, RenderEvent};
pub use settings::Settings;
