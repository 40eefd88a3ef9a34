//! Page rendering infrastructure

mod cache;
mod decoder;
#[cfg(feature = "pdf")]
mod mupdf_decoder;
mod request;
mod service;
mod state;
mod types;
mod worker;

pub use cache::{DEFAULT_CACHE_PAGES, PageCache};
pub use decoder::DocumentDecoder;
#[cfg(feature = "pdf")]
pub use mupdf_decoder::MupdfDecoder;
pub use request::{DocumentOpenError, Enqueued, RenderError, RenderEvent, RenderRequest, RequestQueue};
pub use service::{CacheInfo, PageRenderQueue, PageStatus, RenderConfig, page_key};
pub use state::{Command, Effect, RenderState};
pub use types::*;
