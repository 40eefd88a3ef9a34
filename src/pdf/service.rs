//! Page render queue - per-document cache, request queue and dispatch job

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flume::{Receiver, Sender};
use log::{debug, info, warn};

use super::cache::DEFAULT_CACHE_PAGES;
use super::decoder::DocumentDecoder;
use super::request::{DocumentOpenError, Enqueued, RenderEvent};
use super::state::{Command, Effect, RenderState};
use super::types::{Bitmap, DisplayDensity, RenderTransform};
use super::worker::{DispatchSetup, RenderShared, lock_shared, run_dispatch};
use crate::jobs::{JobKind, WorkerCoordinator};

#[derive(Clone, Debug)]
pub struct RenderConfig {
    /// Rendered pages kept in the per-document LRU
    pub cache_pages: usize,
    /// Pause before a dispatch cycle so bursts of requests coalesce
    pub coalesce_delay: Duration,
    /// Pause after each render so other work gets a turn
    pub dispatch_yield: Duration,
    pub density: DisplayDensity,
    pub scale: f32,
    /// Job kind the dispatch loop runs under; distinct queues need distinct kinds
    pub job_kind: JobKind,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            cache_pages: DEFAULT_CACHE_PAGES,
            coalesce_delay: Duration::from_millis(30),
            dispatch_yield: Duration::from_millis(1),
            density: DisplayDensity::default(),
            scale: 1.0,
            job_kind: JobKind::PAGE_RENDER,
        }
    }
}

/// Result of [`PageRenderQueue::get_page`]
#[derive(Clone, Debug)]
pub enum PageStatus {
    /// Cached bitmap, returned immediately
    Ready(Arc<Bitmap>),
    /// Queued; a [`RenderEvent::PageReady`] or [`RenderEvent::RenderError`] follows
    Pending,
    /// No document bound, or the index is out of range
    Unavailable,
}

impl PageStatus {
    #[must_use]
    pub fn bitmap(&self) -> Option<&Arc<Bitmap>> {
        match self {
            Self::Ready(bitmap) => Some(bitmap),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Diagnostic snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheInfo {
    pub cached_pages: usize,
    pub queue_len: usize,
    pub page_count: usize,
    pub memory_bytes: usize,
    pub hit_ratio: f64,
    pub loading: bool,
}

struct Binding {
    shared: Arc<Mutex<RenderShared>>,
    doorbell: Sender<()>,
    generation: u64,
}

impl Binding {
    fn ring(&self) {
        // A full doorbell already guarantees another dispatch cycle.
        let _ = self.doorbell.try_send(());
    }
}

/// Renders pages of one document on demand.
///
/// `get_page` and `preload_pages` never block on rendering: misses are queued
/// and served one at a time by a dispatch job on the [`WorkerCoordinator`],
/// and results arrive as [`RenderEvent`]s.
pub struct PageRenderQueue<D: DocumentDecoder> {
    decoder: Arc<D>,
    coordinator: Arc<WorkerCoordinator>,
    config: RenderConfig,
    state: RenderState,
    binding: Option<Binding>,
    events_tx: Sender<RenderEvent>,
    events_rx: Receiver<RenderEvent>,
}

impl<D: DocumentDecoder> PageRenderQueue<D> {
    #[must_use]
    pub fn new(decoder: Arc<D>, coordinator: Arc<WorkerCoordinator>, config: RenderConfig) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            decoder,
            coordinator,
            state: RenderState::new(config.density, config.scale),
            config,
            binding: None,
            events_tx,
            events_rx,
        }
    }

    /// Release the current document and bind `path`. Returns the page count.
    pub fn set_document(&mut self, path: impl AsRef<Path>) -> Result<usize, DocumentOpenError> {
        self.cleanup();

        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(DocumentOpenError::new(path, "no such file"));
        }

        let shared = Arc::new(Mutex::new(RenderShared::new(
            self.config.cache_pages,
            self.state.transform(),
        )));
        let (doorbell_tx, doorbell_rx) = flume::bounded(1);
        let (opened_tx, opened_rx) = flume::bounded(1);

        let setup = DispatchSetup {
            decoder: Arc::clone(&self.decoder),
            path: path.clone(),
            shared: Arc::clone(&shared),
            doorbell: doorbell_rx,
            events: self.events_tx.clone(),
            opened: opened_tx,
            coalesce_delay: self.config.coalesce_delay,
            dispatch_yield: self.config.dispatch_yield,
        };

        let kind = self.config.job_kind.clone();
        let generation = self
            .coordinator
            .start_job(kind.clone(), move |ctx| run_dispatch(ctx, setup))
            .map_err(|e| DocumentOpenError::new(&path, e.to_string()))?;

        let page_count = match opened_rx.recv() {
            Ok(Ok(page_count)) => page_count,
            Ok(Err(e)) => {
                self.stop_dispatch(&kind, generation);
                return Err(e);
            }
            Err(_) => {
                self.stop_dispatch(&kind, generation);
                return Err(DocumentOpenError::new(
                    path,
                    "render worker exited before opening the document",
                ));
            }
        };

        info!("Bound {} with {page_count} pages", path.display());
        let _ = self.state.apply(Command::Bind { path, page_count });
        self.binding = Some(Binding {
            shared,
            doorbell: doorbell_tx,
            generation,
        });
        Ok(page_count)
    }

    /// Return the cached bitmap for `index`, or queue it and return `Pending`
    pub fn get_page(&self, index: usize, priority: bool) -> PageStatus {
        let Some(binding) = self.bound(index) else {
            return PageStatus::Unavailable;
        };

        let mut shared = lock_shared(&binding.shared);
        if let Some(bitmap) = shared.cache.get(index) {
            return PageStatus::Ready(bitmap);
        }
        let outcome = shared.queue.enqueue(index, priority);
        drop(shared);

        if outcome != Enqueued::Duplicate {
            binding.ring();
        }
        PageStatus::Pending
    }

    /// Queue low-priority renders for pages not already cached or queued
    pub fn preload_pages(&self, indices: impl IntoIterator<Item = usize>) {
        let Some(binding) = &self.binding else {
            return;
        };

        let mut added = 0usize;
        {
            let mut shared = lock_shared(&binding.shared);
            for index in indices {
                if index >= self.state.page_count || shared.cache.contains(index) {
                    continue;
                }
                if shared.queue.enqueue(index, false) == Enqueued::Added {
                    added += 1;
                }
            }
        }

        if added > 0 {
            debug!("Preloading {added} pages");
            binding.ring();
        }
    }

    /// Cached bitmap for `index` without queueing a render on a miss
    #[must_use]
    pub fn cached_page(&self, index: usize) -> Option<Arc<Bitmap>> {
        let binding = self.binding.as_ref()?;
        lock_shared(&binding.shared).cache.get(index)
    }

    #[must_use]
    pub fn is_page_cached(&self, index: usize) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|b| lock_shared(&b.shared).cache.contains(index))
    }

    #[must_use]
    pub fn cache_info(&self) -> CacheInfo {
        let Some(binding) = &self.binding else {
            return CacheInfo::default();
        };
        let shared = lock_shared(&binding.shared);
        CacheInfo {
            cached_pages: shared.cache.len(),
            queue_len: shared.queue.len(),
            page_count: self.state.page_count,
            memory_bytes: shared.cache.memory_bytes(),
            hit_ratio: shared.cache.hit_ratio(),
            loading: shared.loading,
        }
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.state.page_count
    }

    #[must_use]
    pub fn document_path(&self) -> Option<&Path> {
        self.state.doc_path.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> &RenderState {
        &self.state
    }

    pub fn set_display_density(&mut self, ratio: f32) {
        self.apply_command(Command::SetDevicePixelRatio(ratio));
    }

    pub fn set_dpi(&mut self, dpi: f32) {
        self.apply_command(Command::SetDpi(dpi));
    }

    pub fn set_scale(&mut self, scale: f32) {
        self.apply_command(Command::SetScale(scale));
    }

    fn apply_command(&mut self, cmd: Command) {
        let effects = self.state.apply(cmd);
        let transform = self.state.transform();

        for effect in effects {
            match effect {
                Effect::InvalidateCache => {
                    if let Some(binding) = &self.binding {
                        let mut shared = lock_shared(&binding.shared);
                        shared.cache.invalidate_all();
                        shared.transform = transform;
                        shared.epoch += 1;
                    }
                }
            }
        }
    }

    /// Receiver of page events; clone it into a UI event loop
    #[must_use]
    pub fn events(&self) -> Receiver<RenderEvent> {
        self.events_rx.clone()
    }

    /// Drain pending page events
    pub fn poll_events(&self) -> Vec<RenderEvent> {
        self.events_rx.try_iter().collect()
    }

    /// Stop dispatching, drop cached pages, queued requests and undelivered
    /// events, and release the document. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        let Some(binding) = self.binding.take() else {
            return;
        };

        let kind = self.config.job_kind.clone();
        self.stop_dispatch(&kind, binding.generation);

        // Page indices carry no document, so undelivered events of the
        // released one would be read as the next document's.
        let stale = self.events_rx.try_iter().count();
        if stale > 0 {
            debug!("Dropped {stale} undelivered page events");
        }

        let mut shared = lock_shared(&binding.shared);
        shared.cache.invalidate_all();
        shared.queue.clear();
        shared.loading = false;
        drop(shared);

        if let Some(path) = &self.state.doc_path {
            debug!("Released {}", path.display());
        }
        let _ = self.state.apply(Command::Unbind);
    }

    fn stop_dispatch(&self, kind: &JobKind, generation: u64) {
        // Another queue may have taken over this kind since.
        if self.coordinator.current_generation(kind) != Some(generation) {
            return;
        }
        if let Err(e) = self.coordinator.stop_job(kind) {
            warn!("Render dispatcher did not shut down cleanly: {e}");
        }
    }

    fn bound(&self, index: usize) -> Option<&Binding> {
        let binding = self.binding.as_ref()?;
        if index >= self.state.page_count {
            warn!(
                "Page {index} out of range for document with {} pages",
                self.state.page_count
            );
            return None;
        }
        Some(binding)
    }
}

impl<D: DocumentDecoder> Drop for PageRenderQueue<D> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Two-tier cache key for a rendered page.
///
/// Keyed by the effective magnification, so bitmaps rendered for another
/// dpi, pixel ratio or zoom are never reused.
#[must_use]
pub fn page_key(path: &Path, page: usize, transform: RenderTransform) -> String {
    format!("{}#{page}@{}", path.display(), transform.scale_x)
}
