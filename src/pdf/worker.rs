//! Page dispatch loop - runs as a coordinator job on its own thread

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use super::cache::PageCache;
use super::decoder::DocumentDecoder;
use super::request::{DocumentOpenError, RenderEvent, RenderRequest, RequestQueue};
use super::types::{RenderTransform, to_bitmap};
use crate::jobs::{JobContext, JobResult};

/// How often an idle dispatcher re-checks its cancellation flag
const IDLE_POLL: Duration = Duration::from_millis(25);

/// State shared between the caller and the dispatch thread of one document
pub(crate) struct RenderShared {
    pub cache: PageCache,
    pub queue: RequestQueue,
    pub loading: bool,
    pub transform: RenderTransform,
    /// Bumped whenever cached bitmaps are invalidated
    pub epoch: u64,
}

impl RenderShared {
    pub fn new(cache_pages: usize, transform: RenderTransform) -> Self {
        Self {
            cache: PageCache::new(cache_pages),
            queue: RequestQueue::new(),
            loading: false,
            transform,
            epoch: 0,
        }
    }
}

pub(crate) fn lock_shared(shared: &Mutex<RenderShared>) -> std::sync::MutexGuard<'_, RenderShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the dispatch thread owns
pub(crate) struct DispatchSetup<D: DocumentDecoder> {
    pub decoder: Arc<D>,
    pub path: PathBuf,
    pub shared: Arc<Mutex<RenderShared>>,
    pub doorbell: Receiver<()>,
    pub events: Sender<RenderEvent>,
    pub opened: Sender<Result<usize, DocumentOpenError>>,
    pub coalesce_delay: Duration,
    pub dispatch_yield: Duration,
}

/// Open the document, report the page count, then serve the request queue
/// one page at a time until cancelled.
pub(crate) fn run_dispatch<D: DocumentDecoder>(ctx: &JobContext, setup: DispatchSetup<D>) -> JobResult {
    let DispatchSetup {
        decoder,
        path,
        shared,
        doorbell,
        events,
        opened,
        coalesce_delay,
        dispatch_yield,
    } = setup;

    let doc = match decoder.open(&path) {
        Ok(doc) => doc,
        Err(e) => {
            let _ = opened.send(Err(e.clone()));
            return Err(e.into());
        }
    };
    let page_count = decoder.page_count(&doc);
    let _ = opened.send(Ok(page_count));
    info!("Opened {} ({page_count} pages)", path.display());

    let mut rendered = 0usize;
    'idle: loop {
        match doorbell.recv_timeout(IDLE_POLL) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {
                if ctx.is_cancelled() {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }

        // Let a burst of requests (fast scrolling) pile up before dispatching.
        if ctx.wait(coalesce_delay) {
            break;
        }
        while doorbell.try_recv().is_ok() {}

        let mut batch_done = 0usize;
        loop {
            if ctx.is_cancelled() {
                break 'idle;
            }

            let Some((request, transform, epoch, remaining)) = next_request(&shared) else {
                break;
            };

            render_one(ctx, decoder.as_ref(), &doc, &shared, &events, &request, transform, epoch);
            rendered += 1;
            batch_done += 1;
            ctx.progress(batch_done, batch_done + remaining);

            if ctx.wait(dispatch_yield) {
                break 'idle;
            }
        }
    }

    decoder.close(doc);
    debug!("Dispatcher for {} exiting", path.display());
    Ok(format!("rendered {rendered} pages"))
}

fn next_request(shared: &Mutex<RenderShared>) -> Option<(RenderRequest, RenderTransform, u64, usize)> {
    let mut shared = lock_shared(shared);
    let request = shared.queue.pop()?;
    shared.loading = true;
    Some((request, shared.transform, shared.epoch, shared.queue.len()))
}

#[allow(clippy::too_many_arguments)]
fn render_one<D: DocumentDecoder>(
    ctx: &JobContext,
    decoder: &D,
    doc: &D::Document,
    shared: &Mutex<RenderShared>,
    events: &Sender<RenderEvent>,
    request: &RenderRequest,
    transform: RenderTransform,
    epoch: u64,
) {
    let page = request.page;
    ctx.emit(events, RenderEvent::LoadStarted { page });

    let result = decoder
        .render_page(doc, page, &transform)
        .and_then(|raw| to_bitmap(page, raw));

    let mut guard = lock_shared(shared);
    guard.loading = false;
    guard.queue.finish(page);

    if guard.epoch != epoch {
        // Rendered for a stale matrix; try again with the current one.
        debug!("Discarding page {page} rendered before invalidation");
        guard.queue.enqueue(page, request.priority);
        return;
    }

    match result {
        Ok(bitmap) => {
            if ctx.is_muted() {
                return;
            }
            let (bitmap, evicted) = guard.cache.insert(page, bitmap);
            drop(guard);
            if let Some(evicted) = evicted {
                debug!("Evicted page {evicted} to make room for page {page}");
            }
            debug!(
                "Rendered page {page} in {:?}",
                request.enqueued_at.elapsed()
            );
            ctx.emit(events, RenderEvent::PageReady { page, bitmap });
        }
        Err(e) => {
            drop(guard);
            warn!("Failed to render {e}");
            ctx.emit(
                events,
                RenderEvent::RenderError {
                    page,
                    message: e.reason,
                },
            );
        }
    }
}
