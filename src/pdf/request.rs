//! Render request, queue and event types

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use super::types::Bitmap;

/// A queued unit of work that will produce a bitmap for one page
#[derive(Clone, Debug)]
pub struct RenderRequest {
    pub page: usize,
    pub priority: bool,
    pub enqueued_at: Instant,
}

impl RenderRequest {
    #[must_use]
    pub fn new(page: usize, priority: bool) -> Self {
        Self {
            page,
            priority,
            enqueued_at: Instant::now(),
        }
    }
}

/// Outcome of [`RequestQueue::enqueue`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// A new request was added
    Added,
    /// An existing low-priority request moved to the priority tier
    Promoted,
    /// The page is already queued or being rendered
    Duplicate,
}

/// Two-tier FIFO of render requests with mandatory de-duplication.
///
/// Priority requests are served before normal ones; arrival order is kept
/// within each tier. A page is never present twice, and a page that is
/// currently being rendered is not queued again.
#[derive(Debug, Default)]
pub struct RequestQueue {
    priority: VecDeque<RenderRequest>,
    normal: VecDeque<RenderRequest>,
    in_flight: Option<usize>,
}

impl RequestQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, page: usize, priority: bool) -> Enqueued {
        if self.in_flight == Some(page) || self.priority.iter().any(|r| r.page == page) {
            return Enqueued::Duplicate;
        }

        if let Some(pos) = self.normal.iter().position(|r| r.page == page) {
            if !priority {
                return Enqueued::Duplicate;
            }
            if let Some(mut request) = self.normal.remove(pos) {
                request.priority = true;
                self.priority.push_back(request);
            }
            return Enqueued::Promoted;
        }

        let request = RenderRequest::new(page, priority);
        if priority {
            self.priority.push_back(request);
        } else {
            self.normal.push_back(request);
        }
        Enqueued::Added
    }

    /// Pop the next request and mark its page as in flight
    pub fn pop(&mut self) -> Option<RenderRequest> {
        let request = self
            .priority
            .pop_front()
            .or_else(|| self.normal.pop_front())?;
        self.in_flight = Some(request.page);
        Some(request)
    }

    /// Clear the in-flight marker once the page has been stored or failed
    pub fn finish(&mut self, page: usize) {
        if self.in_flight == Some(page) {
            self.in_flight = None;
        }
    }

    #[must_use]
    pub fn contains(&self, page: usize) -> bool {
        self.in_flight == Some(page)
            || self.priority.iter().any(|r| r.page == page)
            || self.normal.iter().any(|r| r.page == page)
    }

    #[must_use]
    pub fn in_flight(&self) -> Option<usize> {
        self.in_flight
    }

    /// Number of requests waiting for dispatch (excludes the one in flight)
    #[must_use]
    pub fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.normal.is_empty()
    }

    pub fn clear(&mut self) {
        self.priority.clear();
        self.normal.clear();
        self.in_flight = None;
    }
}

/// `set_document` failure: the path is missing or the decoder rejected it
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot open {}: {reason}", path.display())]
pub struct DocumentOpenError {
    pub path: PathBuf,
    pub reason: String,
}

impl DocumentOpenError {
    pub fn new(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Single-page render failure; reported as an event, never cached
#[derive(Debug, Clone, thiserror::Error)]
#[error("page {page}: {reason}")]
pub struct RenderError {
    pub page: usize,
    pub reason: String,
}

impl RenderError {
    pub fn new(page: usize, reason: impl Into<String>) -> Self {
        Self {
            page,
            reason: reason.into(),
        }
    }
}

/// Events delivered from the dispatch loop
#[derive(Clone, Debug)]
pub enum RenderEvent {
    /// Rendering of a page has begun
    LoadStarted { page: usize },

    /// A page finished rendering and is now cached
    PageReady { page: usize, bitmap: Arc<Bitmap> },

    /// A page failed to render; the queue carries on
    RenderError { page: usize, message: String },
}

impl RenderEvent {
    #[must_use]
    pub fn page(&self) -> usize {
        match self {
            Self::LoadStarted { page }
            | Self::PageReady { page, .. }
            | Self::RenderError { page, .. } => *page,
        }
    }
}
