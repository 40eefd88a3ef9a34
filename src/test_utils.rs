//! Test doubles for the render pipeline

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::pdf::{DocumentDecoder, DocumentOpenError, RawPage, RenderError, RenderTransform};

/// Page size in points of every fake page
pub const FAKE_PAGE_SIZE: (f32, f32) = (8.0, 10.0);

/// Open handle produced by [`FakeDecoder`]
#[derive(Debug)]
pub struct FakeDocument {
    pub path: PathBuf,
    pub pages: usize,
}

/// Decoder that produces solid gray pages without touching any real format.
///
/// Every page is rendered as a flat RGB image whose gray level is the page
/// index, so tests can tell pages apart by their first pixel.
#[derive(Debug, Default)]
pub struct FakeDecoder {
    pages: usize,
    render_delay: Duration,
    failing_pages: HashSet<usize>,
    unreadable: HashSet<PathBuf>,
    renders: Mutex<HashMap<usize, usize>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl FakeDecoder {
    pub fn new(pages: usize) -> Self {
        Self {
            pages,
            ..Self::default()
        }
    }

    /// Sleep this long inside every render
    pub fn with_render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = delay;
        self
    }

    /// Fail every render of `page`
    pub fn failing_on(mut self, page: usize) -> Self {
        self.failing_pages.insert(page);
        self
    }

    /// Refuse to open `path`
    pub fn unreadable(mut self, path: impl Into<PathBuf>) -> Self {
        self.unreadable.insert(path.into());
        self
    }

    /// Times `page` has been rendered
    pub fn render_count(&self, page: usize) -> usize {
        self.renders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&page)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_renders(&self) -> usize {
        self.renders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    /// Largest render count over all pages
    pub fn max_renders_per_page(&self) -> usize {
        self.renders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DocumentDecoder for FakeDecoder {
    type Document = FakeDocument;

    fn open(&self, path: &Path) -> Result<FakeDocument, DocumentOpenError> {
        if self.unreadable.contains(path) {
            return Err(DocumentOpenError::new(path, "unreadable"));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(FakeDocument {
            path: path.to_path_buf(),
            pages: self.pages,
        })
    }

    fn page_count(&self, doc: &FakeDocument) -> usize {
        doc.pages
    }

    fn render_page(
        &self,
        doc: &FakeDocument,
        page: usize,
        transform: &RenderTransform,
    ) -> Result<RawPage, RenderError> {
        *self
            .renders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(page)
            .or_default() += 1;

        if !self.render_delay.is_zero() {
            thread::sleep(self.render_delay);
        }
        if page >= doc.pages {
            return Err(RenderError::new(page, "page out of range"));
        }
        if self.failing_pages.contains(&page) {
            return Err(RenderError::new(page, "synthetic failure"));
        }

        let width = ((FAKE_PAGE_SIZE.0 * transform.scale_x).round() as u32).max(1);
        let height = ((FAKE_PAGE_SIZE.1 * transform.scale_y).round() as u32).max(1);
        let gray = (page % 256) as u8;
        Ok(RawPage {
            pixels: vec![gray; (width * height * 3) as usize],
            width,
            height,
        })
    }

    fn close(&self, _doc: FakeDocument) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Empty file that stands in for a document on disk
pub fn temp_document() -> tempfile::NamedTempFile {
    tempfile::Builder::new()
        .suffix(".pdf")
        .tempfile()
        .unwrap_or_else(|e| panic!("failed to create temp document: {e}"))
}
