//! Document decoder seam

use std::path::Path;

use super::request::{DocumentOpenError, RenderError};
use super::types::{RawPage, RenderTransform};

/// The external collaborator that parses and rasterizes documents.
///
/// Document handles are opened, used and closed on the dispatch thread that
/// owns them, so `Document` does not need to be `Send`. Implementations must
/// tolerate being called for one document at a time per handle.
pub trait DocumentDecoder: Send + Sync + 'static {
    type Document;

    fn open(&self, path: &Path) -> Result<Self::Document, DocumentOpenError>;

    fn page_count(&self, doc: &Self::Document) -> usize;

    fn render_page(
        &self,
        doc: &Self::Document,
        page: usize,
        transform: &RenderTransform,
    ) -> Result<RawPage, RenderError>;

    fn close(&self, doc: Self::Document) {
        drop(doc);
    }
}
