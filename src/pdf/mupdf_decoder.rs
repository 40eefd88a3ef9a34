//! MuPDF-backed document decoder

use std::path::Path;

use mupdf::{Colorspace, Document, Matrix, Pixmap};

use super::decoder::DocumentDecoder;
use super::request::{DocumentOpenError, RenderError};
use super::types::{RawPage, RenderTransform};

/// Largest output edge in pixels; larger renders are scaled down to fit
pub const MAX_DIMENSION: f32 = 8192.0;

#[derive(Clone, Copy, Debug, Default)]
pub struct MupdfDecoder;

impl MupdfDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl DocumentDecoder for MupdfDecoder {
    type Document = Document;

    fn open(&self, path: &Path) -> Result<Document, DocumentOpenError> {
        let doc = Document::open(path.to_string_lossy().as_ref())
            .map_err(|e| DocumentOpenError::new(path, e.to_string()))?;
        match doc.page_count() {
            Ok(n) if n > 0 => Ok(doc),
            Ok(_) => Err(DocumentOpenError::new(path, "document has no pages")),
            Err(e) => Err(DocumentOpenError::new(path, e.to_string())),
        }
    }

    fn page_count(&self, doc: &Document) -> usize {
        doc.page_count().map_or(0, |n| n.max(0) as usize)
    }

    fn render_page(
        &self,
        doc: &Document,
        page_num: usize,
        transform: &RenderTransform,
    ) -> Result<RawPage, RenderError> {
        let fault = |e: mupdf::error::Error| RenderError::new(page_num, e.to_string());

        let page = doc.load_page(page_num as i32).map_err(fault)?;
        let bounds = page.bounds().map_err(fault)?;
        let page_width = bounds.x1 - bounds.x0;
        let page_height = bounds.y1 - bounds.y0;

        let mut scale_x = transform.scale_x;
        let mut scale_y = transform.scale_y;
        let max_dim = (page_width * scale_x).max(page_height * scale_y);
        if max_dim > MAX_DIMENSION {
            let reduction = MAX_DIMENSION / max_dim;
            scale_x *= reduction;
            scale_y *= reduction;
        }

        let matrix = Matrix::new_scale(scale_x, scale_y);
        let rgb = Colorspace::device_rgb();
        let pixmap = page.to_pixmap(&matrix, &rgb, false, false).map_err(fault)?;

        let pixels = pixmap_to_rgb(&pixmap).map_err(|reason| RenderError::new(page_num, reason))?;
        Ok(RawPage {
            pixels,
            width: pixmap.width(),
            height: pixmap.height(),
        })
    }
}

/// Pack pixmap samples as RGB, dropping row padding and any alpha channel
fn pixmap_to_rgb(pixmap: &Pixmap) -> Result<Vec<u8>, String> {
    let channels = pixmap.n() as usize;
    if channels < 3 {
        return Err(format!("expected at least 3 channels, got {channels}"));
    }

    let width = pixmap.width() as usize;
    let height = pixmap.height() as usize;
    let stride = pixmap.stride() as usize;
    let samples = pixmap.samples();
    if width * channels > stride || samples.len() < stride.saturating_mul(height) {
        return Err(format!(
            "pixmap buffer of {} bytes too small for {width}x{height}",
            samples.len()
        ));
    }

    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in samples.chunks(stride).take(height) {
        rgb.extend(
            row[..width * channels]
                .chunks_exact(channels)
                .flat_map(|px| px[..3].iter().copied()),
        );
    }
    Ok(rgb)
}
