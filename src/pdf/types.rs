//! Core types for page rendering

use super::request::RenderError;

/// PDF user space is 72 points per inch.
pub const POINTS_PER_INCH: f32 = 72.0;

/// Raw rendered page as produced by a [`DocumentDecoder`](super::DocumentDecoder).
///
/// Pixel data is packed RGB (3 bytes per pixel, no row padding). This is the
/// intermediate format between the decoder and the cache bitmap representation.
#[derive(Clone)]
pub struct RawPage {
    /// Raw RGB pixel data (3 bytes per pixel: R, G, B)
    pub pixels: Vec<u8>,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
}

impl std::fmt::Debug for RawPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawPage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixels_len", &self.pixels.len())
            .finish()
    }
}

/// Decoded raster image of one page, stored in the caches.
///
/// Pixels are RGBA, 4 bytes per pixel, row-major without padding. A bitmap is
/// immutable once it is handed to a cache; consumers share it through `Arc`.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Bitmap {
    /// Build a bitmap from RGBA pixels, checking the buffer length.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(4)?;
        (pixels.len() == expected).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    /// Solid-color bitmap; used for placeholders and tests.
    #[must_use]
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let count = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(count * 4);
        for _ in 0..count {
            pixels.extend_from_slice(&rgba);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Estimated memory footprint: width x height x 4.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl TryFrom<RawPage> for Bitmap {
    type Error = String;

    fn try_from(raw: RawPage) -> Result<Self, Self::Error> {
        let count = raw.width as usize * raw.height as usize;
        if raw.pixels.len() != count * 3 {
            return Err(format!(
                "pixel buffer size mismatch: {} bytes for {}x{} RGB",
                raw.pixels.len(),
                raw.width,
                raw.height
            ));
        }

        let mut pixels = Vec::with_capacity(count * 4);
        for px in raw.pixels.chunks_exact(3) {
            pixels.extend_from_slice(&[px[0], px[1], px[2], 0xFF]);
        }

        Ok(Self {
            width: raw.width,
            height: raw.height,
            pixels,
        })
    }
}

/// Convert a decoder page into a cache bitmap, attributing failures to `page`.
pub fn to_bitmap(page: usize, raw: RawPage) -> Result<Bitmap, RenderError> {
    Bitmap::try_from(raw).map_err(|reason| RenderError::new(page, reason))
}

/// Display density the pages are rendered for.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplayDensity {
    /// Physical pixels per logical pixel (2.0 on HiDPI screens)
    pub device_pixel_ratio: f32,
    /// Logical pixels per inch
    pub dpi: f32,
}

impl Default for DisplayDensity {
    fn default() -> Self {
        Self {
            device_pixel_ratio: 1.0,
            dpi: 96.0,
        }
    }
}

/// Scale matrix handed to the decoder, mapping page points to output pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderTransform {
    pub scale_x: f32,
    pub scale_y: f32,
}

impl RenderTransform {
    /// Minimum zoom; anything lower renders unreadable slivers.
    pub const MIN_SCALE: f32 = 0.1;

    /// Derive the render matrix from the display density and user zoom.
    #[must_use]
    pub fn for_display(density: DisplayDensity, user_scale: f32) -> Self {
        let dpr = if density.device_pixel_ratio > 0.0 {
            density.device_pixel_ratio
        } else {
            1.0
        };
        let dpi = if density.dpi > 0.0 {
            density.dpi
        } else {
            DisplayDensity::default().dpi
        };
        let mag = dpi / POINTS_PER_INCH * dpr * user_scale.max(Self::MIN_SCALE);
        Self {
            scale_x: mag,
            scale_y: mag,
        }
    }
}
