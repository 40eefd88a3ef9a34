//! Render state management

use std::path::PathBuf;

use super::types::{DisplayDensity, RenderTransform};

/// Current render state for the bound document
#[derive(Clone, Debug)]
pub struct RenderState {
    /// Path of the bound document, `None` while unbound
    pub doc_path: Option<PathBuf>,

    /// Total page count
    pub page_count: usize,

    /// Density of the display the pages are shown on
    pub density: DisplayDensity,

    /// User-specified scale factor
    pub scale: f32,
}

impl RenderState {
    #[must_use]
    pub fn new(density: DisplayDensity, scale: f32) -> Self {
        Self {
            doc_path: None,
            page_count: 0,
            density,
            scale: scale.max(RenderTransform::MIN_SCALE),
        }
    }

    /// Apply a command and return resulting effects
    #[must_use]
    pub fn apply(&mut self, cmd: Command) -> Vec<Effect> {
        match cmd {
            Command::Bind { path, page_count } => {
                self.doc_path = Some(path);
                self.page_count = page_count;
                vec![]
            }

            Command::Unbind => {
                self.doc_path = None;
                self.page_count = 0;
                vec![Effect::InvalidateCache]
            }

            Command::SetDevicePixelRatio(ratio) => {
                let ratio = if ratio > 0.0 { ratio } else { 1.0 };
                if (self.density.device_pixel_ratio - ratio).abs() > f32::EPSILON {
                    self.density.device_pixel_ratio = ratio;
                    vec![Effect::InvalidateCache]
                } else {
                    vec![]
                }
            }

            Command::SetDpi(dpi) => {
                if dpi > 0.0 && (self.density.dpi - dpi).abs() > f32::EPSILON {
                    self.density.dpi = dpi;
                    vec![Effect::InvalidateCache]
                } else {
                    vec![]
                }
            }

            Command::SetScale(scale) => {
                let clamped = scale.max(RenderTransform::MIN_SCALE);
                if (self.scale - clamped).abs() > f32::EPSILON {
                    self.scale = clamped;
                    vec![Effect::InvalidateCache]
                } else {
                    vec![]
                }
            }
        }
    }

    /// Render matrix for the current density and scale
    #[must_use]
    pub fn transform(&self) -> RenderTransform {
        RenderTransform::for_display(self.density, self.scale)
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.doc_path.is_some()
    }
}

/// Commands that modify render state
#[derive(Clone, Debug)]
pub enum Command {
    /// A document was opened
    Bind { path: PathBuf, page_count: usize },
    /// The document was released
    Unbind,
    /// Physical pixels per logical pixel changed (monitor switch, zoom)
    SetDevicePixelRatio(f32),
    /// Logical DPI changed
    SetDpi(f32),
    /// Set the scale factor
    SetScale(f32),
}

/// Side effects the render queue must carry out after a command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Cached bitmaps no longer match the render matrix
    InvalidateCache,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn density_change_invalidates_cache() {
        let mut state = RenderState::new(DisplayDensity::default(), 1.0);
        assert_eq!(
            state.apply(Command::SetDevicePixelRatio(2.0)),
            vec![Effect::InvalidateCache]
        );
        assert!(state.apply(Command::SetDevicePixelRatio(2.0)).is_empty());
    }

    #[test]
    fn scale_is_clamped() {
        let mut state = RenderState::new(DisplayDensity::default(), 1.0);
        let _ = state.apply(Command::SetScale(0.0));
        assert!((state.scale - RenderTransform::MIN_SCALE).abs() < f32::EPSILON);
    }

    #[test]
    fn bind_and_unbind() {
        let mut state = RenderState::new(DisplayDensity::default(), 1.0);
        let _ = state.apply(Command::Bind {
            path: PathBuf::from("a.pdf"),
            page_count: 3,
        });
        assert!(state.is_bound());
        assert_eq!(state.apply(Command::Unbind), vec![Effect::InvalidateCache]);
        assert_eq!(state.page_count, 0);
    }
}
