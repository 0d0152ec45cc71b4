use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shared::bounding_box::BoundingBox;
use crate::shared::dimensions::Dimensions;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("display surface unavailable: {0}")]
    Unavailable(String),
    #[error("display surface has zero area")]
    EmptySurface,
    #[error("failed to load font: {0}")]
    Font(String),
}

/// RGBA color, non-premultiplied.
pub type Color = [u8; 4];

/// Addressable 2D drawing surface. Top-left origin, x right, y down, in
/// pixels of [`DisplaySurface::dimensions`].
pub trait DisplaySurface: Send {
    /// Current pixel size. May change between draws when the surface resizes.
    fn dimensions(&self) -> Dimensions;

    /// Erases everything drawn so far.
    fn clear(&mut self) -> Result<(), RenderError>;

    /// Outlines `rect` with a border `thickness` pixels wide, drawn inward.
    fn stroke_rect(
        &mut self,
        rect: &BoundingBox,
        color: Color,
        thickness: u32,
    ) -> Result<(), RenderError>;

    /// Draws one line of text with its top-left corner at `(x, y)`.
    fn fill_text(
        &mut self,
        x: f64,
        y: f64,
        text: &str,
        color: Color,
        size: f32,
    ) -> Result<(), RenderError>;
}

pub type SharedSurface = Arc<Mutex<dyn DisplaySurface>>;

/// Colors and metrics used when drawing detections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayStyle {
    pub box_color: Color,
    pub text_color: Color,
    pub line_width: u32,
    pub font_size: f32,
    /// Vertical distance between stacked text lines.
    pub line_height: f64,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            box_color: [0, 200, 255, 255],
            text_color: [255, 255, 255, 255],
            line_width: 2,
            font_size: 16.0,
            line_height: 18.0,
        }
    }
}
