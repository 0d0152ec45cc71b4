use std::path::Path;

use ab_glyph::FontArc;
use image::{imageops, Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::overlay::domain::display_surface::{Color, DisplaySurface, RenderError};
use crate::shared::bounding_box::BoundingBox;
use crate::shared::dimensions::Dimensions;
use crate::shared::frame::Frame;

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// In-memory RGBA overlay canvas.
///
/// Text needs a font; without one, `fill_text` draws nothing and boxes are
/// still stroked.
pub struct RasterSurface {
    canvas: RgbaImage,
    font: Option<FontArc>,
}

impl RasterSurface {
    pub fn new(dimensions: Dimensions) -> Self {
        Self {
            canvas: RgbaImage::from_pixel(dimensions.width, dimensions.height, TRANSPARENT),
            font: None,
        }
    }

    pub fn with_font(mut self, font: FontArc) -> Self {
        self.font = Some(font);
        self
    }

    /// Loads a TrueType/OpenType font for labels.
    pub fn with_font_file(self, path: &Path) -> Result<Self, RenderError> {
        let bytes = std::fs::read(path)
            .map_err(|e| RenderError::Font(format!("{}: {e}", path.display())))?;
        let font = FontArc::try_from_vec(bytes)
            .map_err(|e| RenderError::Font(format!("{}: {e}", path.display())))?;
        Ok(self.with_font(font))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// A transparent canvas of the same size sharing this surface's font.
    pub fn empty_like(&self) -> Self {
        Self {
            canvas: RgbaImage::from_pixel(self.canvas.width(), self.canvas.height(), TRANSPARENT),
            font: self.font.clone(),
        }
    }

    /// Replaces the canvas with an empty one of the new size.
    pub fn resize(&mut self, dimensions: Dimensions) {
        self.canvas = RgbaImage::from_pixel(dimensions.width, dimensions.height, TRANSPARENT);
    }

    pub fn image(&self) -> &RgbaImage {
        &self.canvas
    }

    /// Composites the overlay over `frame`, scaling the frame to the canvas
    /// size first.
    pub fn annotate(&self, frame: &Frame) -> Result<RgbImage, RenderError> {
        let base = frame.to_rgb_image().ok_or_else(|| {
            RenderError::Unavailable(format!(
                "frame {} is not {}x{} RGB",
                frame.index(),
                frame.width(),
                frame.height()
            ))
        })?;
        let (width, height) = self.canvas.dimensions();
        let mut base = if base.dimensions() == (width, height) {
            base
        } else {
            imageops::resize(&base, width, height, imageops::FilterType::Triangle)
        };

        for (x, y, pixel) in base.enumerate_pixels_mut() {
            *pixel = blend(*pixel, *self.canvas.get_pixel(x, y));
        }
        Ok(base)
    }
}

fn blend(base: Rgb<u8>, over: Rgba<u8>) -> Rgb<u8> {
    let alpha = over[3] as f32 / 255.0;
    let mix = |b: u8, o: u8| (o as f32 * alpha + b as f32 * (1.0 - alpha)).round() as u8;
    Rgb([
        mix(base[0], over[0]),
        mix(base[1], over[1]),
        mix(base[2], over[2]),
    ])
}

impl DisplaySurface for RasterSurface {
    fn dimensions(&self) -> Dimensions {
        let (width, height) = self.canvas.dimensions();
        Dimensions::new(width, height)
    }

    fn clear(&mut self) -> Result<(), RenderError> {
        if self.dimensions().is_empty() {
            return Err(RenderError::EmptySurface);
        }
        for pixel in self.canvas.pixels_mut() {
            *pixel = TRANSPARENT;
        }
        Ok(())
    }

    fn stroke_rect(
        &mut self,
        rect: &BoundingBox,
        color: Color,
        thickness: u32,
    ) -> Result<(), RenderError> {
        let x = rect.x.round() as i32;
        let y = rect.y.round() as i32;
        let width = rect.width.round().max(1.0) as u32;
        let height = rect.height.round().max(1.0) as u32;

        for inset in 0..thickness.max(1) {
            let w = width.saturating_sub(2 * inset);
            let h = height.saturating_sub(2 * inset);
            if w == 0 || h == 0 {
                break;
            }
            let offset = inset as i32;
            draw_hollow_rect_mut(
                &mut self.canvas,
                Rect::at(x + offset, y + offset).of_size(w, h),
                Rgba(color),
            );
        }
        Ok(())
    }

    fn fill_text(
        &mut self,
        x: f64,
        y: f64,
        text: &str,
        color: Color,
        size: f32,
    ) -> Result<(), RenderError> {
        let Some(font) = &self.font else {
            log::trace!("No font loaded, skipping text '{text}'");
            return Ok(());
        };
        draw_text_mut(
            &mut self.canvas,
            Rgba(color),
            x.round() as i32,
            y.round() as i32,
            size,
            font,
            text,
        );
        Ok(())
    }
}
