use crate::detection::domain::face_detection::{DisplayDetection, RawDetection};
use crate::shared::bounding_box::BoundingBox;
use crate::shared::dimensions::Dimensions;

/// Independent horizontal and vertical scale factors between two pixel spaces.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleFactors {
    pub sx: f64,
    pub sy: f64,
}

impl ScaleFactors {
    /// Factors taking `from` coordinates to `to` coordinates. `None` when
    /// `from` has a zero dimension.
    pub fn between(from: Dimensions, to: Dimensions) -> Option<Self> {
        if from.is_empty() {
            return None;
        }
        Some(Self {
            sx: to.width as f64 / from.width as f64,
            sy: to.height as f64 / from.height as f64,
        })
    }

    /// Applying `self` then `next` equals applying the product.
    pub fn then(self, next: ScaleFactors) -> Self {
        Self {
            sx: self.sx * next.sx,
            sy: self.sy * next.sy,
        }
    }

    pub fn apply(&self, bbox: &BoundingBox) -> BoundingBox {
        bbox.scaled(self.sx, self.sy)
    }
}

/// Rescales raw detections from native frame space into display space.
///
/// No aspect-ratio correction is applied: the caller is expected to size the
/// display surface to the native aspect. A degenerate native size maps to
/// an empty result since nothing can be placed.
pub fn map(raw: &[RawDetection], native: Dimensions, display: Dimensions) -> Vec<DisplayDetection> {
    let Some(factors) = ScaleFactors::between(native, display) else {
        log::warn!("Cannot map detections from degenerate native size {native}");
        return Vec::new();
    };
    raw.iter()
        .map(|d| DisplayDetection::from_raw(d, factors.apply(&d.bbox)))
        .collect()
}

/// Rescales already-mapped detections, e.g. after the surface was resized.
pub fn rescale(detections: &[DisplayDetection], factors: ScaleFactors) -> Vec<DisplayDetection> {
    detections
        .iter()
        .map(|d| d.with_box(factors.apply(d.bbox())))
        .collect()
}
