use std::sync::Mutex;

use crate::detection::domain::face_detection::DisplayDetection;
use crate::overlay::domain::display_surface::{
    DisplaySurface, OverlayStyle, RenderError, SharedSurface,
};
use crate::pipeline::result_store::{ResultStore, StreamState, SubscriptionId};
use crate::shared::dimensions::Dimensions;

/// Gap between a box edge and the text stacked against it.
const TEXT_MARGIN: f64 = 2.0;

/// Draws the current result set onto a display surface.
///
/// Every draw clears the surface first and repaints all detections, so
/// rendering the same state twice yields the same pixels.
pub struct OverlayRenderer {
    surface: SharedSurface,
    style: OverlayStyle,
    skip_unchanged: bool,
    last_drawn: Mutex<Option<(Vec<DisplayDetection>, Dimensions)>>,
}

impl OverlayRenderer {
    pub fn new(surface: SharedSurface, style: OverlayStyle) -> Self {
        Self {
            surface,
            style,
            skip_unchanged: false,
            last_drawn: Mutex::new(None),
        }
    }

    /// Skip the repaint when detections and surface size match the previous
    /// draw. Clears are never skipped.
    pub fn with_skip_unchanged(mut self, skip: bool) -> Self {
        self.skip_unchanged = skip;
        self
    }

    pub fn style(&self) -> &OverlayStyle {
        &self.style
    }

    /// Repaints the surface for `state`. Returns `false` when the draw was
    /// suppressed as unchanged.
    pub fn render(&self, state: &StreamState) -> Result<bool, RenderError> {
        let mut surface = self
            .surface
            .lock()
            .map_err(|e| RenderError::Unavailable(e.to_string()))?;
        let dims = surface.dimensions();
        if dims.is_empty() {
            return Err(RenderError::EmptySurface);
        }

        let mut last_drawn = self.last_drawn.lock().unwrap_or_else(|e| e.into_inner());
        let detections = state.results().detections();

        if !state.is_active() || detections.is_empty() {
            surface.clear()?;
            *last_drawn = None;
            return Ok(true);
        }

        if self.skip_unchanged {
            if let Some((previous, previous_dims)) = last_drawn.as_ref() {
                if previous.as_slice() == detections && *previous_dims == dims {
                    log::trace!("Overlay unchanged, skipping redraw");
                    return Ok(false);
                }
            }
        }

        // Forget the previous draw first so a failed repaint is retried.
        *last_drawn = None;
        surface.clear()?;
        for detection in detections {
            self.draw_detection(&mut *surface, detection)?;
        }
        *last_drawn = Some((detections.to_vec(), dims));
        Ok(true)
    }

    /// Renders on every store change until the store is dropped. Render
    /// failures are logged and that draw is skipped.
    pub fn attach(self, store: &ResultStore) -> SubscriptionId {
        store.subscribe(move |state| {
            if let Err(e) = self.render(state) {
                log::warn!("Overlay draw skipped: {e}");
            }
        })
    }

    fn draw_detection(
        &self,
        surface: &mut dyn DisplaySurface,
        detection: &DisplayDetection,
    ) -> Result<(), RenderError> {
        let style = &self.style;
        let bbox = detection.bbox();
        surface.stroke_rect(bbox, style.box_color, style.line_width)?;

        if let Some(label) = detection.label() {
            let y = (bbox.y - style.line_height - TEXT_MARGIN).max(0.0);
            surface.fill_text(bbox.x, y, &label, style.text_color, style.font_size)?;
        }

        let top = bbox.bottom() + TEXT_MARGIN;
        for (i, line) in detection.expressions().ranked_lines().iter().enumerate() {
            let y = top + i as f64 * style.line_height;
            surface.fill_text(bbox.x, y, line, style.text_color, style.font_size)?;
        }
        Ok(())
    }
}
