pub mod display_surface;
pub mod face_summary;
pub mod overlay_renderer;
