use std::time::Duration;

/// Live-mode tick period.
pub const DEFAULT_CADENCE: Duration = Duration::from_millis(100);

/// Upper bound on waiting for a still image to finish decoding.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default input resolution of the lightweight face detector.
pub const DEFAULT_INPUT_SIZE: u32 = 416;

pub const DEFAULT_SCORE_THRESHOLD: f64 = 0.5;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp"];
