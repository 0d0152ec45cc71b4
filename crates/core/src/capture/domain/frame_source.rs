use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::shared::dimensions::Dimensions;
use crate::shared::frame::Frame;

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("source does not support {0} mode")]
    UnsupportedMode(&'static str),
    #[error("image not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error("source not ready after {0:?}")]
    NotReady(Duration),
    #[error("device {0} is held by another pipeline")]
    DeviceBusy(String),
    #[error("failed to open device {device}: {reason}")]
    DeviceOpen { device: String, reason: String },
    #[error("no video stream on {0}")]
    NoVideoStream(String),
}

/// What to acquire: a live capture device or a single still image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    /// Device path, stream URL, or video file, e.g. `/dev/video0`.
    Live { device: String },
    Still { path: PathBuf },
}

impl CaptureMode {
    pub fn is_live(&self) -> bool {
        matches!(self, CaptureMode::Live { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            CaptureMode::Live { .. } => "live",
            CaptureMode::Still { .. } => "still",
        }
    }
}

/// Describes an opened source.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceInfo {
    /// Native pixel size; `None` until the first frame is known.
    pub dimensions: Option<Dimensions>,
    pub fps: f64,
}

/// Owns a capture device or a decoded still image and exposes its latest frame.
pub trait FrameSource: Send {
    /// Acquires the device or starts decoding the image.
    fn open(&mut self, mode: &CaptureMode) -> Result<SourceInfo, AcquisitionError>;

    /// Blocks until the first frame is available. Sources that decode
    /// asynchronously override this; the default reports ready at once.
    fn wait_ready(&mut self, _timeout: Duration) -> Result<(), AcquisitionError> {
        Ok(())
    }

    /// The latest frame, or `None` if none is ready yet.
    fn current_frame(&mut self) -> Option<Frame>;

    /// Releases the device. Closing a closed source is a no-op.
    fn close(&mut self);
}
