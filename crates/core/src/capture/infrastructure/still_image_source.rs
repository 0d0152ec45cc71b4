use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};

use crate::capture::domain::frame_source::{AcquisitionError, CaptureMode, FrameSource, SourceInfo};
use crate::shared::dimensions::Dimensions;
use crate::shared::frame::Frame;

type DecodeResult = Result<Frame, String>;

/// Serves a single decoded image as the current frame.
///
/// Decoding runs on a background thread so `open` returns immediately; the
/// frame becomes available once [`FrameSource::wait_ready`] succeeds (or a
/// later `current_frame` call observes the finished decode).
pub struct StillImageSource {
    path: Option<PathBuf>,
    pending: Option<Receiver<DecodeResult>>,
    frame: Option<Frame>,
}

impl StillImageSource {
    pub fn new() -> Self {
        Self {
            path: None,
            pending: None,
            frame: None,
        }
    }

    /// Reads the pixel size from the file header without a full decode.
    pub fn read_dimensions(path: &Path) -> Option<Dimensions> {
        image::image_dimensions(path)
            .ok()
            .map(|(w, h)| Dimensions::new(w, h))
    }

    fn finish(&mut self, result: DecodeResult) -> Result<(), AcquisitionError> {
        self.pending = None;
        match result {
            Ok(frame) => {
                log::debug!("Decoded still image {}x{}", frame.width(), frame.height());
                self.frame = Some(frame);
                Ok(())
            }
            Err(reason) => Err(AcquisitionError::Decode {
                path: self.path.clone().unwrap_or_default(),
                reason,
            }),
        }
    }
}

impl Default for StillImageSource {
    fn default() -> Self {
        Self::new()
    }
}

fn decode(path: &Path) -> DecodeResult {
    let img = image::open(path).map_err(|e| e.to_string())?;
    Ok(Frame::from_rgb_image(img.to_rgb8(), 0))
}

impl FrameSource for StillImageSource {
    fn open(&mut self, mode: &CaptureMode) -> Result<SourceInfo, AcquisitionError> {
        let CaptureMode::Still { path } = mode else {
            return Err(AcquisitionError::UnsupportedMode(mode.name()));
        };
        if !path.is_file() {
            return Err(AcquisitionError::NotFound(path.clone()));
        }

        self.close();
        let (tx, rx) = crossbeam_channel::bounded::<DecodeResult>(1);
        let decode_path = path.clone();
        thread::spawn(move || {
            let _ = tx.send(decode(&decode_path));
        });

        self.path = Some(path.clone());
        self.pending = Some(rx);

        Ok(SourceInfo {
            dimensions: Self::read_dimensions(path),
            fps: 0.0,
        })
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<(), AcquisitionError> {
        if self.frame.is_some() {
            return Ok(());
        }
        let Some(rx) = self.pending.as_ref() else {
            return Err(AcquisitionError::NotReady(timeout));
        };
        match rx.recv_timeout(timeout) {
            Ok(result) => self.finish(result),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                Err(AcquisitionError::NotReady(timeout))
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                self.finish(Err("decoder thread exited".to_string()))
            }
        }
    }

    fn current_frame(&mut self) -> Option<Frame> {
        if self.frame.is_none() {
            let polled = self.pending.as_ref().map(|rx| rx.try_recv());
            match polled {
                Some(Ok(result)) => {
                    if let Err(e) = self.finish(result) {
                        log::warn!("{e}");
                    }
                }
                Some(Err(TryRecvError::Disconnected)) => self.pending = None,
                Some(Err(TryRecvError::Empty)) | None => {}
            }
        }
        self.frame.clone()
    }

    fn close(&mut self) {
        self.path = None;
        self.pending = None;
        self.frame = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_image(dir: &Path, width: u32, height: u32) -> PathBuf {
        let path = dir.join("test.png");
        let mut img = image::RgbImage::new(width, height);
        for pixel in img.pixels_mut() {
            *pixel = image::Rgb([50, 100, 200]);
        }
        img.save(&path).unwrap();
        path
    }

    fn still(path: &Path) -> CaptureMode {
        CaptureMode::Still {
            path: path.to_path_buf(),
        }
    }

    #[test]
    fn test_open_reports_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_image(dir.path(), 100, 80);
        let mut source = StillImageSource::new();
        let info = source.open(&still(&path)).unwrap();
        assert_eq!(info.dimensions, Some(Dimensions::new(100, 80)));
        assert_eq!(info.fps, 0.0);
    }

    #[test]
    fn test_frame_available_after_wait_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_image(dir.path(), 100, 80);
        let mut source = StillImageSource::new();
        source.open(&still(&path)).unwrap();
        source.wait_ready(Duration::from_secs(5)).unwrap();

        let frame = source.current_frame().unwrap();
        assert_eq!(frame.dimensions(), Dimensions::new(100, 80));
        assert_eq!(frame.channels(), 3);
        assert_eq!(&frame.data()[..3], &[50, 100, 200]);
    }

    #[test]
    fn test_current_frame_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_image(dir.path(), 10, 10);
        let mut source = StillImageSource::new();
        source.open(&still(&path)).unwrap();
        source.wait_ready(Duration::from_secs(5)).unwrap();
        assert!(source.current_frame().is_some());
        assert!(source.current_frame().is_some());
    }

    #[test]
    fn test_open_nonexistent_fails() {
        let mut source = StillImageSource::new();
        let err = source.open(&still(Path::new("/nonexistent/test.png"))).unwrap_err();
        assert!(matches!(err, AcquisitionError::NotFound(_)));
    }

    #[test]
    fn test_undecodable_file_fails_on_wait_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"definitely not a png").unwrap();

        let mut source = StillImageSource::new();
        source.open(&still(&path)).unwrap();
        let err = source.wait_ready(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, AcquisitionError::Decode { .. }));
        assert!(source.current_frame().is_none());
    }

    #[test]
    fn test_live_mode_is_rejected() {
        let mut source = StillImageSource::new();
        let err = source
            .open(&CaptureMode::Live {
                device: "/dev/video0".into(),
            })
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::UnsupportedMode("live")));
    }

    #[test]
    fn test_wait_ready_without_open_is_not_ready() {
        let mut source = StillImageSource::new();
        assert!(matches!(
            source.wait_ready(Duration::from_millis(1)),
            Err(AcquisitionError::NotReady(_))
        ));
    }

    #[test]
    fn test_close_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_image(dir.path(), 10, 10);
        let mut source = StillImageSource::new();
        source.open(&still(&path)).unwrap();
        source.close();
        source.close();
        assert!(source.current_frame().is_none());
    }
}
