use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::capture::domain::device_registry::{DeviceLease, DeviceRegistry};
use crate::capture::domain::frame_source::{AcquisitionError, CaptureMode, FrameSource, SourceInfo};
use crate::shared::dimensions::Dimensions;
use crate::shared::frame::Frame;

type LatestFrame = Arc<Mutex<Option<Frame>>>;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Longest pacing sleep between stop checks.
const PACING_SLICE: Duration = Duration::from_millis(10);
/// How long `close()` waits for the capture thread before detaching it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Captures live video through ffmpeg (libavdevice + libavformat + libavcodec).
///
/// Accepts anything ffmpeg can open: a capture device (`/dev/video0` with
/// input format `v4l2`), a stream URL, or a video file. Decoding runs on a
/// dedicated thread that keeps only the most recent RGB frame, so a slow
/// consumer never builds up a backlog.
pub struct FfmpegCaptureSource {
    registry: Arc<DeviceRegistry>,
    input_format: Option<String>,
    realtime: bool,
    capture: Option<CaptureThread>,
}

struct CaptureThread {
    latest: LatestFrame,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    _lease: DeviceLease,
}

impl FfmpegCaptureSource {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            input_format: None,
            realtime: false,
            capture: None,
        }
    }

    /// Forces an ffmpeg input format, e.g. `"v4l2"`, `"avfoundation"`, `"dshow"`.
    pub fn with_input_format(mut self, format: impl Into<String>) -> Self {
        self.input_format = Some(format.into());
        self
    }

    /// Paces decoding at the stream's native frame rate. Useful for video
    /// files, which ffmpeg would otherwise decode as fast as possible.
    pub fn with_realtime_pacing(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

impl FrameSource for FfmpegCaptureSource {
    fn open(&mut self, mode: &CaptureMode) -> Result<SourceInfo, AcquisitionError> {
        let CaptureMode::Live { device } = mode else {
            return Err(AcquisitionError::UnsupportedMode(mode.name()));
        };
        self.close();

        let lease = self.registry.acquire(device)?;
        let latest: LatestFrame = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let handle = {
            let device = device.clone();
            let input_format = self.input_format.clone();
            let realtime = self.realtime;
            let latest = latest.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                capture_loop(&device, input_format.as_deref(), realtime, &latest, stop, ready_tx)
            })
        };

        let info = ready_rx.recv().unwrap_or_else(|_| {
            Err(AcquisitionError::DeviceOpen {
                device: device.clone(),
                reason: "capture thread exited".to_string(),
            })
        })?;

        log::info!(
            "Opened capture device {device} ({}, {:.1} fps)",
            info.dimensions.map(|d| d.to_string()).unwrap_or_default(),
            info.fps
        );
        self.capture = Some(CaptureThread {
            latest,
            stop,
            handle: Some(handle),
            _lease: lease,
        });
        Ok(info)
    }

    fn wait_ready(&mut self, timeout: Duration) -> Result<(), AcquisitionError> {
        let Some(capture) = self.capture.as_ref() else {
            return Err(AcquisitionError::NotReady(timeout));
        };
        let deadline = Instant::now() + timeout;
        loop {
            if capture
                .latest
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some()
            {
                return Ok(());
            }
            let finished = capture.handle.as_ref().map_or(true, |h| h.is_finished());
            if finished || Instant::now() >= deadline {
                return Err(AcquisitionError::NotReady(timeout));
            }
            thread::sleep(READY_POLL_INTERVAL);
        }
    }

    fn current_frame(&mut self) -> Option<Frame> {
        let capture = self.capture.as_ref()?;
        let latest = capture.latest.lock().unwrap_or_else(|e| e.into_inner());
        latest.clone()
    }

    fn close(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.shutdown(CLOSE_TIMEOUT);
        }
    }
}

impl CaptureThread {
    /// Raises `stop` and joins the thread if it exits within `timeout`.
    /// A thread stuck inside a blocking ffmpeg read is detached instead; it
    /// exits on its own once the read returns. The device lease is released
    /// either way.
    fn shutdown(mut self, timeout: Duration) {
        self.stop.store(true, Ordering::Relaxed);
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "Capture thread did not stop within {}ms, detaching it",
                    timeout.as_millis()
                );
                return;
            }
            thread::sleep(READY_POLL_INTERVAL);
        }
        if handle.join().is_err() {
            log::warn!("Capture thread panicked");
        }
    }
}

impl Drop for FfmpegCaptureSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_error(device: &str, reason: impl ToString) -> AcquisitionError {
    AcquisitionError::DeviceOpen {
        device: device.to_string(),
        reason: reason.to_string(),
    }
}

fn open_input(
    device: &str,
    input_format: Option<&str>,
    stop: Arc<AtomicBool>,
) -> Result<ffmpeg_next::format::context::Input, AcquisitionError> {
    ffmpeg_next::init().map_err(|e| open_error(device, e))?;

    // The interrupt callback aborts blocking network reads once `close()`
    // raises `stop`.
    let Some(name) = input_format else {
        return ffmpeg_next::format::input_with_interrupt(device, move || {
            stop.load(Ordering::Relaxed)
        })
        .map_err(|e| open_error(device, e));
    };

    ffmpeg_next::device::register_all();
    let format = ffmpeg_next::device::input::video()
        .find(|f| f.name() == name)
        .ok_or_else(|| open_error(device, format!("unknown input format '{name}'")))?;

    let ctx = ffmpeg_next::format::open_with(
        device,
        &ffmpeg_next::Format::Input(format),
        ffmpeg_next::Dictionary::new(),
    )
    .map_err(|e| open_error(device, e))?;

    match ctx {
        ffmpeg_next::format::context::Context::Input(ictx) => Ok(ictx),
        _ => Err(open_error(device, "not an input context")),
    }
}

fn capture_loop(
    device: &str,
    input_format: Option<&str>,
    realtime: bool,
    latest: &LatestFrame,
    stop: Arc<AtomicBool>,
    ready_tx: Sender<Result<SourceInfo, AcquisitionError>>,
) {
    let mut session = match DecodeSession::open(device, input_format, stop.clone()) {
        Ok(session) => session,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(session.info()));

    let interval = (realtime && session.fps > 0.0).then(|| Duration::from_secs_f64(1.0 / session.fps));
    let mut next_deadline = Instant::now();

    session.run(&stop, |frame| {
        *latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame);
        if let Some(interval) = interval {
            next_deadline += interval;
            pace_until(next_deadline, &stop);
        }
    });
    log::debug!("Capture thread for {device} finished");
}

/// Sleeps until `deadline` in short slices, returning early once `stop` is
/// raised.
fn pace_until(deadline: Instant, stop: &AtomicBool) {
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(PACING_SLICE));
    }
}

/// An opened input plus the decoder state for its best video stream.
struct DecodeSession {
    ictx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::decoder::Video,
    scaler: ffmpeg_next::software::scaling::Context,
    video_stream_index: usize,
    width: u32,
    height: u32,
    fps: f64,
    frame_index: usize,
}

impl DecodeSession {
    fn open(
        device: &str,
        input_format: Option<&str>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, AcquisitionError> {
        let ictx = open_input(device, input_format, stop)?;

        let stream = ictx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| AcquisitionError::NoVideoStream(device.to_string()))?;
        let video_stream_index = stream.index();

        let rate = stream.rate();
        let fps = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };

        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| open_error(device, e))?;
        let decoder = codec_ctx.decoder().video().map_err(|e| open_error(device, e))?;

        let width = decoder.width();
        let height = decoder.height();
        let scaler = ffmpeg_next::software::scaling::Context::get(
            decoder.format(),
            width,
            height,
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| open_error(device, e))?;

        Ok(Self {
            ictx,
            decoder,
            scaler,
            video_stream_index,
            width,
            height,
            fps,
            frame_index: 0,
        })
    }

    fn info(&self) -> SourceInfo {
        let dims = Dimensions::new(self.width, self.height);
        SourceInfo {
            dimensions: (!dims.is_empty()).then_some(dims),
            fps: self.fps,
        }
    }

    /// Decodes until end of input or until `stop` is raised.
    fn run(&mut self, stop: &AtomicBool, mut on_frame: impl FnMut(Frame)) {
        let mut packets_failed = 0usize;
        for (stream, packet) in self.ictx.packets() {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            if stream.index() != self.video_stream_index {
                continue;
            }
            if self.decoder.send_packet(&packet).is_err() {
                packets_failed += 1;
                continue;
            }
            while let Some(frame) =
                receive_frame(&mut self.decoder, &mut self.scaler, self.width, self.height, self.frame_index)
            {
                self.frame_index += 1;
                on_frame(frame);
            }
        }

        let _ = self.decoder.send_eof();
        while let Some(frame) =
            receive_frame(&mut self.decoder, &mut self.scaler, self.width, self.height, self.frame_index)
        {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            self.frame_index += 1;
            on_frame(frame);
        }

        if packets_failed > 0 {
            log::warn!("{packets_failed} packets could not be decoded");
        }
    }
}

fn receive_frame(
    decoder: &mut ffmpeg_next::decoder::Video,
    scaler: &mut ffmpeg_next::software::scaling::Context,
    width: u32,
    height: u32,
    index: usize,
) -> Option<Frame> {
    let mut decoded = ffmpeg_next::util::frame::video::Video::empty();
    decoder.receive_frame(&mut decoded).ok()?;
    let mut rgb_frame = ffmpeg_next::util::frame::video::Video::empty();
    if let Err(e) = scaler.run(&decoded, &mut rgb_frame) {
        log::warn!("Dropping frame {index}: {e}");
        return None;
    }
    let pixels = extract_rgb_pixels(&rgb_frame, width, height);
    Some(Frame::new(pixels, width, height, 3, index))
}

fn extract_rgb_pixels(
    rgb_frame: &ffmpeg_next::util::frame::video::Video,
    width: u32,
    height: u32,
) -> Vec<u8> {
    let stride = rgb_frame.stride(0);
    let data = rgb_frame.data(0);
    let row_bytes = width as usize * 3;

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let row_start = row * stride;
        pixels.extend_from_slice(&data[row_start..row_start + row_bytes]);
    }
    pixels
}
