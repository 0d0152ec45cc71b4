mod settings;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;

use facelens_core::capture::domain::device_registry::DeviceRegistry;
use facelens_core::capture::domain::frame_source::{CaptureMode, FrameSource};
use facelens_core::capture::infrastructure::ffmpeg_capture_source::FfmpegCaptureSource;
use facelens_core::capture::infrastructure::still_image_source::StillImageSource;
use facelens_core::detection::infrastructure::replay_inference_adapter::{
    ReplayInferenceAdapter, ReplayScript,
};
use facelens_core::overlay::domain::display_surface::OverlayStyle;
use facelens_core::overlay::domain::face_summary::FaceSummary;
use facelens_core::overlay::domain::overlay_renderer::OverlayRenderer;
use facelens_core::overlay::infrastructure::raster_surface::RasterSurface;
use facelens_core::pipeline::detection_loop::{DetectionLoop, LoopConfig};
use facelens_core::pipeline::pipeline_logger::{SharedLogger, StdoutPipelineLogger};
use facelens_core::pipeline::result_store::{ResultStore, StreamState};
use facelens_core::shared::constants::IMAGE_EXTENSIONS;
use facelens_core::shared::dimensions::Dimensions;
use facelens_core::shared::frame::Frame;

use settings::Settings;

const DEFAULT_LIVE_DISPLAY: Dimensions = Dimensions::new(640, 480);

/// Face analysis overlay for live devices and still images.
#[derive(Parser)]
#[command(name = "facelens")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Analyse a single still image.
    Image {
        /// Input image file.
        input: PathBuf,

        /// Recorded detections (JSON replay script).
        #[arg(long)]
        detections: PathBuf,

        /// Write the annotated image here.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Overlay size as WIDTHxHEIGHT (defaults to the image size).
        #[arg(long)]
        display: Option<String>,
    },
    /// Analyse a capture device, stream URL or video file.
    Live {
        /// Device path, URL or file, e.g. /dev/video0.
        device: String,

        /// Recorded detections (JSON replay script).
        #[arg(long)]
        detections: PathBuf,

        /// ffmpeg input format, e.g. v4l2, avfoundation, dshow.
        #[arg(long)]
        format: Option<String>,

        /// How long to run before stopping.
        #[arg(long, default_value = "10")]
        seconds: u64,

        /// Write the last annotated frame here on exit.
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Overlay size as WIDTHxHEIGHT.
        #[arg(long)]
        display: Option<String>,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Settings file (defaults to the user config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Milliseconds between live ticks.
    #[arg(long, global = true)]
    cadence_ms: Option<u64>,

    /// TrueType/OpenType font for labels. Without one only boxes are drawn.
    #[arg(long, global = true)]
    font: Option<PathBuf>,

    /// Disable the expression estimator.
    #[arg(long, global = true)]
    no_expressions: bool,

    /// Disable the age and gender estimator.
    #[arg(long, global = true)]
    no_age_gender: bool,

    /// Minimum face detection score (0.0-1.0).
    #[arg(long, global = true)]
    score_threshold: Option<f64>,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let settings = resolve_settings(&cli.common)?;
    validate(&settings)?;

    match cli.command {
        Command::Image {
            input,
            detections,
            output,
            display,
        } => run_image(&settings, &input, &detections, output.as_deref(), display.as_deref()),
        Command::Live {
            device,
            detections,
            format,
            seconds,
            snapshot,
            display,
        } => run_live(
            &settings,
            &device,
            &detections,
            format,
            Duration::from_secs(seconds),
            snapshot.as_deref(),
            display.as_deref(),
        ),
    }
}

fn resolve_settings(common: &CommonArgs) -> Result<Settings, Box<dyn std::error::Error>> {
    let mut settings = match &common.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load(),
    };
    if let Some(ms) = common.cadence_ms {
        settings.cadence_ms = ms;
    }
    if let Some(font) = &common.font {
        settings.font = Some(font.clone());
    }
    if common.no_expressions {
        settings.inference.with_expressions = false;
    }
    if common.no_age_gender {
        settings.inference.with_age_gender = false;
    }
    if let Some(threshold) = common.score_threshold {
        settings.inference.score_threshold = threshold;
    }
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    if settings.cadence_ms == 0 {
        return Err("Cadence must be at least 1 ms".into());
    }
    let threshold = settings.inference.score_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(format!("Score threshold must be between 0.0 and 1.0, got {threshold}").into());
    }
    if let Some(font) = &settings.font {
        if !font.is_file() {
            return Err(format!("Font file not found: {}", font.display()).into());
        }
    }
    Ok(())
}

fn run_image(
    settings: &Settings,
    input: &Path,
    detections: &Path,
    output: Option<&Path>,
    display: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    if !input.is_file() {
        return Err(format!("Input file not found: {}", input.display()).into());
    }
    if !is_image(input) {
        log::warn!("{} has no known image extension", input.display());
    }
    let display = match display {
        Some(text) => parse_display(text)?,
        None => StillImageSource::read_dimensions(input)
            .ok_or_else(|| format!("Cannot read image size of {}", input.display()))?,
    };

    let source: Box<dyn FrameSource> = Box::new(StillImageSource::new());
    let mode = CaptureMode::Still {
        path: input.to_path_buf(),
    };
    let session = Session::build(settings, source, detections, mode, display)?;
    let updates = session.store.watch();

    session.detection_loop.start()?;
    let state = wait_for_results(&updates, Duration::from_millis(settings.ready_timeout_ms))?;
    print_summary(&state);

    if let Some(output) = output {
        session.write_snapshot(output)?;
    }
    session.finish();
    Ok(())
}

fn run_live(
    settings: &Settings,
    device: &str,
    detections: &Path,
    format: Option<String>,
    duration: Duration,
    snapshot: Option<&Path>,
    display: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let display = match display {
        Some(text) => parse_display(text)?,
        None => DEFAULT_LIVE_DISPLAY,
    };
    let mut capture = FfmpegCaptureSource::new(DeviceRegistry::new())
        .with_realtime_pacing(Path::new(device).is_file());
    if let Some(format) = format.or_else(|| settings.input_format.clone()) {
        capture = capture.with_input_format(format);
    }

    let mode = CaptureMode::Live {
        device: device.to_string(),
    };
    let session = Session::build(settings, Box::new(capture), detections, mode, display)?;
    let updates = session.store.watch();

    session.detection_loop.start()?;
    log::info!("Running for {}s", duration.as_secs());

    let deadline = Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match updates.recv_timeout(remaining) {
            Ok(state) if state.is_active() && state.publish_count() > 0 => {
                for line in FaceSummary::lines(&state) {
                    log::info!("{line}");
                }
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(snapshot) = snapshot {
        session.write_snapshot(snapshot)?;
    }
    print_summary(&session.store.snapshot());
    session.finish();
    Ok(())
}

/// Everything wired for one run: loop, store, overlay surface and stats.
struct Session {
    detection_loop: DetectionLoop,
    store: Arc<ResultStore>,
    surface: Arc<Mutex<RasterSurface>>,
    style: OverlayStyle,
    logger: Arc<Mutex<StdoutPipelineLogger>>,
}

impl Session {
    fn build(
        settings: &Settings,
        source: Box<dyn FrameSource>,
        detections: &Path,
        mode: CaptureMode,
        display: Dimensions,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let script = ReplayScript::load(detections)
            .map_err(|e| format!("Cannot load detections {}: {e}", detections.display()))?;
        log::info!("Loaded {} recorded frame(s)", script.frames.len());
        let adapter = Box::new(ReplayInferenceAdapter::new(Arc::new(script)));

        let mut raster = RasterSurface::new(display);
        if let Some(font) = &settings.font {
            raster = raster.with_font_file(font)?;
        }
        let surface = Arc::new(Mutex::new(raster));

        let store = ResultStore::new();
        OverlayRenderer::new(surface.clone(), settings.overlay.clone())
            .with_skip_unchanged(settings.skip_unchanged)
            .attach(&store);

        let logger = Arc::new(Mutex::new(StdoutPipelineLogger::new()));
        let shared_logger: SharedLogger = logger.clone();
        let config = LoopConfig::new(mode)
            .with_cadence(Duration::from_millis(settings.cadence_ms))
            .with_ready_timeout(Duration::from_millis(settings.ready_timeout_ms))
            .with_options(settings.inference.clone());

        let detection_loop =
            DetectionLoop::new(source, adapter, store.clone(), surface.clone(), config, shared_logger);
        Ok(Self {
            detection_loop,
            store,
            surface,
            style: settings.overlay.clone(),
            logger,
        })
    }

    /// Writes the latest result set over the frame it was computed from.
    fn write_snapshot(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let state = self.store.snapshot();
        let canvas = self
            .surface
            .lock()
            .map_err(|e| format!("Overlay surface unavailable: {e}"))?
            .empty_like();
        // Before the first publish there is nothing to draw; fall back to
        // the live frame so the snapshot is still written.
        let live;
        let frame = match state.results().frame() {
            Some(frame) => frame,
            None => {
                live = self
                    .detection_loop
                    .current_frame()
                    .ok_or("No frame captured yet")?;
                &live
            }
        };
        let annotated = render_snapshot(canvas, &self.style, &state, frame)?;
        annotated.save(path)?;
        log::info!("Annotated image written to {}", path.display());
        Ok(())
    }

    fn finish(self) {
        self.detection_loop.stop();
        if let Ok(logger) = self.logger.lock() {
            if let Some(summary) = logger.summary_string() {
                eprintln!("{summary}");
            }
        }
    }
}

/// Draws `state` on `canvas` and composites it over `frame`. Pass the frame
/// the results were computed from so boxes line up with the faces.
fn render_snapshot(
    canvas: RasterSurface,
    style: &OverlayStyle,
    state: &StreamState,
    frame: &Frame,
) -> Result<image::RgbImage, Box<dyn std::error::Error>> {
    let surface = Arc::new(Mutex::new(canvas));
    OverlayRenderer::new(surface.clone(), style.clone()).render(state)?;
    let annotated = surface
        .lock()
        .map_err(|e| format!("Overlay surface unavailable: {e}"))?
        .annotate(frame)?;
    Ok(annotated)
}

/// Blocks until the first result set is published.
fn wait_for_results(
    updates: &crossbeam_channel::Receiver<Arc<StreamState>>,
    timeout: Duration,
) -> Result<Arc<StreamState>, Box<dyn std::error::Error>> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let state = updates
            .recv_timeout(remaining)
            .map_err(|_| format!("No result within {}ms", timeout.as_millis()))?;
        if state.is_active() && state.publish_count() > 0 {
            return Ok(state);
        }
    }
}

fn print_summary(state: &StreamState) {
    let lines = FaceSummary::lines(state);
    if lines.is_empty() {
        println!("No faces detected");
    }
    for line in lines {
        println!("{line}");
    }
}

fn parse_display(text: &str) -> Result<Dimensions, Box<dyn std::error::Error>> {
    match Dimensions::parse(text) {
        Some(dims) if !dims.is_empty() => Ok(dims),
        _ => Err(format!("Display must be WIDTHxHEIGHT, got '{text}'").into()),
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}
