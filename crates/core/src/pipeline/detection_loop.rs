use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::capture::domain::frame_source::{AcquisitionError, CaptureMode, FrameSource};
use crate::detection::domain::inference_adapter::{InferenceAdapter, InferenceOptions};
use crate::overlay::domain::display_surface::SharedSurface;
use crate::pipeline::inference_worker::{InferenceWorker, Job, Publisher};
use crate::pipeline::pipeline_logger::SharedLogger;
use crate::pipeline::result_store::ResultStore;
use crate::pipeline::ticker::Ticker;
use crate::shared::constants::{DEFAULT_CADENCE, DEFAULT_READY_TIMEOUT};
use crate::shared::frame::Frame;

const MIN_CADENCE: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// What a single cadence tick did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TickOutcome {
    /// The loop is not running; nothing happened.
    NotRunning,
    /// A previous inference call is still in flight.
    SkippedBusy,
    /// The source had no frame yet.
    SkippedNoFrame,
    /// A frame was handed to the inference worker.
    Dispatched { frame_index: usize },
}

/// Who drives ticks while the loop is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickDriver {
    /// A timer thread ticks every cadence period in live mode; still mode
    /// ticks once on start.
    Timer,
    /// The embedder calls [`DetectionLoop::tick`] itself.
    Manual,
}

#[derive(Clone, Debug)]
pub struct LoopConfig {
    pub mode: CaptureMode,
    pub cadence: Duration,
    pub driver: TickDriver,
    /// How long `start()` waits for the first frame.
    pub ready_timeout: Duration,
    pub options: InferenceOptions,
}

impl LoopConfig {
    pub fn new(mode: CaptureMode) -> Self {
        Self {
            mode,
            cadence: DEFAULT_CADENCE,
            driver: TickDriver::Timer,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            options: InferenceOptions::default(),
        }
    }

    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_driver(mut self, driver: TickDriver) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_options(mut self, options: InferenceOptions) -> Self {
        self.options = options;
        self
    }
}

/// Lifecycle state. `epoch` is the store epoch handed out by the last
/// activate; jobs carry it so the store can reject results from a stopped
/// session.
struct Session {
    state: LoopState,
    epoch: u64,
}

struct LoopCore {
    session: Mutex<Session>,
    source: Mutex<Box<dyn FrameSource>>,
    worker: InferenceWorker,
    logger: SharedLogger,
}

impl LoopCore {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn source(&self) -> MutexGuard<'_, Box<dyn FrameSource>> {
        self.source.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn info(&self, message: &str) {
        if let Ok(mut logger) = self.logger.lock() {
            logger.info(message);
        }
    }

    fn tick(&self) -> TickOutcome {
        let outcome = self.run_tick();
        match outcome {
            TickOutcome::Dispatched { frame_index } => {
                log::trace!("Dispatched frame {frame_index}")
            }
            other => log::trace!("Tick skipped: {other:?}"),
        }
        if let Ok(mut logger) = self.logger.lock() {
            logger.tick(outcome);
        }
        outcome
    }

    fn run_tick(&self) -> TickOutcome {
        let epoch = {
            let session = self.session();
            if session.state != LoopState::Running {
                return TickOutcome::NotRunning;
            }
            session.epoch
        };
        if self.worker.is_busy() {
            return TickOutcome::SkippedBusy;
        }
        let Some(frame) = self.source().current_frame() else {
            return TickOutcome::SkippedNoFrame;
        };
        let frame_index = frame.index();
        if self.worker.try_dispatch(Job { frame, epoch }) {
            TickOutcome::Dispatched { frame_index }
        } else {
            TickOutcome::SkippedBusy
        }
    }
}

/// Drives capture → inference → publish for one pipeline instance.
///
/// States go `Idle → Starting → Running → Stopping → Idle`. While running,
/// each tick hands the current frame to a single inference worker; a tick
/// that arrives while the previous call is still in flight is skipped, never
/// queued. Results are mapped to the display surface's size at publish time.
pub struct DetectionLoop {
    core: Arc<LoopCore>,
    store: Arc<ResultStore>,
    config: LoopConfig,
    ticker: Mutex<Option<Ticker>>,
    lifecycle: Mutex<()>,
}

impl DetectionLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        adapter: Box<dyn InferenceAdapter>,
        store: Arc<ResultStore>,
        surface: SharedSurface,
        config: LoopConfig,
        logger: SharedLogger,
    ) -> Self {
        let session = Mutex::new(Session {
            state: LoopState::Idle,
            epoch: 0,
        });
        let publisher = Publisher {
            store: store.clone(),
            surface,
            logger: logger.clone(),
        };
        let worker = InferenceWorker::spawn(adapter, config.options.clone(), publisher);

        Self {
            core: Arc::new(LoopCore {
                session,
                source: Mutex::new(source),
                worker,
                logger,
            }),
            store,
            config,
            ticker: Mutex::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn state(&self) -> LoopState {
        self.core.session().state
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn is_inference_in_flight(&self) -> bool {
        self.core.worker.is_busy()
    }

    /// Latest frame from the source, e.g. to composite an overlay snapshot.
    /// `None` unless running.
    pub fn current_frame(&self) -> Option<Frame> {
        if self.state() != LoopState::Running {
            return None;
        }
        self.core.source().current_frame()
    }

    /// Acquires the source and begins ticking. A no-op while already running.
    ///
    /// On failure the loop stays `Idle` and the store stays inactive.
    pub fn start(&self) -> Result<(), AcquisitionError> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut session = self.core.session();
            if session.state != LoopState::Idle {
                return Ok(());
            }
            session.state = LoopState::Starting;
        }
        log::info!("Starting detection loop ({} mode)", self.config.mode.name());

        if let Err(e) = self.acquire_source() {
            self.core.session().state = LoopState::Idle;
            log::warn!("Detection loop failed to start: {e}");
            return Err(e);
        }

        let epoch = self.store.activate();
        {
            let mut session = self.core.session();
            session.epoch = epoch;
            session.state = LoopState::Running;
        }
        self.core
            .info(&format!("Detection loop running ({} mode)", self.config.mode.name()));

        if self.config.driver == TickDriver::Timer {
            if self.config.mode.is_live() {
                let core = self.core.clone();
                let period = self.config.cadence.max(MIN_CADENCE);
                let ticker = Ticker::spawn(period, move || {
                    core.tick();
                });
                *self.ticker.lock().unwrap_or_else(|e| e.into_inner()) = Some(ticker);
            } else {
                self.core.tick();
            }
        }
        Ok(())
    }

    /// Runs one cadence step. Normally called by the timer; exposed for
    /// [`TickDriver::Manual`].
    pub fn tick(&self) -> TickOutcome {
        self.core.tick()
    }

    /// Cancels ticking, clears the store and releases the source.
    ///
    /// The store is cleared before this returns. A call still in flight runs
    /// to completion but its result is discarded. Stopping an idle loop is a
    /// no-op.
    pub fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut session = self.core.session();
            if session.state == LoopState::Idle {
                return;
            }
            session.state = LoopState::Stopping;
        }
        // Observers run on this thread, so the session lock must be released
        // before the clear notifies them.
        self.store.clear();

        let ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut ticker) = ticker {
            ticker.stop();
        }
        self.core.source().close();
        self.core.session().state = LoopState::Idle;
        self.core.info("Detection loop stopped");

        if let Ok(logger) = self.core.logger.lock() {
            logger.summary();
        }
    }

    fn acquire_source(&self) -> Result<(), AcquisitionError> {
        let mut source = self.core.source();
        let info = source.open(&self.config.mode)?;
        if let Err(e) = source.wait_ready(self.config.ready_timeout) {
            source.close();
            return Err(e);
        }
        match info.dimensions {
            Some(dims) => log::info!("Source ready: {dims} @ {:.1} fps", info.fps),
            None => log::info!("Source ready @ {:.1} fps", info.fps),
        }
        Ok(())
    }
}

impl Drop for DetectionLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::domain::device_registry::{DeviceLease, DeviceRegistry};
    use crate::capture::domain::frame_source::SourceInfo;
    use crate::capture::infrastructure::still_image_source::StillImageSource;
    use crate::detection::domain::face_attributes::{
        Emotion, ExpressionScores, Gender, GenderEstimate,
    };
    use crate::detection::domain::face_detection::RawDetection;
    use crate::detection::domain::inference_adapter::InferenceError;
    use crate::detection::infrastructure::replay_inference_adapter::{
        ReplayInferenceAdapter, ReplayScript,
    };
    use crate::overlay::domain::display_surface::DisplaySurface;
    use crate::overlay::domain::face_summary::FaceSummary;
    use crate::overlay::domain::overlay_renderer::OverlayRenderer;
    use crate::overlay::infrastructure::raster_surface::RasterSurface;
    use crate::pipeline::pipeline_logger::{NullPipelineLogger, StdoutPipelineLogger};
    use crate::pipeline::result_store::StreamState;
    use crate::shared::bounding_box::BoundingBox;
    use crate::shared::dimensions::Dimensions;
    use approx::assert_relative_eq;
    use crossbeam_channel::{Receiver, Sender};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const NATIVE: Dimensions = Dimensions::new(640, 480);
    const DISPLAY: Dimensions = Dimensions::new(320, 240);
    const WAIT: Duration = Duration::from_secs(5);

    // --- Stubs ---

    #[derive(Default, Clone)]
    struct SourceCounters {
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    struct FakeSource {
        counters: SourceCounters,
        next_index: usize,
        has_frames: bool,
        fail_open: bool,
        registry: Option<Arc<DeviceRegistry>>,
        lease: Option<DeviceLease>,
        open: bool,
    }

    impl FakeSource {
        fn new(counters: SourceCounters) -> Self {
            Self {
                counters,
                next_index: 0,
                has_frames: true,
                fail_open: false,
                registry: None,
                lease: None,
                open: false,
            }
        }
    }

    impl FrameSource for FakeSource {
        fn open(&mut self, mode: &CaptureMode) -> Result<SourceInfo, AcquisitionError> {
            if self.fail_open {
                return Err(AcquisitionError::DeviceOpen {
                    device: "fake".into(),
                    reason: "permission denied".into(),
                });
            }
            if let (Some(registry), CaptureMode::Live { device }) = (&self.registry, mode) {
                self.lease = Some(registry.acquire(device)?);
            }
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            self.open = true;
            Ok(SourceInfo {
                dimensions: Some(NATIVE),
                fps: 30.0,
            })
        }

        fn current_frame(&mut self) -> Option<Frame> {
            if !self.open || !self.has_frames {
                return None;
            }
            let index = self.next_index;
            self.next_index += 1;
            let size = (NATIVE.width * NATIVE.height * 3) as usize;
            Some(Frame::new(vec![0; size], NATIVE.width, NATIVE.height, 3, index))
        }

        fn close(&mut self) {
            if self.open {
                self.counters.closes.fetch_add(1, Ordering::SeqCst);
            }
            self.open = false;
            self.lease = None;
        }
    }

    /// Blocks every detect call until the test sends its result.
    struct GatedAdapter {
        gate: Receiver<Result<Vec<RawDetection>, InferenceError>>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl InferenceAdapter for GatedAdapter {
        fn detect(
            &mut self,
            _frame: &Frame,
            _options: &InferenceOptions,
        ) -> Result<Vec<RawDetection>, InferenceError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            let result = self.gate.recv_timeout(WAIT).unwrap_or(Ok(Vec::new()));
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    struct Gate {
        tx: Sender<Result<Vec<RawDetection>, InferenceError>>,
        max_active: Arc<AtomicUsize>,
    }

    fn gated_adapter() -> (Box<dyn InferenceAdapter>, Gate) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let max_active = Arc::new(AtomicUsize::new(0));
        let adapter = GatedAdapter {
            gate: rx,
            active: Arc::new(AtomicUsize::new(0)),
            max_active: max_active.clone(),
        };
        (Box::new(adapter), Gate { tx, max_active })
    }

    fn face() -> RawDetection {
        RawDetection {
            bbox: BoundingBox::new(100.0, 80.0, 200.0, 160.0),
            score: 0.98,
            age: Some(30.0),
            gender: Some(GenderEstimate::new(Gender::Female, 0.92)),
            expressions: ExpressionScores::new()
                .with(Emotion::Happy, 0.8)
                .with(Emotion::Neutral, 0.15)
                .with(Emotion::Sad, 0.05),
        }
    }

    fn replay(frames: Vec<Option<Vec<RawDetection>>>) -> Box<dyn InferenceAdapter> {
        Box::new(ReplayInferenceAdapter::new(Arc::new(ReplayScript { frames })))
    }

    fn raster(dims: Dimensions) -> Arc<Mutex<RasterSurface>> {
        Arc::new(Mutex::new(RasterSurface::new(dims)))
    }

    fn live() -> CaptureMode {
        CaptureMode::Live {
            device: "/dev/video0".into(),
        }
    }

    fn manual_loop(
        source: FakeSource,
        adapter: Box<dyn InferenceAdapter>,
        surface: Arc<Mutex<RasterSurface>>,
    ) -> DetectionLoop {
        DetectionLoop::new(
            Box::new(source),
            adapter,
            ResultStore::new(),
            surface,
            LoopConfig::new(live()).with_driver(TickDriver::Manual),
            NullPipelineLogger::shared(),
        )
    }

    fn wait_for_publish(rx: &Receiver<Arc<StreamState>>, count: u64) -> Arc<StreamState> {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let state = rx.recv_timeout(remaining).expect("no publish before deadline");
            if state.is_active() && state.publish_count() >= count {
                return state;
            }
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met before deadline");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // --- Lifecycle ---

    #[test]
    fn test_new_loop_is_idle() {
        let counters = SourceCounters::default();
        let detection_loop =
            manual_loop(FakeSource::new(counters.clone()), replay(vec![]), raster(DISPLAY));
        assert_eq!(detection_loop.state(), LoopState::Idle);
        assert!(!detection_loop.store().is_active());
        assert_eq!(detection_loop.tick(), TickOutcome::NotRunning);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_activates_store() {
        let counters = SourceCounters::default();
        let detection_loop =
            manual_loop(FakeSource::new(counters.clone()), replay(vec![]), raster(DISPLAY));

        detection_loop.start().unwrap();

        assert_eq!(detection_loop.state(), LoopState::Running);
        let state = detection_loop.store().snapshot();
        assert!(state.is_active());
        assert!(state.results().is_empty());
        assert_eq!(state.publish_count(), 0);
    }

    #[test]
    fn test_start_while_running_does_not_reacquire() {
        let counters = SourceCounters::default();
        let detection_loop =
            manual_loop(FakeSource::new(counters.clone()), replay(vec![]), raster(DISPLAY));

        detection_loop.start().unwrap();
        detection_loop.start().unwrap();

        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
        assert_eq!(detection_loop.state(), LoopState::Running);
    }

    #[test]
    fn test_stop_twice_matches_stop_once() {
        let counters = SourceCounters::default();
        let detection_loop =
            manual_loop(FakeSource::new(counters.clone()), replay(vec![]), raster(DISPLAY));
        detection_loop.start().unwrap();

        detection_loop.stop();
        let once = detection_loop.store().snapshot();
        detection_loop.stop();
        let twice = detection_loop.store().snapshot();

        assert_eq!(detection_loop.state(), LoopState::Idle);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(once.is_active(), twice.is_active());
        assert!(!twice.is_active());
        assert!(twice.results().is_empty());
    }

    #[test]
    fn test_current_frame_only_while_running() {
        let detection_loop = manual_loop(
            FakeSource::new(SourceCounters::default()),
            replay(vec![]),
            raster(DISPLAY),
        );
        assert!(detection_loop.current_frame().is_none());
        detection_loop.start().unwrap();
        let frame = detection_loop.current_frame().unwrap();
        assert_eq!(frame.dimensions(), NATIVE);
        detection_loop.stop();
        assert!(detection_loop.current_frame().is_none());
    }

    #[test]
    fn test_restart_after_stop() {
        let counters = SourceCounters::default();
        let detection_loop =
            manual_loop(FakeSource::new(counters.clone()), replay(vec![]), raster(DISPLAY));

        detection_loop.start().unwrap();
        detection_loop.stop();
        detection_loop.start().unwrap();

        assert_eq!(detection_loop.state(), LoopState::Running);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
        assert!(detection_loop.store().is_active());
    }

    #[test]
    fn test_acquisition_error_leaves_loop_idle() {
        let mut source = FakeSource::new(SourceCounters::default());
        source.fail_open = true;
        let detection_loop = manual_loop(source, replay(vec![]), raster(DISPLAY));

        let err = detection_loop.start().unwrap_err();

        assert!(matches!(err, AcquisitionError::DeviceOpen { .. }));
        assert_eq!(detection_loop.state(), LoopState::Idle);
        assert!(!detection_loop.store().is_active());
        assert_eq!(detection_loop.tick(), TickOutcome::NotRunning);
    }

    #[test]
    fn test_device_held_by_another_loop_is_busy() {
        let registry = DeviceRegistry::new();
        let mut first_source = FakeSource::new(SourceCounters::default());
        first_source.registry = Some(registry.clone());
        let mut second_source = FakeSource::new(SourceCounters::default());
        second_source.registry = Some(registry.clone());

        let first = manual_loop(first_source, replay(vec![]), raster(DISPLAY));
        let second = manual_loop(second_source, replay(vec![]), raster(DISPLAY));

        first.start().unwrap();
        let err = second.start().unwrap_err();
        assert!(matches!(err, AcquisitionError::DeviceBusy(d) if d == "/dev/video0"));
        assert_eq!(second.state(), LoopState::Idle);

        first.stop();
        assert!(!registry.is_held("/dev/video0"));
        second.start().unwrap();
        assert_eq!(second.state(), LoopState::Running);
    }

    // --- Ticking and backpressure ---

    #[test]
    fn test_tick_without_frame_is_skipped() {
        let mut source = FakeSource::new(SourceCounters::default());
        source.has_frames = false;
        let detection_loop = manual_loop(source, replay(vec![]), raster(DISPLAY));
        detection_loop.start().unwrap();

        assert_eq!(detection_loop.tick(), TickOutcome::SkippedNoFrame);
        assert!(!detection_loop.is_inference_in_flight());
    }

    #[test]
    fn test_tick_while_inference_in_flight_is_skipped() {
        let (adapter, gate) = gated_adapter();
        let detection_loop = manual_loop(
            FakeSource::new(SourceCounters::default()),
            adapter,
            raster(DISPLAY),
        );
        let rx = detection_loop.store().watch();
        detection_loop.start().unwrap();

        assert_eq!(
            detection_loop.tick(),
            TickOutcome::Dispatched { frame_index: 0 }
        );
        assert!(detection_loop.is_inference_in_flight());
        for _ in 0..5 {
            assert_eq!(detection_loop.tick(), TickOutcome::SkippedBusy);
        }

        gate.tx.send(Ok(vec![face()])).unwrap();
        wait_for_publish(&rx, 1);

        // skipped ticks never consumed a frame
        assert_eq!(
            detection_loop.tick(),
            TickOutcome::Dispatched { frame_index: 1 }
        );
        gate.tx.send(Ok(Vec::new())).unwrap();
        wait_for_publish(&rx, 2);

        assert_eq!(gate.max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_discards_in_flight_result() {
        let (adapter, gate) = gated_adapter();
        let logger = Arc::new(Mutex::new(StdoutPipelineLogger::new()));
        let store = ResultStore::new();
        let detection_loop = DetectionLoop::new(
            Box::new(FakeSource::new(SourceCounters::default())),
            adapter,
            store.clone(),
            raster(DISPLAY),
            LoopConfig::new(live()).with_driver(TickDriver::Manual),
            logger.clone(),
        );
        detection_loop.start().unwrap();
        assert!(matches!(
            detection_loop.tick(),
            TickOutcome::Dispatched { .. }
        ));

        detection_loop.stop();

        let state = store.snapshot();
        assert!(!state.is_active());
        assert!(state.results().is_empty());

        gate.tx.send(Ok(vec![face()])).unwrap();
        wait_until(|| logger.lock().unwrap().metrics_for("discarded_results").is_some());

        let state = store.snapshot();
        assert!(!state.is_active());
        assert!(state.results().is_empty());
        assert_eq!(state.publish_count(), 0);
    }

    #[test]
    fn test_result_from_previous_session_is_not_published_after_restart() {
        let (adapter, gate) = gated_adapter();
        let logger = Arc::new(Mutex::new(StdoutPipelineLogger::new()));
        let store = ResultStore::new();
        let detection_loop = DetectionLoop::new(
            Box::new(FakeSource::new(SourceCounters::default())),
            adapter,
            store.clone(),
            raster(DISPLAY),
            LoopConfig::new(live()).with_driver(TickDriver::Manual),
            logger.clone(),
        );
        detection_loop.start().unwrap();
        detection_loop.tick();
        detection_loop.stop();
        detection_loop.start().unwrap();

        gate.tx.send(Ok(vec![face()])).unwrap();
        wait_until(|| logger.lock().unwrap().metrics_for("discarded_results").is_some());

        assert!(store.is_active());
        assert_eq!(store.snapshot().publish_count(), 0);
    }

    #[test]
    fn test_subscriber_can_query_loop_while_notified() {
        let store = ResultStore::new();
        let detection_loop = Arc::new(DetectionLoop::new(
            Box::new(FakeSource::new(SourceCounters::default())),
            replay(vec![Some(vec![face()])]),
            store.clone(),
            raster(DISPLAY),
            LoopConfig::new(live()).with_driver(TickDriver::Manual),
            NullPipelineLogger::shared(),
        ));
        let (tx, rx) = crossbeam_channel::unbounded();
        let weak = Arc::downgrade(&detection_loop);
        store.subscribe(move |state| {
            if let Some(detection_loop) = weak.upgrade() {
                let seen = (
                    state.publish_count(),
                    detection_loop.state(),
                    detection_loop.current_frame().is_some(),
                );
                tx.send(seen).unwrap();
            }
        });

        detection_loop.start().unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (0, LoopState::Starting, false));

        detection_loop.tick();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (1, LoopState::Running, true));

        detection_loop.stop();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (0, LoopState::Stopping, false));
        assert_eq!(detection_loop.state(), LoopState::Idle);
    }

    #[test]
    fn test_display_size_is_read_at_publish_time() {
        let (adapter, gate) = gated_adapter();
        let surface = raster(DISPLAY);
        let detection_loop = manual_loop(
            FakeSource::new(SourceCounters::default()),
            adapter,
            surface.clone(),
        );
        let rx = detection_loop.store().watch();
        detection_loop.start().unwrap();
        detection_loop.tick();

        surface.lock().unwrap().resize(Dimensions::new(1280, 960));
        gate.tx.send(Ok(vec![face()])).unwrap();
        let state = wait_for_publish(&rx, 1);

        let bbox = state.results().detections()[0].bbox();
        assert_relative_eq!(bbox.x, 200.0);
        assert_relative_eq!(bbox.width, 400.0);
        assert_relative_eq!(bbox.height, 320.0);
    }

    #[test]
    fn test_tick_outcomes_reach_logger() {
        let logger = Arc::new(Mutex::new(StdoutPipelineLogger::new()));
        let mut source = FakeSource::new(SourceCounters::default());
        source.has_frames = false;
        let detection_loop = DetectionLoop::new(
            Box::new(source),
            replay(vec![]),
            ResultStore::new(),
            raster(DISPLAY),
            LoopConfig::new(live()).with_driver(TickDriver::Manual),
            logger.clone(),
        );
        detection_loop.tick();
        detection_loop.start().unwrap();
        detection_loop.tick();
        detection_loop.tick();

        detection_loop.stop();
        let logger = logger.lock().unwrap();
        assert_eq!(logger.tick_count(TickOutcome::NotRunning), 1);
        assert_eq!(logger.tick_count(TickOutcome::SkippedNoFrame), 2);
        assert_eq!(
            logger.messages(),
            &[
                "Detection loop running (live mode)".to_string(),
                "Detection loop stopped".to_string()
            ]
        );
    }

    // --- End-to-end ---

    #[test]
    fn test_live_face_is_scaled_labelled_and_ranked() {
        let detection_loop = manual_loop(
            FakeSource::new(SourceCounters::default()),
            replay(vec![Some(vec![face()])]),
            raster(DISPLAY),
        );
        let rx = detection_loop.store().watch();
        detection_loop.start().unwrap();
        detection_loop.tick();

        let state = wait_for_publish(&rx, 1);
        let detections = state.results().detections();
        assert_eq!(detections.len(), 1);
        assert_eq!(state.results().frame_index(), Some(0));

        let face = &detections[0];
        assert_relative_eq!(face.bbox().x, 50.0);
        assert_relative_eq!(face.bbox().y, 40.0);
        assert_relative_eq!(face.bbox().width, 100.0);
        assert_relative_eq!(face.bbox().height, 80.0);
        assert_eq!(face.label().as_deref(), Some("30 yrs, female (92.0%)"));
        assert_eq!(
            face.emotion_ranking(),
            "happy (80.0%), neutral (15.0%), sad (5.0%)"
        );
    }

    #[test]
    fn test_published_results_keep_the_analysed_frame() {
        let (adapter, gate) = gated_adapter();
        let detection_loop = manual_loop(
            FakeSource::new(SourceCounters::default()),
            adapter,
            raster(DISPLAY),
        );
        let rx = detection_loop.store().watch();
        detection_loop.start().unwrap();
        assert_eq!(detection_loop.tick(), TickOutcome::Dispatched { frame_index: 0 });

        let newer = detection_loop.current_frame().unwrap();
        assert!(newer.index() > 0);
        gate.tx.send(Ok(vec![face()])).unwrap();

        let state = wait_for_publish(&rx, 1);
        let analysed = state.results().frame().unwrap();
        assert_eq!(analysed.index(), 0);
        assert_eq!(analysed.dimensions(), NATIVE);
    }

    #[test]
    fn test_still_image_without_faces_clears_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("empty-room.png");
        image::RgbImage::from_pixel(64, 48, image::Rgb([90, 90, 90]))
            .save(&path)
            .unwrap();

        let surface = raster(Dimensions::new(64, 48));
        surface
            .lock()
            .unwrap()
            .stroke_rect(&BoundingBox::new(1.0, 1.0, 10.0, 10.0), [255, 0, 0, 255], 1)
            .unwrap();
        let store = ResultStore::new();
        OverlayRenderer::new(surface.clone(), Default::default()).attach(&store);
        let rx = store.watch();

        let detection_loop = DetectionLoop::new(
            Box::new(StillImageSource::new()),
            replay(vec![Some(Vec::new())]),
            store.clone(),
            surface.clone(),
            LoopConfig::new(CaptureMode::Still { path }),
            NullPipelineLogger::shared(),
        );
        detection_loop.start().unwrap();

        let state = wait_for_publish(&rx, 1);
        assert!(state.results().is_empty());
        assert!(FaceSummary::lines(&state).is_empty());
        assert!(surface
            .lock()
            .unwrap()
            .image()
            .pixels()
            .all(|p| p.0[3] == 0));
    }

    #[test]
    fn test_inference_failure_publishes_empty_then_recovers() {
        let detection_loop = manual_loop(
            FakeSource::new(SourceCounters::default()),
            replay(vec![None, Some(vec![face()])]),
            raster(DISPLAY),
        );
        let rx = detection_loop.store().watch();
        detection_loop.start().unwrap();

        detection_loop.tick();
        let failed = wait_for_publish(&rx, 1);
        assert!(failed.results().is_empty());
        assert_eq!(failed.results().frame_index(), Some(0));

        detection_loop.tick();
        let recovered = wait_for_publish(&rx, 2);
        assert_eq!(recovered.results().len(), 1);
        assert_eq!(detection_loop.state(), LoopState::Running);
    }

    #[test]
    fn test_timer_driver_ticks_until_stopped() {
        let store = ResultStore::new();
        let rx = store.watch();
        let detection_loop = DetectionLoop::new(
            Box::new(FakeSource::new(SourceCounters::default())),
            replay(vec![Some(vec![face()])]),
            store.clone(),
            raster(DISPLAY),
            LoopConfig::new(live()).with_cadence(Duration::from_millis(2)),
            NullPipelineLogger::shared(),
        );
        detection_loop.start().unwrap();
        wait_for_publish(&rx, 3);

        detection_loop.stop();
        let count = store.snapshot().publish_count();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(count, 0);
        assert!(!store.is_active());
        assert_eq!(store.snapshot().publish_count(), 0);
    }

    #[test]
    fn test_options_reach_adapter() {
        let options = InferenceOptions {
            with_age_gender: false,
            ..InferenceOptions::default()
        };
        let detection_loop = DetectionLoop::new(
            Box::new(FakeSource::new(SourceCounters::default())),
            replay(vec![Some(vec![face()])]),
            ResultStore::new(),
            raster(DISPLAY),
            LoopConfig::new(live())
                .with_driver(TickDriver::Manual)
                .with_options(options),
            NullPipelineLogger::shared(),
        );
        let rx = detection_loop.store().watch();
        detection_loop.start().unwrap();
        detection_loop.tick();

        let state = wait_for_publish(&rx, 1);
        let face = &state.results().detections()[0];
        assert!(face.age().is_none());
        assert!(face.label().is_none());
        assert!(!face.expressions().is_empty());
    }
}
