use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError};

use crate::detection::domain::coordinate_mapper;
use crate::detection::domain::face_detection::RawDetection;
use crate::detection::domain::inference_adapter::{
    InferenceAdapter, InferenceError, InferenceOptions,
};
use crate::overlay::domain::display_surface::SharedSurface;
use crate::pipeline::pipeline_logger::SharedLogger;
use crate::pipeline::result_store::{ResultSet, ResultStore};
use crate::shared::frame::Frame;

/// One frame to analyse, stamped with the store epoch it was taken in.
pub(crate) struct Job {
    pub(crate) frame: Frame,
    pub(crate) epoch: u64,
}

/// Publishes finished inference results if their session is still live.
pub(crate) struct Publisher {
    pub(crate) store: Arc<ResultStore>,
    pub(crate) surface: SharedSurface,
    pub(crate) logger: SharedLogger,
}

impl Publisher {
    fn publish(
        &self,
        job: Job,
        outcome: Result<Vec<RawDetection>, InferenceError>,
        elapsed: Duration,
    ) {
        let frame_index = job.frame.index();
        let detections = match outcome {
            Ok(detections) => detections,
            Err(e) => {
                log::warn!("Inference failed on frame {frame_index}: {e}");
                self.record_metric("inference_errors", 1.0);
                Vec::new()
            }
        };

        let native = job.frame.dimensions();
        let display = match self.surface.lock() {
            Ok(surface) => surface.dimensions(),
            Err(_) => {
                log::warn!("Display surface lock poisoned, mapping to native size");
                native
            }
        };
        let mapped = coordinate_mapper::map(&detections, native, display);
        let faces = mapped.len();
        // The epoch check happens under the store's write lock, so a stop()
        // that already cleared the store always wins.
        let results =
            ResultSet::new(frame_index, job.frame.captured_at(), mapped).with_frame(job.frame);
        if !self.store.publish_if(job.epoch, results) {
            log::debug!("Discarding result for frame {frame_index} from a stopped session");
            self.record_metric("discarded_results", 1.0);
            return;
        }

        log::debug!("Published {faces} face(s) for frame {frame_index} at {display}");
        if let Ok(mut logger) = self.logger.lock() {
            logger.timing("inference", elapsed.as_secs_f64() * 1000.0);
            logger.metric("faces", faces as f64);
        }
    }

    fn record_metric(&self, name: &str, value: f64) {
        if let Ok(mut logger) = self.logger.lock() {
            logger.metric(name, value);
        }
    }
}

/// Dedicated thread owning the inference adapter.
///
/// Accepts at most one job at a time: [`InferenceWorker::try_dispatch`]
/// refuses new work while a call is in flight, so detect calls never
/// overlap and never queue up.
pub(crate) struct InferenceWorker {
    jobs: Option<Sender<Job>>,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InferenceWorker {
    pub(crate) fn spawn(
        mut adapter: Box<dyn InferenceAdapter>,
        options: InferenceOptions,
        publisher: Publisher,
    ) -> Self {
        let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(1);
        let busy = Arc::new(AtomicBool::new(false));
        let worker_busy = busy.clone();

        let handle = std::thread::spawn(move || {
            for job in job_rx {
                let started = Instant::now();
                let outcome = adapter.detect(&job.frame, &options);
                let elapsed = started.elapsed();
                // Free the slot before publishing so observers woken by the
                // publish already see the worker idle.
                worker_busy.store(false, Ordering::Release);
                publisher.publish(job, outcome, elapsed);
            }
        });

        Self {
            jobs: Some(job_tx),
            busy,
            handle: Some(handle),
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Hands `job` to the worker unless a call is already in flight.
    /// Returns `false` when the job was refused.
    pub(crate) fn try_dispatch(&self, job: Job) -> bool {
        let Some(jobs) = &self.jobs else {
            return false;
        };
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        match jobs.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.busy.store(false, Ordering::Release);
                false
            }
        }
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        drop(self.jobs.take());
        // An in-flight call is not awaited; its result is discarded by the
        // epoch check. Join only when the thread has already finished.
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() && handle.join().is_err() {
                log::error!("Inference worker thread panicked");
            }
        }
    }
}
