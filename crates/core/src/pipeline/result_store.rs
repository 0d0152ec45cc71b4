use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::detection::domain::face_detection::DisplayDetection;
use crate::shared::frame::Frame;

/// Detections computed from one frame, in display coordinates.
#[derive(Clone, Debug)]
pub struct ResultSet {
    frame_index: Option<usize>,
    captured_at: Option<Instant>,
    detections: Vec<DisplayDetection>,
    frame: Option<Arc<Frame>>,
}

impl ResultSet {
    pub fn new(frame_index: usize, captured_at: Instant, detections: Vec<DisplayDetection>) -> Self {
        Self {
            frame_index: Some(frame_index),
            captured_at: Some(captured_at),
            detections,
            frame: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            frame_index: None,
            captured_at: None,
            detections: Vec::new(),
            frame: None,
        }
    }

    /// Keeps the frame the detections were computed from.
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(Arc::new(frame));
        self
    }

    /// The analysed frame, if the writer attached it.
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_deref()
    }

    /// Index of the source frame; `None` for the placeholder empty set.
    pub fn frame_index(&self) -> Option<usize> {
        self.frame_index
    }

    pub fn captured_at(&self) -> Option<Instant> {
        self.captured_at
    }

    pub fn detections(&self) -> &[DisplayDetection] {
        &self.detections
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }
}

/// Snapshot of the store. Inactive states always carry an empty result set.
#[derive(Clone, Debug)]
pub struct StreamState {
    active: bool,
    results: ResultSet,
    publish_count: u64,
    epoch: u64,
}

impl StreamState {
    fn idle(epoch: u64) -> Self {
        Self {
            active: false,
            results: ResultSet::empty(),
            publish_count: 0,
            epoch,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn results(&self) -> &ResultSet {
        &self.results
    }

    /// Publishes since the stream was activated.
    pub fn publish_count(&self) -> u64 {
        self.publish_count
    }

    /// Changes on every activate and clear.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

pub type SubscriptionId = u64;

type Callback = Box<dyn Fn(&StreamState) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: SubscriptionId,
    callbacks: Vec<(SubscriptionId, Callback)>,
    watchers: Vec<Sender<Arc<StreamState>>>,
}

/// Latest published detections plus the streaming-active flag.
///
/// One writer (the active detection loop) and any number of readers.
/// Every write replaces the whole state, so readers never observe a
/// partially updated set, and no history is kept.
///
/// Observers are notified synchronously on the writer's thread, in write
/// order, after the state lock is released. Callbacks must not write to the
/// store.
pub struct ResultStore {
    state: RwLock<Arc<StreamState>>,
    observers: Mutex<Observers>,
}

impl ResultStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(Arc::new(StreamState::idle(0))),
            observers: Mutex::new(Observers::default()),
        })
    }

    pub fn snapshot(&self) -> Arc<StreamState> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_active(&self) -> bool {
        self.snapshot().is_active()
    }

    /// Marks the stream active with an empty result set and returns the new
    /// epoch, for use with [`ResultStore::publish_if`].
    pub fn activate(&self) -> u64 {
        let mut epoch = 0;
        self.replace(|current| {
            epoch = current.epoch + 1;
            Some(StreamState {
                active: true,
                results: ResultSet::empty(),
                publish_count: 0,
                epoch,
            })
        });
        epoch
    }

    /// Replaces the current result set. Ignored (returns `false`) while the
    /// stream is inactive.
    pub fn publish(&self, results: ResultSet) -> bool {
        self.publish_where(results, |_| true)
    }

    /// Like [`ResultStore::publish`], but only while the store is still in
    /// `epoch`. The check and the write happen under the same lock, so a
    /// concurrent clear or re-activate always wins.
    pub fn publish_if(&self, epoch: u64, results: ResultSet) -> bool {
        self.publish_where(results, |current| current.epoch == epoch)
    }

    /// Resets to the idle state: inactive, no results.
    pub fn clear(&self) {
        self.replace(|current| Some(StreamState::idle(current.epoch + 1)));
    }

    /// Registers `callback` to run after every write.
    pub fn subscribe(&self, callback: impl Fn(&StreamState) + Send + Sync + 'static) -> SubscriptionId {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        let id = observers.next_id;
        observers.next_id += 1;
        observers.callbacks.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        let before = observers.callbacks.len();
        observers.callbacks.retain(|(cid, _)| *cid != id);
        observers.callbacks.len() != before
    }

    /// Channel receiving a snapshot after every write. Dropping the receiver
    /// unregisters it.
    pub fn watch(&self) -> Receiver<Arc<StreamState>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .watchers
            .push(tx);
        rx
    }

    fn publish_where(&self, results: ResultSet, accept: impl FnOnce(&StreamState) -> bool) -> bool {
        let accepted = self.replace(|current| {
            if !current.active || !accept(current) {
                return None;
            }
            Some(StreamState {
                active: true,
                results,
                publish_count: current.publish_count + 1,
                epoch: current.epoch,
            })
        });
        if !accepted {
            log::debug!("Dropping publish on inactive or superseded result store");
        }
        accepted
    }

    /// Swaps in the state built by `next`, then notifies observers. `None`
    /// leaves the state untouched and notifies nobody.
    fn replace(&self, next: impl FnOnce(&StreamState) -> Option<StreamState>) -> bool {
        // Holding the observer lock across swap + notify keeps notifications
        // in write order.
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let Some(updated) = next(&state) else {
                return false;
            };
            let updated = Arc::new(updated);
            *state = updated.clone();
            updated
        };
        for (_, callback) in &observers.callbacks {
            callback(&snapshot);
        }
        observers
            .watchers
            .retain(|tx| tx.send(snapshot.clone()).is_ok());
        true
    }
}
