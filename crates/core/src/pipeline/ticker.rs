use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{select, Sender};

/// Cadence timer running `on_tick` on its own thread at a fixed period.
///
/// Ticks that fire while `on_tick` is still running are coalesced by the
/// underlying channel rather than queued.
pub(crate) struct Ticker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub(crate) fn spawn(period: Duration, mut on_tick: impl FnMut() + Send + 'static) -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = std::thread::spawn(move || {
            let ticks = crossbeam_channel::tick(period);
            loop {
                select! {
                    recv(ticks) -> _ => on_tick(),
                    recv(stop_rx) -> _ => break,
                }
            }
        });
        Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Cancels the timer and waits for a running tick to return. No tick
    /// starts after this returns.
    pub(crate) fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Ticker thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
