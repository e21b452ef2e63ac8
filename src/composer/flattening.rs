//! Client flattening
//!
//! A display whose frames keep using hardware planes is asked to redraw once it has been
//! idle for a number of vsyncs, and the redrawn frame is composited by the client alone.
//! Static contents then live in a single buffer and the planes are given back.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::drm::vsync::VSyncWorker;

/// Vsyncs without a new frame before a refresh is requested
pub const VSYNC_COUNTDOWN: u32 = 60;

/// Where a display stands in the flattening cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatteningState {
    /// No worker, frames are never flattened
    Disabled,
    /// The last frame had at most one layer
    NotRequired,
    /// The last frame was composited by the client
    Flattened,
    /// The host was asked for a new frame
    RefreshRequested,
    /// Vsyncs left before a refresh is requested
    Countdown(u32),
}

impl fmt::Display for FlatteningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlatteningState::Disabled => f.write_str("Disabled"),
            FlatteningState::NotRequired => f.write_str("Not needed"),
            FlatteningState::Flattened => f.write_str("Active"),
            FlatteningState::RefreshRequested => f.write_str("Refresh requested"),
            FlatteningState::Countdown(n) => write!(f, "{} VSync remains", n),
        }
    }
}

fn lock(state: &Mutex<FlatteningState>) -> MutexGuard<'_, FlatteningState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Flattening state of one display, counted down by its own vsync worker
pub struct ClientFlattening {
    state: Arc<Mutex<FlatteningState>>,
    countdown: u32,
    worker: Option<VSyncWorker>,
}

impl fmt::Debug for ClientFlattening {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientFlattening")
            .field("state", &self.state())
            .field("countdown", &self.countdown)
            .finish_non_exhaustive()
    }
}

impl ClientFlattening {
    /// Flattening for `display`, calling `refresh` after `countdown` idle vsyncs.
    ///
    /// Falls back to [`ClientFlattening::disabled`] if the worker can not be spawned.
    pub fn new(display: u64, countdown: u32, refresh: Box<dyn Fn() + Send + Sync>) -> ClientFlattening {
        let state = Arc::new(Mutex::new(FlatteningState::NotRequired));
        let shared = state.clone();
        let worker = VSyncWorker::with_handler(
            "flatten",
            display,
            Box::new(move |_| {
                let mut state = lock(&shared);
                match *state {
                    FlatteningState::Countdown(n) if n > 1 => {
                        *state = FlatteningState::Countdown(n - 1);
                        true
                    }
                    FlatteningState::Countdown(_) => {
                        *state = FlatteningState::RefreshRequested;
                        drop(state);
                        let display_id = display;
                        debug!(display = display_id, "Requesting refresh for flattening");
                        refresh();
                        false
                    }
                    _ => false,
                }
            }),
        );
        match worker {
            Ok(worker) => ClientFlattening {
                state,
                countdown: countdown.max(1),
                worker: Some(worker),
            },
            Err(err) => {
                let display_id = display;
                warn!(display = display_id, %err, "Failed to spawn flattening worker");
                ClientFlattening::disabled()
            }
        }
    }

    /// Flattening that never kicks in
    pub fn disabled() -> ClientFlattening {
        ClientFlattening {
            state: Arc::new(Mutex::new(FlatteningState::Disabled)),
            countdown: VSYNC_COUNTDOWN,
            worker: None,
        }
    }

    /// Current state
    pub fn state(&self) -> FlatteningState {
        *lock(&self.state)
    }

    /// Advance the state for a new frame, `skip` if there is nothing worth flattening.
    ///
    /// Returns whether the whole frame has to be composited by the client.
    pub fn process(&self, skip: bool) -> bool {
        let Some(worker) = self.worker.as_ref() else {
            return false;
        };
        let mut state = lock(&self.state);
        if skip {
            *state = FlatteningState::NotRequired;
            return false;
        }
        if *state == FlatteningState::RefreshRequested {
            *state = FlatteningState::Flattened;
            return true;
        }
        *state = FlatteningState::Countdown(self.countdown);
        drop(state);
        worker.enable(true);
        false
    }

    /// Follow the refresh period of the display
    pub fn set_period(&self, period: Duration) {
        if let Some(worker) = self.worker.as_ref() {
            worker.set_period(period);
        }
    }
}
