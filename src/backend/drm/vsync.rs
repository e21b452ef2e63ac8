//! Software vertical sync
//!
//! A [`VSyncWorker`] runs a [`calloop`] event loop on its own thread and invokes a
//! callback once per refresh period while enabled. The period is taken from the active
//! mode of the display and can be changed at any time.
//!
//! [`VSyncWorker::with_handler`] takes a handler that may end the delivery itself by
//! returning `false`, the worker then stays idle until enabled again.

use std::fmt;
use std::io;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use calloop::{
    channel::{self, Sender},
    timer::{TimeoutAction, Timer},
    EventLoop, LoopHandle, RegistrationToken,
};
use rustix::time::{clock_gettime, ClockId};
use tracing::{debug, info_span, trace, warn};

/// Callback receiving the monotonic timestamp of a vsync in nanoseconds
pub type VsyncCallback = Box<dyn Fn(i64) + Send + Sync>;

/// Like [`VsyncCallback`], returning `false` disarms the worker
pub type VsyncHandler = Box<dyn Fn(i64) -> bool + Send + Sync>;

/// Period used until a mode is known
pub const DEFAULT_PERIOD: Duration = Duration::from_nanos(16_666_666);

#[derive(Debug)]
enum Command {
    Enable(bool),
    Period(Duration),
}

struct WorkerState {
    handle: LoopHandle<'static, WorkerState>,
    handler: Arc<VsyncHandler>,
    period: Duration,
    timer: Option<RegistrationToken>,
    running: bool,
}

impl WorkerState {
    fn start(&mut self) {
        if self.timer.is_some() {
            return;
        }
        let period = self.period;
        let handler = self.handler.clone();
        match self
            .handle
            .insert_source(Timer::from_duration(period), move |_, _, state: &mut WorkerState| {
                let now = clock_gettime(ClockId::Monotonic);
                let timestamp = now.tv_sec as i64 * 1_000_000_000 + now.tv_nsec as i64;
                trace!(timestamp, "vsync");
                if handler(timestamp) {
                    TimeoutAction::ToDuration(state.period)
                } else {
                    state.timer = None;
                    TimeoutAction::Drop
                }
            }) {
            Ok(token) => self.timer = Some(token),
            Err(err) => warn!(error = ?err.error, "Failed to arm vsync timer"),
        }
    }

    fn stop(&mut self) {
        if let Some(token) = self.timer.take() {
            self.handle.remove(token);
        }
    }
}

/// Periodic vsync source of one display
pub struct VSyncWorker {
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for VSyncWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VSyncWorker").finish_non_exhaustive()
    }
}

impl VSyncWorker {
    /// Spawn the worker thread for `display`, initially disabled
    pub fn new(display: u64, callback: VsyncCallback) -> io::Result<VSyncWorker> {
        Self::with_handler(
            "vsync",
            display,
            Box::new(move |timestamp| {
                callback(timestamp);
                true
            }),
        )
    }

    /// Spawn a worker named `hwc-<name>-<display>` whose handler decides whether to keep
    /// running, initially disabled
    pub fn with_handler(name: &str, display: u64, handler: VsyncHandler) -> io::Result<VSyncWorker> {
        let (tx, rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(format!("hwc-{}-{}", name, display))
            .spawn(move || {
                let display_id = display;
                let _span = info_span!("vsync", display = display_id).entered();
                let (mut event_loop, mut state) = match setup(handler) {
                    Ok((event_loop, state, commands)) => {
                        let _ = tx.send(Ok(commands));
                        (event_loop, state)
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                while state.running {
                    if let Err(err) = event_loop.dispatch(None, &mut state) {
                        warn!(?err, "Vsync event loop failed");
                        break;
                    }
                }
                debug!("Vsync worker exited");
            })?;

        match rx.recv() {
            Ok(Ok(commands)) => Ok(VSyncWorker {
                commands,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "Vsync thread exited")),
        }
    }

    /// Start or stop delivering vsync callbacks
    pub fn enable(&self, enabled: bool) {
        if self.commands.send(Command::Enable(enabled)).is_err() {
            warn!("Vsync worker is gone");
        }
    }

    /// Change the refresh period, effective from the next vsync
    pub fn set_period(&self, period: Duration) {
        if period.is_zero() {
            return;
        }
        if self.commands.send(Command::Period(period)).is_err() {
            warn!("Vsync worker is gone");
        }
    }
}

fn setup(handler: VsyncHandler) -> io::Result<(EventLoop<'static, WorkerState>, WorkerState, Sender<Command>)> {
    let event_loop: EventLoop<'static, WorkerState> =
        EventLoop::try_new().map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    let (commands, channel) = channel::channel();
    event_loop
        .handle()
        .insert_source(channel, |event, _, state: &mut WorkerState| match event {
            channel::Event::Msg(Command::Enable(true)) => state.start(),
            channel::Event::Msg(Command::Enable(false)) => state.stop(),
            channel::Event::Msg(Command::Period(period)) => state.period = period,
            channel::Event::Closed => {
                state.stop();
                state.running = false;
            }
        })
        .map_err(|err| io::Error::from(err.error))?;

    let state = WorkerState {
        handle: event_loop.handle(),
        handler: Arc::new(handler),
        period: DEFAULT_PERIOD,
        timer: None,
        running: true,
    };
    Ok((event_loop, state, commands))
}

impl Drop for VSyncWorker {
    fn drop(&mut self) {
        // closing the channel ends the loop
        let (closed, _) = channel::channel();
        drop(std::mem::replace(&mut self.commands, closed));
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Vsync thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;

    fn counting_worker() -> (VSyncWorker, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let worker = VSyncWorker::new(
            0,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        (worker, count)
    }

    #[test]
    fn delivers_only_while_enabled() {
        let (worker, count) = counting_worker();
        worker.set_period(Duration::from_millis(5));
        sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        worker.enable(true);
        sleep(Duration::from_millis(100));
        assert!(count.load(Ordering::SeqCst) >= 2);

        worker.enable(false);
        sleep(Duration::from_millis(20));
        let stopped = count.load(Ordering::SeqCst);
        sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), stopped);
    }

    #[test]
    fn handler_can_disarm_the_worker() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let worker = VSyncWorker::with_handler(
            "countdown",
            2,
            Box::new(move |_| counter.fetch_add(1, Ordering::SeqCst) < 2),
        )
        .unwrap();
        worker.set_period(Duration::from_millis(4));
        worker.enable(true);
        sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // re-arming after a self-disarm works
        worker.enable(true);
        sleep(Duration::from_millis(40));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn timestamps_increase() {
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = stamps.clone();
        let worker = VSyncWorker::new(
            1,
            Box::new(move |ts| {
                sink.lock().unwrap().push(ts);
            }),
        )
        .unwrap();
        worker.set_period(Duration::from_millis(4));
        worker.enable(true);
        sleep(Duration::from_millis(60));
        drop(worker);

        let stamps = stamps.lock().unwrap();
        assert!(stamps.len() >= 2);
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }
}
