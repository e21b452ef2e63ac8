//! Hot-plug notifications
//!
//! A [`HotplugSource`] invokes a registered [`HotplugHandler`] every time the display
//! topology of a drm device may have changed. The handler is expected to query the
//! connector states again, the notification itself carries no payload.
//!
//! With the `backend_udev` feature, [`UdevHotplugSource`] watches the `drm` subsystem
//! through udev from a dedicated thread and reports `change` events carrying `HOTPLUG=1`.

/// Callback invoked on every hot-plug notification, from the source's own thread
pub type HotplugHandler = Box<dyn Fn() + Send + Sync>;

/// Something delivering hot-plug notifications
pub trait HotplugSource: Send {
    /// Start delivering notifications to `handler`, replacing a previous handler
    fn register(&mut self, handler: HotplugHandler) -> std::io::Result<()>;
}

#[cfg(feature = "backend_udev")]
pub use self::monitor::*;

#[cfg(feature = "backend_udev")]
mod monitor {
    use std::{
        io,
        path::{Path, PathBuf},
        sync::mpsc,
        thread::JoinHandle,
    };

    use calloop::{
        generic::Generic,
        ping::{make_ping, Ping},
        EventLoop, Interest, Mode, PostAction,
    };
    use tracing::{debug, info, info_span, warn};
    use udev::{Enumerator, EventType, MonitorBuilder};

    use super::{HotplugHandler, HotplugSource};

    /// Watches udev for drm hot-plug events
    #[derive(Debug, Default)]
    pub struct UdevHotplugSource {
        worker: Option<(Ping, JoinHandle<()>)>,
    }

    impl UdevHotplugSource {
        /// Creates a new source, the monitor is opened on [`register`](HotplugSource::register)
        pub fn new() -> UdevHotplugSource {
            UdevHotplugSource::default()
        }

        fn stop(&mut self) {
            if let Some((ping, thread)) = self.worker.take() {
                ping.ping();
                if thread.join().is_err() {
                    warn!("Hot-plug thread panicked");
                }
            }
        }
    }

    impl HotplugSource for UdevHotplugSource {
        fn register(&mut self, handler: HotplugHandler) -> io::Result<()> {
            self.stop();

            let (tx, rx) = mpsc::channel();
            let thread = std::thread::Builder::new()
                .name("hwc-hotplug".into())
                .spawn(move || {
                    let _span = info_span!("backend_udev").entered();
                    let mut event_loop = match setup(handler) {
                        Ok((event_loop, ping)) => {
                            let _ = tx.send(Ok(ping));
                            event_loop
                        }
                        Err(err) => {
                            let _ = tx.send(Err(err));
                            return;
                        }
                    };
                    info!("Listening for hot-plug events");
                    let mut running = true;
                    while running {
                        if let Err(err) = event_loop.dispatch(None, &mut running) {
                            warn!(?err, "Hot-plug event loop failed");
                            break;
                        }
                    }
                })?;

            match rx.recv() {
                Ok(Ok(ping)) => {
                    self.worker = Some((ping, thread));
                    Ok(())
                }
                Ok(Err(err)) => {
                    let _ = thread.join();
                    Err(err)
                }
                Err(_) => Err(io::Error::new(io::ErrorKind::Other, "Hot-plug thread exited")),
            }
        }
    }

    fn setup(handler: HotplugHandler) -> io::Result<(EventLoop<'static, bool>, Ping)> {
        let monitor = MonitorBuilder::new()?.match_subsystem("drm")?.listen()?;
        let event_loop: EventLoop<'static, bool> =
            EventLoop::try_new().map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        let handle = event_loop.handle();

        let (ping, ping_source) = make_ping()?;
        handle
            .insert_source(ping_source, |_, _, running| *running = false)
            .map_err(|err| err.error)?;

        handle
            .insert_source(
                Generic::new(monitor, Interest::READ, Mode::Level),
                move |_, monitor, _| {
                    for event in monitor.iter() {
                        if event.event_type() != EventType::Change {
                            continue;
                        }
                        let hotplug = event
                            .property_value("HOTPLUG")
                            .map(|value| value.to_str() == Some("1"))
                            .unwrap_or(false);
                        if hotplug {
                            debug!(devnode = ?event.devnode(), "Hot-plug event");
                            handler();
                        }
                    }
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| err.error)?;

        Ok((event_loop, ping))
    }

    impl Drop for UdevHotplugSource {
        fn drop(&mut self) {
            self.stop();
        }
    }

    /// Returns the path of the primary GPU of a given seat, if any
    pub fn primary_gpu<S: AsRef<str>>(seat: S) -> io::Result<Option<PathBuf>> {
        let mut enumerator = Enumerator::new()?;
        enumerator.match_subsystem("drm")?;
        enumerator.match_sysname("card[0-9]*")?;

        let mut fallback = None;
        for device in enumerator.scan_devices()? {
            let seat_name = device
                .property_value("ID_SEAT")
                .map(|x| x.to_string_lossy().into_owned())
                .unwrap_or_else(|| String::from("seat0"));
            if seat_name != seat.as_ref() {
                continue;
            }
            let Some(path) = device.devnode().map(Path::to_path_buf) else {
                continue;
            };
            let boot_vga = device
                .parent_with_subsystem(Path::new("pci"))?
                .and_then(|pci| pci.attribute_value("boot_vga").map(|value| value.to_str() == Some("1")))
                .unwrap_or(false);
            if boot_vga {
                return Ok(Some(path));
            }
            fallback.get_or_insert(path);
        }
        Ok(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[derive(Default)]
    struct ManualSource(Option<HotplugHandler>);

    impl HotplugSource for ManualSource {
        fn register(&mut self, handler: HotplugHandler) -> std::io::Result<()> {
            self.0 = Some(handler);
            Ok(())
        }
    }

    #[test]
    fn handler_can_be_replaced() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut source = ManualSource::default();

        let counter = first.clone();
        source
            .register(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        (source.0.as_ref().unwrap())();

        let counter = second.clone();
        source
            .register(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        (source.0.as_ref().unwrap())();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
