//! Host facing display interface
//!
//! The [`Composer`] owns one [`Display`] per display slot of a
//! [`ResourceManager`]. Hosts register their [`Callback`]s, create layers on the
//! displays and drive every frame through [`Display::validate_display`] and
//! [`Display::present_display`].
//!
//! Hot-plug notifications from a [`HotplugSource`] make the composer query the
//! connectors again, build or tear down the affected pipelines and tell the host.
//! Host callbacks are always invoked without any internal lock held, so the host may
//! call back into the composer from within them.
//!
//! ```rust,ignore
//! use kms_hwc::composer::{Callback, Composer};
//!
//! let composer = Composer::init(config, &DrmDeviceOpener, importer)?;
//! composer.register_callback(Callback::Vsync(Box::new(|display, timestamp| {
//!     // schedule the next frame
//! })));
//! composer.start_hotplug(Box::new(UdevHotplugSource::new()))?;
//!
//! let display = composer.display(0)?;
//! let mut display = display.lock().unwrap();
//! let layer = display.create_layer();
//! display.layer_mut(layer)?.set_buffer(Some(handle), None);
//! display.validate_display()?;
//! display.accept_display_changes();
//! let fence = display.present_display()?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tracing::{debug, info, info_span, warn};

use crate::backend::drm::vsync::VSyncWorker;
use crate::backend::drm::{BufferImporter, ConnectionState, ConnectorEvent, DeviceOpener, Error, ResourceManager};
use crate::backend::HotplugSource;
use crate::config::Config;

mod configs;
mod display;
mod flattening;

pub use self::configs::{Attribute, DisplayConfig, DisplayConfigs};
pub use self::display::{
    ColorMode, ConnectionType, Dataspace, Display, DisplayError, DisplayLayer, HdrCapabilities, PowerMode,
    CLIENT_TARGET,
};
pub use self::flattening::{ClientFlattening, FlatteningState, VSYNC_COUNTDOWN};

/// Called with the display id and whether the display is now connected
pub type HotplugCallback = Arc<dyn Fn(u64, bool) + Send + Sync>;
/// Called with the display id and the monotonic timestamp of the vsync in nanoseconds
pub type VsyncCallback = Arc<dyn Fn(u64, i64) + Send + Sync>;
/// Called with the display id when the host should present a new frame
pub type RefreshCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Host callbacks
pub enum Callback {
    /// Display connection changes
    Hotplug(Box<dyn Fn(u64, bool) + Send + Sync>),
    /// Vertical sync events of displays with vsync enabled
    Vsync(Box<dyn Fn(u64, i64) + Send + Sync>),
    /// Requests to redraw a display
    Refresh(Box<dyn Fn(u64) + Send + Sync>),
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Hotplug(_) => f.write_str("Callback::Hotplug"),
            Callback::Vsync(_) => f.write_str("Callback::Vsync"),
            Callback::Refresh(_) => f.write_str("Callback::Refresh"),
        }
    }
}

#[derive(Default)]
struct Callbacks {
    hotplug: Option<HotplugCallback>,
    vsync: Option<VsyncCallback>,
    refresh: Option<RefreshCallback>,
}

fn read(callbacks: &RwLock<Callbacks>) -> std::sync::RwLockReadGuard<'_, Callbacks> {
    callbacks.read().unwrap_or_else(PoisonError::into_inner)
}

/// The displays of all devices of a [`ResourceManager`]
pub struct Composer {
    manager: Arc<ResourceManager>,
    displays: BTreeMap<u64, Arc<Mutex<Display>>>,
    callbacks: Arc<RwLock<Callbacks>>,
    hotplug: Mutex<Option<Box<dyn HotplugSource>>>,
    span: tracing::Span,
}

impl fmt::Debug for Composer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composer")
            .field("manager", &self.manager)
            .field("displays", &self.displays.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn lock(display: &Mutex<Display>) -> MutexGuard<'_, Display> {
    display.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Composer {
    /// Open the configured devices and create the displays.
    ///
    /// Fails like [`ResourceManager::init`], in particular with [`Error::NoDisplays`] if no
    /// connector qualifies as primary display.
    pub fn init(
        config: Config,
        opener: &dyn DeviceOpener,
        importer: Arc<dyn BufferImporter>,
    ) -> Result<Arc<Composer>, Error> {
        let manager = ResourceManager::init(config, opener)?;
        Ok(Composer::new(Arc::new(manager), importer))
    }

    /// Create one display per slot of `manager`.
    ///
    /// Displays whose connector has a sink attached get their pipeline right away.
    pub fn new(manager: Arc<ResourceManager>, importer: Arc<dyn BufferImporter>) -> Arc<Composer> {
        let span = info_span!("composer");
        let _guard = span.enter();
        let callbacks = Arc::new(RwLock::new(Callbacks::default()));

        let mut displays = BTreeMap::new();
        for (slot, connector) in manager.available_connectors() {
            let id = slot as u64;
            let vsync_callbacks = callbacks.clone();
            let vsync = VSyncWorker::new(
                id,
                Box::new(move |timestamp| {
                    let callback = read(&vsync_callbacks).vsync.clone();
                    if let Some(callback) = callback {
                        callback(id, timestamp);
                    }
                }),
            );
            let vsync = match vsync {
                Ok(vsync) => Some(vsync),
                Err(err) => {
                    warn!(display = id, ?err, "Failed to start vsync worker");
                    None
                }
            };

            let refresh_callbacks = callbacks.clone();
            let flattening = ClientFlattening::new(
                id,
                VSYNC_COUNTDOWN,
                Box::new(move || {
                    let callback = read(&refresh_callbacks).refresh.clone();
                    if let Some(callback) = callback {
                        callback(id);
                    }
                }),
            );

            let mut display = Display::new(
                id,
                connector,
                manager.clone(),
                importer.clone(),
                vsync,
                flattening,
            );
            let connected = manager
                .connector_info(connector)
                .map(|info| info.state == ConnectionState::Connected)
                .unwrap_or(false);
            if connected {
                if let Err(err) = display.handle_hotplug(true) {
                    warn!(display = id, %err, "Failed to set up display");
                }
            }
            let name = display.name();
            info!(display = id, name = %name, connected, "Display created");
            displays.insert(id, Arc::new(Mutex::new(display)));
        }
        drop(_guard);

        Arc::new(Composer {
            manager,
            displays,
            callbacks,
            hotplug: Mutex::new(None),
            span,
        })
    }

    /// The resource manager
    pub fn manager(&self) -> &Arc<ResourceManager> {
        &self.manager
    }

    /// Ids of all displays, ascending
    pub fn displays(&self) -> Vec<u64> {
        self.displays.keys().copied().collect()
    }

    /// Lookup a display
    pub fn display(&self, id: u64) -> Result<Arc<Mutex<Display>>, DisplayError> {
        self.displays.get(&id).cloned().ok_or(DisplayError::BadDisplay)
    }

    /// Register a host callback, replacing a previous one of the same kind.
    ///
    /// Registering the hot-plug callback reports every connected display right away.
    pub fn register_callback(&self, callback: Callback) {
        let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        match callback {
            Callback::Hotplug(callback) => {
                let callback: HotplugCallback = Arc::from(callback);
                callbacks.hotplug = Some(callback.clone());
                drop(callbacks);
                for (id, display) in &self.displays {
                    let connected = lock(display).is_connected();
                    if connected {
                        callback(*id, true);
                    }
                }
            }
            Callback::Vsync(callback) => callbacks.vsync = Some(Arc::from(callback)),
            Callback::Refresh(callback) => callbacks.refresh = Some(Arc::from(callback)),
        }
    }

    /// Listen for hot-plug notifications of `source`
    pub fn start_hotplug(self: &Arc<Self>, mut source: Box<dyn HotplugSource>) -> io::Result<()> {
        let composer: Weak<Composer> = Arc::downgrade(self);
        source.register(Box::new(move || {
            if let Some(composer) = composer.upgrade() {
                composer.handle_hotplug();
            }
        }))?;
        *self.hotplug.lock().unwrap_or_else(PoisonError::into_inner) = Some(source);
        Ok(())
    }

    /// Query the connectors again and update the displays that changed
    pub fn handle_hotplug(&self) {
        let events = self.manager.refresh_connectors();
        for event in events {
            let (slot, connected) = match event {
                ConnectorEvent::Connected { slot, .. } => (slot, true),
                ConnectorEvent::Disconnected { slot, .. } => (slot, false),
            };
            let id = slot as u64;
            let Some(display) = self.displays.get(&id) else {
                continue;
            };
            debug!(parent: &self.span, display = id, connected, "Hot-plug");
            if let Err(err) = lock(display).handle_hotplug(connected) {
                warn!(parent: &self.span, display = id, %err, "Failed to handle hot-plug");
                continue;
            }

            let (hotplug, refresh) = {
                let callbacks = read(&self.callbacks);
                (callbacks.hotplug.clone(), callbacks.refresh.clone())
            };
            if let Some(hotplug) = hotplug {
                hotplug(id, connected);
            }
            if let (true, Some(refresh)) = (connected, refresh) {
                refresh(id);
            }
        }
    }

    /// Dump of every display
    pub fn dump(&self) -> String {
        self.displays.values().map(|display| lock(display).dump()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::drm::test::{DummyDevice, DummyImporter, Topology};
    use crate::backend::drm::ConnectorInterface;
    use crate::backend::drm::Mode;
    use crate::backend::HotplugHandler;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct ManualSource(Arc<Mutex<Option<HotplugHandler>>>);

    impl ManualSource {
        fn trigger(&self) {
            if let Some(handler) = self.0.lock().unwrap().as_ref() {
                handler();
            }
        }
    }

    impl HotplugSource for ManualSource {
        fn register(&mut self, handler: HotplugHandler) -> io::Result<()> {
            *self.0.lock().unwrap() = Some(handler);
            Ok(())
        }
    }

    fn composer() -> (Arc<DummyDevice>, Arc<Composer>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dummy = Arc::new(DummyDevice::new(
            Topology::new()
                .crtc()
                .crtc()
                .encoder(0b11, None)
                .encoder(0b11, None)
                .connector(ConnectorInterface::EmbeddedDisplayPort, 1, true, &[0])
                .connector(ConnectorInterface::HDMIA, 1, false, &[1])
                .primary_plane(0b01)
                .primary_plane(0b10),
        ));
        let manager = Arc::new(ResourceManager::new(Config::default()));
        manager.add_device(dummy.clone()).unwrap();
        manager.reorder().unwrap();
        (dummy, Composer::new(manager, Arc::new(DummyImporter::new())))
    }

    #[test]
    fn one_display_per_slot() {
        let (_, composer) = composer();
        assert_eq!(composer.displays(), vec![0, 1]);
        assert!(lock(&composer.display(0).unwrap()).is_connected());
        assert!(!lock(&composer.display(1).unwrap()).is_connected());
        assert!(matches!(composer.display(2), Err(DisplayError::BadDisplay)));
    }

    #[test]
    fn hotplug_reaches_the_host() {
        let (dummy, composer) = composer();
        let events = Arc::new(Mutex::new(Vec::new()));
        let refreshes = Arc::new(Mutex::new(Vec::new()));

        let sink = events.clone();
        composer.register_callback(Callback::Hotplug(Box::new(move |id, connected| {
            sink.lock().unwrap().push((id, connected));
        })));
        assert_eq!(*events.lock().unwrap(), vec![(0, true)]);

        let sink = refreshes.clone();
        composer.register_callback(Callback::Refresh(Box::new(move |id| sink.lock().unwrap().push(id))));

        let source = ManualSource::default();
        composer.start_hotplug(Box::new(source.clone())).unwrap();

        dummy.set_connector(1, true, vec![Mode::new(1280, 1024, 60).preferred()]);
        source.trigger();
        assert_eq!(events.lock().unwrap().last(), Some(&(1, true)));
        assert_eq!(*refreshes.lock().unwrap(), vec![1]);
        {
            let display = composer.display(1).unwrap();
            let display = lock(&display);
            assert!(display.is_connected());
            assert_eq!(display.display_attribute(1, Attribute::Height), Ok(1024));
        }

        // nothing changed, nothing reported
        source.trigger();
        assert_eq!(events.lock().unwrap().len(), 2);

        dummy.set_connector(1, false, Vec::new());
        source.trigger();
        assert_eq!(events.lock().unwrap().last(), Some(&(1, false)));
        assert!(!lock(&composer.display(1).unwrap()).is_connected());
    }

    #[test]
    fn vsync_is_routed_per_display() {
        let (_, composer) = composer();
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let sink = stamps.clone();
        composer.register_callback(Callback::Vsync(Box::new(move |id, timestamp| {
            sink.lock().unwrap().push((id, timestamp));
        })));

        let display = composer.display(0).unwrap();
        lock(&display).set_vsync_enabled(true).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        lock(&display).set_vsync_enabled(false).unwrap();

        let stamps = stamps.lock().unwrap();
        assert!(stamps.len() >= 2);
        assert!(stamps.iter().all(|(id, _)| *id == 0));
    }

    #[test]
    fn dump_covers_all_displays() {
        let (_, composer) = composer();
        let dump = composer.dump();
        assert!(dump.contains("- Display on: eDP-1\n"));
        assert!(dump.contains("- Display on: HDMI-A-1\n"));
        assert_eq!(dump.matches("No stats yet").count(), 4);
    }
}
