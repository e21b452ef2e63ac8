use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, info_span, warn};

use super::device::{DeviceOpener, KmsDevice};
use super::error::Error;
use super::mode::Mode;
use super::ownership::{Claimant, ObjectKey, OwnershipTracker};
use super::pipeline::{self, DisplayPipeline};
use super::registry::{ConnectionState, Connector, ConnectorHandle, ConnectorKind, DeviceId, DeviceRegistry};
use crate::config::{Config, DisplayOrder};

/// Read-only view of a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorSummary {
    /// Handle of the connector
    pub handle: ConnectorHandle,
    /// Kernel id
    pub id: u32,
    /// Name, e.g. `eDP-1`
    pub name: String,
    /// Classification
    pub kind: ConnectorKind,
    /// Connection state
    pub state: ConnectionState,
    /// Supported modes
    pub modes: Vec<Mode>,
    /// Physical size in millimeters
    pub size_mm: Option<(u32, u32)>,
    /// Mode last applied by a display
    pub active_mode: Option<Mode>,
}

impl From<&Connector> for ConnectorSummary {
    fn from(conn: &Connector) -> Self {
        let status = conn.status();
        ConnectorSummary {
            handle: conn.handle(),
            id: conn.id(),
            name: conn.name(),
            kind: conn.kind(),
            state: status.state,
            modes: status.modes,
            size_mm: status.size_mm,
            active_mode: status.active_mode,
        }
    }
}

/// Change of a slotted connector noticed by [`ResourceManager::refresh_connectors`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// A sink was connected to the connector in the given slot
    Connected {
        /// Display slot
        slot: u32,
        /// The connector
        connector: ConnectorHandle,
    },
    /// The sink of the connector in the given slot went away
    Disconnected {
        /// Display slot
        slot: u32,
        /// The connector
        connector: ConnectorHandle,
    },
}

/// Order the candidates for the primary display.
///
/// Only connected connectors are candidates. Named connectors move to the front in the
/// order given, whatever their type. If the order allows other connectors they follow,
/// internal ones first and writeback connectors never, otherwise they are dropped.
pub fn order_primary_candidates(connectors: &[ConnectorSummary], order: &DisplayOrder) -> Vec<ConnectorHandle> {
    let mut candidates: Vec<&ConnectorSummary> = connectors
        .iter()
        .filter(|conn| conn.state == ConnectionState::Connected)
        .collect();

    let mut ordered = Vec::with_capacity(candidates.len());
    for name in &order.names {
        if let Some(pos) = candidates.iter().position(|conn| conn.name == *name) {
            ordered.push(candidates.remove(pos));
        }
    }
    if order.use_others {
        let (internal, others): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .filter(|conn| conn.kind != ConnectorKind::Writeback)
            .partition(|conn| conn.kind == ConnectorKind::Internal);
        ordered.extend(internal);
        ordered.extend(others);
    }

    ordered.into_iter().map(|conn| conn.handle).collect()
}

#[derive(Debug, Default)]
struct ManagerState {
    devices: Vec<Arc<DeviceRegistry>>,
    ownership: OwnershipTracker,
    slots: BTreeMap<u32, ConnectorHandle>,
    pipelines: HashMap<ConnectorHandle, Arc<DisplayPipeline>>,
}

impl ManagerState {
    fn registry(&self, device: DeviceId) -> Option<&Arc<DeviceRegistry>> {
        self.devices.iter().find(|registry| registry.id() == device)
    }

    fn connector(&self, handle: ConnectorHandle) -> Option<&Connector> {
        self.registry(handle.device())?.connector(handle)
    }

    fn summaries(&self) -> Vec<ConnectorSummary> {
        self.devices
            .iter()
            .flat_map(|registry| registry.connectors().iter().map(ConnectorSummary::from))
            .collect()
    }
}

/// Owner of all devices and of the ownership relation of their objects
///
/// Every operation takes the internal lock for its whole duration, the lock is never
/// held when an operation returns.
#[derive(Debug)]
pub struct ResourceManager {
    config: Config,
    inner: Mutex<ManagerState>,
    next_device: AtomicUsize,
    span: tracing::Span,
}

impl ResourceManager {
    /// Create a manager without any devices
    pub fn new(config: Config) -> ResourceManager {
        ResourceManager {
            config,
            inner: Mutex::new(ManagerState::default()),
            next_device: AtomicUsize::new(0),
            span: info_span!("resource_manager"),
        }
    }

    /// Open every configured device, discover its objects and assign the display slots.
    ///
    /// Devices that can not be opened or are not usable for modesetting are skipped.
    /// Fails if no device could be added or if no connector qualifies as primary display.
    pub fn init(config: Config, opener: &dyn DeviceOpener) -> Result<ResourceManager, Error> {
        let manager = ResourceManager::new(config);
        let _guard = manager.span.enter();

        let paths = manager.config.device.candidates(|path| opener.exists(path));
        for path in paths {
            let added = opener.open(&path).and_then(|device| manager.add_device(device));
            match added {
                Ok(id) => info!(?path, device = %id, "Added drm device"),
                Err(err) => warn!(?path, %err, "Skipping drm device"),
            }
        }

        if manager.lock().devices.is_empty() {
            error!("No usable drm device found");
            return Err(Error::NoDevice);
        }
        manager.reorder()?;
        drop(_guard);
        Ok(manager)
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The configuration this manager was created with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Discover the objects of `device` and add it after the known devices.
    ///
    /// Display slots are not touched, call [`ResourceManager::reorder`] afterwards. The
    /// device is enumerated before the internal lock is taken.
    pub fn add_device(&self, device: Arc<dyn KmsDevice>) -> Result<DeviceId, Error> {
        let id = DeviceId(self.next_device.fetch_add(1, Ordering::Relaxed));
        let registry = Arc::new(DeviceRegistry::new(id, device)?);
        self.lock().devices.push(registry);
        Ok(id)
    }

    /// Registries of all devices, in the order they were added
    pub fn devices(&self) -> Vec<Arc<DeviceRegistry>> {
        self.lock().devices.clone()
    }

    /// Recompute the display slots from the current connector states.
    ///
    /// Slot 0 gets the first primary candidate, every other internal or external
    /// connector gets the next slot in discovery order. Slotted connectors are reserved
    /// by the manager. Fails with [`Error::NoDisplays`] if there is no candidate.
    pub fn reorder(&self) -> Result<(), Error> {
        let _guard = self.span.enter();
        let mut state = self.lock();
        state.ownership.release_all(Claimant::Manager);
        state.slots.clear();

        let summaries = state.summaries();
        let candidates = order_primary_candidates(&summaries, &self.config.display_order);
        let Some(primary) = candidates.first().copied() else {
            error!("Failed to find a primary display, check the primary display order");
            return Err(Error::NoDisplays);
        };

        let mut slotted = vec![primary];
        slotted.extend(
            summaries
                .iter()
                .filter(|conn| matches!(conn.kind, ConnectorKind::Internal | ConnectorKind::External))
                .map(|conn| conn.handle)
                .filter(|handle| *handle != primary),
        );

        let mut slot = 0;
        for handle in slotted {
            if let Err(err) = state.ownership.acquire(handle, Claimant::Manager) {
                warn!(%err, "Connector can not be reserved");
                continue;
            }
            state.slots.insert(slot, handle);
            slot += 1;
        }

        for (slot, handle) in &state.slots {
            if let Some(conn) = state.connector(*handle) {
                debug!(slot, connector = %conn.name(), "Display slot assigned");
            }
        }
        Ok(())
    }

    /// Slotted connectors, by ascending slot
    pub fn available_connectors(&self) -> Vec<(u32, ConnectorHandle)> {
        self.lock().slots.iter().map(|(slot, handle)| (*slot, *handle)).collect()
    }

    /// Build a pipeline for `connector`, or return the one already built for it
    pub fn assemble(&self, connector: ConnectorHandle) -> Option<Arc<DisplayPipeline>> {
        let mut state = self.lock();
        if let Some(pipeline) = state.pipelines.get(&connector) {
            return Some(pipeline.clone());
        }
        let registry = state.registry(connector.device())?.clone();
        let pipeline = Arc::new(pipeline::assemble(
            &registry,
            &mut state.ownership,
            connector,
            self.config.use_overlay_planes,
        )?);
        state.pipelines.insert(connector, pipeline.clone());
        Some(pipeline)
    }

    /// Pipeline currently built for `connector`
    pub fn pipeline(&self, connector: ConnectorHandle) -> Option<Arc<DisplayPipeline>> {
        self.lock().pipelines.get(&connector).cloned()
    }

    /// Release everything claimed for the pipeline of `connector`
    pub fn teardown(&self, connector: ConnectorHandle) {
        let mut state = self.lock();
        if state.pipelines.remove(&connector).is_some() {
            debug!(?connector, "Pipeline torn down");
        }
        state.ownership.release_all(Claimant::Connector(connector));
    }

    /// Query all slotted connectors again and report which ones changed their state
    pub fn refresh_connectors(&self) -> Vec<ConnectorEvent> {
        let _guard = self.span.enter();
        let state = self.lock();
        let mut events = Vec::new();
        for (slot, handle) in &state.slots {
            let Some(registry) = state.registry(handle.device()) else {
                continue;
            };
            match registry.refresh_connector(*handle) {
                Ok((previous, current)) if previous != current => {
                    let (slot, connector) = (*slot, *handle);
                    if current == ConnectionState::Connected {
                        events.push(ConnectorEvent::Connected { slot, connector });
                    } else if previous == ConnectionState::Connected {
                        events.push(ConnectorEvent::Disconnected { slot, connector });
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(?handle, %err, "Failed to refresh connector"),
            }
        }
        events
    }

    /// Snapshot of a connector
    pub fn connector_info(&self, connector: ConnectorHandle) -> Option<ConnectorSummary> {
        self.lock().connector(connector).map(ConnectorSummary::from)
    }

    /// Current owner of an object
    pub fn owner_of(&self, object: impl Into<ObjectKey>) -> Option<Claimant> {
        self.lock().ownership.owner_of(object)
    }

    /// Minimal and maximal framebuffer size of a device
    pub fn resolution_limits(&self, device: DeviceId) -> Option<((u32, u32), (u32, u32))> {
        self.lock()
            .registry(device)
            .map(|registry| registry.resolution_limits())
    }

    /// Raw EDID of the sink connected to `connector`
    pub fn edid(&self, connector: ConnectorHandle) -> Result<Option<Vec<u8>>, Error> {
        let registry = self.lock().registry(connector.device()).cloned();
        match registry {
            Some(registry) => registry.edid(connector),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::drm::registry::ConnectorInterface;
    use crate::backend::drm::test::{DummyDevice, DummyOpener, Topology};
    use crate::config::{DevicePath, KeyValueConfig, DISPLAY_ORDER_KEY};

    fn hdmi_and_edp() -> Topology {
        Topology::new()
            .crtc()
            .crtc()
            .encoder(0b11, None)
            .encoder(0b11, None)
            .connector(ConnectorInterface::HDMIA, 1, true, &[0, 1])
            .connector(ConnectorInterface::EmbeddedDisplayPort, 1, true, &[0, 1])
            .primary_plane(0b01)
            .primary_plane(0b10)
            .overlay_plane(0b11)
    }

    fn config(order: &str) -> Config {
        Config::load(KeyValueConfig::new().with(DISPLAY_ORDER_KEY, order)).unwrap()
    }

    fn manager(config: Config, topology: Topology) -> ResourceManager {
        let manager = ResourceManager::new(config);
        manager.add_device(Arc::new(DummyDevice::new(topology))).unwrap();
        manager
    }

    fn slot_names(manager: &ResourceManager) -> Vec<(u32, String)> {
        manager
            .available_connectors()
            .into_iter()
            .map(|(slot, handle)| (slot, manager.connector_info(handle).unwrap().name))
            .collect()
    }

    #[test]
    fn named_connector_becomes_primary() {
        let manager = manager(config("eDP-1,..."), hdmi_and_edp());
        manager.reorder().unwrap();
        assert_eq!(
            slot_names(&manager),
            vec![(0, "eDP-1".to_string()), (1, "HDMI-A-1".to_string())]
        );
        for (_, handle) in manager.available_connectors() {
            assert_eq!(manager.owner_of(handle), Some(Claimant::Manager));
        }
    }

    #[test]
    fn internal_connectors_come_first_by_default() {
        let manager = manager(Config::default(), hdmi_and_edp());
        manager.reorder().unwrap();
        assert_eq!(slot_names(&manager)[0].1, "eDP-1");
    }

    #[test]
    fn ordering_is_deterministic_and_idempotent() {
        let manager = manager(config("HDMI-A-1"), hdmi_and_edp());
        manager.reorder().unwrap();
        let first = manager.available_connectors();
        manager.reorder().unwrap();
        assert_eq!(first, manager.available_connectors());
        assert_eq!(
            slot_names(&manager),
            vec![(0, "HDMI-A-1".to_string()), (1, "eDP-1".to_string())]
        );
    }

    #[test]
    fn candidates_skip_disconnected_and_unnamed_writeback() {
        let summaries = |names: &[(&str, ConnectorKind, ConnectionState)]| {
            names
                .iter()
                .enumerate()
                .map(|(idx, (name, kind, state))| ConnectorSummary {
                    handle: ConnectorHandle::new(DeviceId(0), idx),
                    id: idx as u32 + 30,
                    name: name.to_string(),
                    kind: *kind,
                    state: *state,
                    modes: Vec::new(),
                    size_mm: None,
                    active_mode: None,
                })
                .collect::<Vec<_>>()
        };
        let connectors = summaries(&[
            ("Writeback-1", ConnectorKind::Writeback, ConnectionState::Connected),
            ("DP-1", ConnectorKind::External, ConnectionState::Connected),
            ("DSI-1", ConnectorKind::Internal, ConnectionState::Disconnected),
            ("HDMI-A-1", ConnectorKind::External, ConnectionState::Connected),
            ("eDP-1", ConnectorKind::Internal, ConnectionState::Connected),
        ]);
        let order = DisplayOrder::parse("HDMI-A-1, ...");
        let ordered = order_primary_candidates(&connectors, &order);
        assert_eq!(ordered, vec![connectors[3].handle, connectors[4].handle, connectors[1].handle]);

        // named connectors lead whatever their type
        let named = DisplayOrder::parse("Writeback-1, HDMI-A-1, ...");
        let ordered = order_primary_candidates(&connectors, &named);
        assert_eq!(
            ordered,
            vec![connectors[0].handle, connectors[3].handle, connectors[4].handle, connectors[1].handle]
        );

        let strict = DisplayOrder::parse("DSI-1");
        assert!(order_primary_candidates(&connectors, &strict).is_empty());
    }

    #[test]
    fn no_candidate_is_fatal() {
        let manager = manager(
            Config::default(),
            Topology::new()
                .crtc()
                .encoder(0b1, None)
                .connector(ConnectorInterface::HDMIA, 1, false, &[0])
                .primary_plane(0b1),
        );
        assert!(matches!(manager.reorder(), Err(Error::NoDisplays)));
        assert!(manager.available_connectors().is_empty());
    }

    #[test]
    fn init_enumerates_and_skips_unusable_devices() {
        let opener = DummyOpener::new()
            .with("/dev/dri/card0", DummyDevice::new(Topology::new().crtc().encoder(0b1, None)))
            .with("/dev/dri/card1", DummyDevice::new(hdmi_and_edp()))
            .with("/dev/dri/card3", DummyDevice::new(hdmi_and_edp()));
        let config = Config {
            device: DevicePath::Enumerate("/dev/dri/card".into()),
            ..Config::default()
        };
        let manager = ResourceManager::init(config, &opener).unwrap();
        assert_eq!(manager.devices().len(), 1);
        assert_eq!(manager.available_connectors().len(), 2);

        let empty = DummyOpener::new();
        assert!(matches!(
            ResourceManager::init(Config::default(), &empty),
            Err(Error::NoDevice)
        ));
    }

    #[test]
    fn teardown_releases_pipeline_claims() {
        let manager = manager(Config::default(), hdmi_and_edp());
        manager.reorder().unwrap();
        let (_, primary) = manager.available_connectors()[0];
        let pipeline = manager.assemble(primary).unwrap();
        assert!(Arc::ptr_eq(&pipeline, &manager.assemble(primary).unwrap()));
        assert_eq!(
            manager.owner_of(pipeline.crtc_handle()),
            Some(Claimant::Connector(primary))
        );

        manager.teardown(primary);
        for object in pipeline.claimed_objects() {
            assert_eq!(manager.owner_of(object), None);
        }
        assert!(manager.pipeline(primary).is_none());
        assert_eq!(manager.owner_of(primary), Some(Claimant::Manager));
    }

    #[test]
    fn enumeration_does_not_block_the_manager() {
        let device = Arc::new(DummyDevice::new(hdmi_and_edp()));
        let manager = Arc::new(ResourceManager::new(Config::default()));
        let responsive = Arc::new(AtomicUsize::new(0));

        let (weak, flag) = (Arc::downgrade(&manager), responsive.clone());
        device.on_enumerate(move || {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            let (tx, rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _ = tx.send(manager.devices().len());
            });
            if rx.recv_timeout(std::time::Duration::from_secs(1)).is_ok() {
                flag.fetch_add(1, Ordering::SeqCst);
            }
        });

        manager.add_device(device).unwrap();
        assert_eq!(responsive.load(Ordering::SeqCst), 1);
        assert_eq!(manager.devices().len(), 1);
    }

    #[test]
    fn hotplug_reports_changes_of_slotted_connectors() {
        let device = Arc::new(DummyDevice::new(hdmi_and_edp()));
        let manager = ResourceManager::new(Config::default());
        manager.add_device(device.clone()).unwrap();
        manager.reorder().unwrap();
        assert!(manager.refresh_connectors().is_empty());

        device.set_connector(0, false, Vec::new());
        let events = manager.refresh_connectors();
        let hdmi = manager.devices()[0].connectors()[0].handle();
        assert_eq!(events, vec![ConnectorEvent::Disconnected { slot: 1, connector: hdmi }]);

        device.set_connector(0, true, vec![Mode::new(1920, 1080, 60)]);
        assert_eq!(
            manager.refresh_connectors(),
            vec![ConnectorEvent::Connected { slot: 1, connector: hdmi }]
        );
        assert_eq!(manager.connector_info(hdmi).unwrap().modes.len(), 1);
    }
}
