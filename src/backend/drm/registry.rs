//! Arena of the hardware objects of one device
//!
//! Every connector, encoder, crtc and plane discovered on a device is stored once in
//! its [`DeviceRegistry`] and addressed by a copyable handle carrying the device id and
//! the arena index. Identities never change after discovery, only connector status and
//! property values are refreshed.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, info_span, trace, warn};

use super::device::{ConnectorInfo, KmsDevice, ObjectType};
use super::error::Error;
use super::mode::Mode;
use super::properties::{Property, PropertyStore};

/// Identifier of a device, in the order devices were added
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub(crate) usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device-{}", self.0)
    }
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            device: DeviceId,
            index: usize,
        }

        impl $name {
            pub(crate) fn new(device: DeviceId, index: usize) -> Self {
                $name { device, index }
            }

            /// Device this object belongs to
            pub fn device(&self) -> DeviceId {
                self.device
            }

            /// Position of this object in the registry of its device
            pub fn index(&self) -> usize {
                self.index
            }
        }
    };
}

handle_type!(
    /// Stable handle of a [`Connector`]
    ConnectorHandle
);
handle_type!(
    /// Stable handle of an [`Encoder`]
    EncoderHandle
);
handle_type!(
    /// Stable handle of a [`Crtc`]
    CrtcHandle
);
handle_type!(
    /// Stable handle of a [`Plane`]
    PlaneHandle
);

/// Connection state of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// A sink is connected
    Connected,
    /// Nothing is connected
    Disconnected,
    /// The driver can not tell
    Unknown,
}

/// Classification of connector types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    /// Built-in panel
    Internal,
    /// Port for an external monitor
    External,
    /// Writeback connector, never used as a display
    Writeback,
    /// Anything else (composite, tv, …)
    Unclassified,
}

/// Connector types, in the kernel's numbering
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorInterface {
    Unknown,
    VGA,
    DVII,
    DVID,
    DVIA,
    Composite,
    SVideo,
    LVDS,
    Component,
    NinePinDIN,
    DisplayPort,
    HDMIA,
    HDMIB,
    TV,
    EmbeddedDisplayPort,
    Virtual,
    DSI,
    DPI,
    Writeback,
    SPI,
    USB,
}

const INTERFACES: [ConnectorInterface; 21] = [
    ConnectorInterface::Unknown,
    ConnectorInterface::VGA,
    ConnectorInterface::DVII,
    ConnectorInterface::DVID,
    ConnectorInterface::DVIA,
    ConnectorInterface::Composite,
    ConnectorInterface::SVideo,
    ConnectorInterface::LVDS,
    ConnectorInterface::Component,
    ConnectorInterface::NinePinDIN,
    ConnectorInterface::DisplayPort,
    ConnectorInterface::HDMIA,
    ConnectorInterface::HDMIB,
    ConnectorInterface::TV,
    ConnectorInterface::EmbeddedDisplayPort,
    ConnectorInterface::Virtual,
    ConnectorInterface::DSI,
    ConnectorInterface::DPI,
    ConnectorInterface::Writeback,
    ConnectorInterface::SPI,
    ConnectorInterface::USB,
];

impl ConnectorInterface {
    /// Interface from the kernel's type number, unknown numbers map to [`ConnectorInterface::Unknown`]
    pub fn from_raw(raw: u32) -> ConnectorInterface {
        INTERFACES
            .get(raw as usize)
            .copied()
            .unwrap_or(ConnectorInterface::Unknown)
    }

    /// Short name used in connector names
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorInterface::Unknown => "None",
            ConnectorInterface::VGA => "VGA",
            ConnectorInterface::DVII => "DVI-I",
            ConnectorInterface::DVID => "DVI-D",
            ConnectorInterface::DVIA => "DVI-A",
            ConnectorInterface::Composite => "Composite",
            ConnectorInterface::SVideo => "SVIDEO",
            ConnectorInterface::LVDS => "LVDS",
            ConnectorInterface::Component => "Component",
            ConnectorInterface::NinePinDIN => "DIN",
            ConnectorInterface::DisplayPort => "DP",
            ConnectorInterface::HDMIA => "HDMI-A",
            ConnectorInterface::HDMIB => "HDMI-B",
            ConnectorInterface::TV => "TV",
            ConnectorInterface::EmbeddedDisplayPort => "eDP",
            ConnectorInterface::Virtual => "Virtual",
            ConnectorInterface::DSI => "DSI",
            ConnectorInterface::DPI => "DPI",
            ConnectorInterface::Writeback => "Writeback",
            ConnectorInterface::SPI => "SPI",
            ConnectorInterface::USB => "USB",
        }
    }

    /// Classify this interface
    pub fn kind(&self) -> ConnectorKind {
        match self {
            ConnectorInterface::LVDS
            | ConnectorInterface::EmbeddedDisplayPort
            | ConnectorInterface::DSI
            | ConnectorInterface::Virtual
            | ConnectorInterface::DPI
            | ConnectorInterface::SPI => ConnectorKind::Internal,
            ConnectorInterface::HDMIA
            | ConnectorInterface::DisplayPort
            | ConnectorInterface::DVID
            | ConnectorInterface::DVII
            | ConnectorInterface::VGA
            | ConnectorInterface::USB => ConnectorKind::External,
            ConnectorInterface::Writeback => ConnectorKind::Writeback,
            _ => ConnectorKind::Unclassified,
        }
    }
}

/// Type of a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// Overlay plane, composited above the primary plane
    Overlay,
    /// Primary plane, the full screen base of a crtc
    Primary,
    /// Cursor plane
    Cursor,
}

impl PlaneType {
    /// Plane type from the value of the `type` property
    pub fn from_raw(raw: u64) -> Option<PlaneType> {
        match raw {
            0 => Some(PlaneType::Overlay),
            1 => Some(PlaneType::Primary),
            2 => Some(PlaneType::Cursor),
            _ => None,
        }
    }
}

/// Mutable part of a connector, refreshed on hot-plug
#[derive(Debug, Clone)]
pub struct ConnectorStatus {
    /// Connection state
    pub state: ConnectionState,
    /// Supported modes, without duplicates
    pub modes: Vec<Mode>,
    /// Currently bound encoder
    pub current_encoder: Option<EncoderHandle>,
    /// Physical size in millimeters
    pub size_mm: Option<(u32, u32)>,
    /// Mode last applied by a display
    pub active_mode: Option<Mode>,
}

/// A physical output
#[derive(Debug)]
pub struct Connector {
    handle: ConnectorHandle,
    id: u32,
    interface: ConnectorInterface,
    interface_id: u32,
    encoders: Vec<EncoderHandle>,
    props: RwLock<PropertyStore>,
    status: RwLock<ConnectorStatus>,
}

impl Connector {
    /// Handle of this connector
    pub fn handle(&self) -> ConnectorHandle {
        self.handle
    }

    /// Kernel id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Connector type
    pub fn interface(&self) -> ConnectorInterface {
        self.interface
    }

    /// Name of this connector, e.g. `HDMI-A-1`
    pub fn name(&self) -> String {
        format!("{}-{}", self.interface.as_str(), self.interface_id)
    }

    /// Classification of this connector
    pub fn kind(&self) -> ConnectorKind {
        self.interface.kind()
    }

    /// Whether this is a built-in panel
    pub fn is_internal(&self) -> bool {
        self.kind() == ConnectorKind::Internal
    }

    /// Whether this is an external port
    pub fn is_external(&self) -> bool {
        self.kind() == ConnectorKind::External
    }

    /// Whether this is a writeback connector
    pub fn is_writeback(&self) -> bool {
        self.kind() == ConnectorKind::Writeback
    }

    /// Encoders this connector can be driven by
    pub fn encoders(&self) -> &[EncoderHandle] {
        &self.encoders
    }

    /// Whether `encoder` can drive this connector
    pub fn supports_encoder(&self, encoder: EncoderHandle) -> bool {
        self.encoders.contains(&encoder)
    }

    /// Snapshot of the mutable state
    pub fn status(&self) -> ConnectorStatus {
        self.status.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.status.read().unwrap_or_else(PoisonError::into_inner).state
    }

    /// Supported modes
    pub fn modes(&self) -> Vec<Mode> {
        self.status.read().unwrap_or_else(PoisonError::into_inner).modes.clone()
    }

    /// Record the mode a display applied
    pub fn set_active_mode(&self, mode: Option<Mode>) {
        self.status.write().unwrap_or_else(PoisonError::into_inner).active_mode = mode;
    }

    /// Lookup a property
    pub fn property(&self, name: &str) -> Option<Property> {
        self.props.read().unwrap_or_else(PoisonError::into_inner).get(name)
    }

    /// Generation of the property snapshot
    pub fn properties_generation(&self) -> u64 {
        self.props.read().unwrap_or_else(PoisonError::into_inner).generation()
    }
}

/// A signal encoder
#[derive(Debug)]
pub struct Encoder {
    handle: EncoderHandle,
    id: u32,
    possible_crtcs: u32,
    current_crtc: Option<CrtcHandle>,
}

impl Encoder {
    /// Handle of this encoder
    pub fn handle(&self) -> EncoderHandle {
        self.handle
    }

    /// Kernel id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Crtc bound at discovery, if any
    pub fn current_crtc(&self) -> Option<CrtcHandle> {
        self.current_crtc
    }

    /// Whether this encoder can be driven by `crtc`
    pub fn supports_crtc(&self, crtc: &Crtc) -> bool {
        crtc.index < 32 && self.possible_crtcs & (1 << crtc.index) != 0
    }
}

/// A timing engine
#[derive(Debug)]
pub struct Crtc {
    handle: CrtcHandle,
    id: u32,
    index: u32,
    props: PropertyStore,
}

impl Crtc {
    /// Handle of this crtc
    pub fn handle(&self) -> CrtcHandle {
        self.handle
    }

    /// Kernel id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Index in the kernel's crtc array
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Properties
    pub fn props(&self) -> &PropertyStore {
        &self.props
    }
}

/// A scan-out plane
#[derive(Debug)]
pub struct Plane {
    handle: PlaneHandle,
    id: u32,
    plane_type: PlaneType,
    possible_crtcs: u32,
    formats: Vec<u32>,
    props: PropertyStore,
}

impl Plane {
    /// Handle of this plane
    pub fn handle(&self) -> PlaneHandle {
        self.handle
    }

    /// Kernel id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Type of this plane
    pub fn plane_type(&self) -> PlaneType {
        self.plane_type
    }

    /// Whether this plane can feed `crtc`
    pub fn supports_crtc(&self, crtc: &Crtc) -> bool {
        crtc.index < 32 && self.possible_crtcs & (1 << crtc.index) != 0
    }

    /// Whether this plane can scan out buffers of the given fourcc code
    pub fn supports_format(&self, fourcc: u32) -> bool {
        self.formats.is_empty() || self.formats.contains(&fourcc)
    }

    /// Properties
    pub fn props(&self) -> &PropertyStore {
        &self.props
    }
}

const CONNECTOR_PROPS: [&str; 2] = ["CRTC_ID", "DPMS"];
const WRITEBACK_PROPS: [&str; 3] = ["WRITEBACK_PIXEL_FORMATS", "WRITEBACK_FB_ID", "WRITEBACK_OUT_FENCE_PTR"];
const CRTC_PROPS: [&str; 3] = ["ACTIVE", "MODE_ID", "OUT_FENCE_PTR"];
const PLANE_PROPS: [&str; 10] = [
    "CRTC_ID", "FB_ID", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "SRC_X", "SRC_Y", "SRC_W", "SRC_H",
];

/// All hardware objects of one device
pub struct DeviceRegistry {
    id: DeviceId,
    device: Arc<dyn KmsDevice>,
    path: Option<PathBuf>,
    connectors: Vec<Connector>,
    encoders: Vec<Encoder>,
    crtcs: Vec<Crtc>,
    planes: Vec<Plane>,
    min_size: (u32, u32),
    max_size: (u32, u32),
    span: tracing::Span,
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("connectors", &self.connectors.len())
            .field("encoders", &self.encoders.len())
            .field("crtcs", &self.crtcs.len())
            .field("planes", &self.planes.len())
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    /// Discover all objects of `device`.
    ///
    /// Fails if the device lacks atomic modesetting or is not a kms device. Objects
    /// missing required properties are skipped with a warning.
    pub fn new(id: DeviceId, device: Arc<dyn KmsDevice>) -> Result<DeviceRegistry, Error> {
        let path = device.dev_path();
        let span = info_span!("drm_device", device = %id, path = ?path);
        let _guard = span.enter();

        if !device.supports_atomic_and_universal_planes() {
            return Err(Error::Unsupported(path));
        }
        let resources = device.enumerate()?;
        if !resources.is_kms() {
            return Err(Error::NotKms(path));
        }

        let mut crtcs = Vec::with_capacity(resources.crtcs.len());
        for (index, info) in resources.crtcs.into_iter().enumerate() {
            let props = PropertyStore::new(info.properties);
            if let Some(name) = props.missing(&CRTC_PROPS) {
                warn!(crtc = info.id, property = name, "Skipping crtc without required property");
                continue;
            }
            crtcs.push(Crtc {
                handle: CrtcHandle::new(id, crtcs.len()),
                id: info.id,
                index: index as u32,
                props,
            });
        }

        let mut encoders = Vec::with_capacity(resources.encoders.len());
        for info in resources.encoders {
            let current_crtc = info
                .current_crtc
                .and_then(|crtc_id| crtcs.iter().find(|crtc| crtc.id == crtc_id))
                .map(|crtc| crtc.handle);
            encoders.push(Encoder {
                handle: EncoderHandle::new(id, encoders.len()),
                id: info.id,
                possible_crtcs: info.possible_crtcs,
                current_crtc,
            });
        }

        let mut connectors = Vec::with_capacity(resources.connectors.len());
        for info in resources.connectors {
            let props = PropertyStore::new(info.properties.clone());
            if let Some(name) = props.missing(&CONNECTOR_PROPS) {
                warn!(connector = info.id, property = name, "Skipping connector without required property");
                continue;
            }
            if info.interface.kind() == ConnectorKind::Writeback {
                if let Some(name) = props.missing(&WRITEBACK_PROPS) {
                    warn!(connector = info.id, property = name, "Skipping writeback connector without required property");
                    continue;
                }
            }
            let compatible = info
                .encoders
                .iter()
                .filter_map(|enc_id| encoders.iter().find(|enc| enc.id == *enc_id))
                .map(|enc| enc.handle)
                .collect();
            let status = status_from_info(&info, &encoders);
            connectors.push(Connector {
                handle: ConnectorHandle::new(id, connectors.len()),
                id: info.id,
                interface: info.interface,
                interface_id: info.interface_id,
                encoders: compatible,
                props: RwLock::new(props),
                status: RwLock::new(status),
            });
        }

        let mut planes = Vec::with_capacity(resources.planes.len());
        for info in resources.planes {
            let props = PropertyStore::new(info.properties);
            if let Some(name) = props.missing(&PLANE_PROPS) {
                warn!(plane = info.id, property = name, "Skipping plane without required property");
                continue;
            }
            let Some(plane_type) = props.value("type").and_then(PlaneType::from_raw) else {
                warn!(plane = info.id, "Skipping plane of unknown type");
                continue;
            };
            planes.push(Plane {
                handle: PlaneHandle::new(id, planes.len()),
                id: info.id,
                plane_type,
                possible_crtcs: info.possible_crtcs,
                formats: info.formats,
                props,
            });
        }

        info!(
            connectors = connectors.len(),
            encoders = encoders.len(),
            crtcs = crtcs.len(),
            planes = planes.len(),
            "Device discovered"
        );
        drop(_guard);

        Ok(DeviceRegistry {
            id,
            device,
            path,
            connectors,
            encoders,
            crtcs,
            planes,
            min_size: resources.min_size,
            max_size: resources.max_size,
            span,
        })
    }

    /// Id of this device
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// The underlying device
    pub fn device(&self) -> &Arc<dyn KmsDevice> {
        &self.device
    }

    /// Path of the device node
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Span of this device, for logging in its context
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Minimal and maximal framebuffer size
    pub fn resolution_limits(&self) -> ((u32, u32), (u32, u32)) {
        (self.min_size, self.max_size)
    }

    /// All connectors, writeback connectors included
    pub fn connectors(&self) -> &[Connector] {
        &self.connectors
    }

    /// All encoders
    pub fn encoders(&self) -> &[Encoder] {
        &self.encoders
    }

    /// All crtcs
    pub fn crtcs(&self) -> &[Crtc] {
        &self.crtcs
    }

    /// All planes
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Lookup a connector
    pub fn connector(&self, handle: ConnectorHandle) -> Option<&Connector> {
        (handle.device == self.id)
            .then(|| self.connectors.get(handle.index))
            .flatten()
    }

    /// Lookup an encoder
    pub fn encoder(&self, handle: EncoderHandle) -> Option<&Encoder> {
        (handle.device == self.id).then(|| self.encoders.get(handle.index)).flatten()
    }

    /// Lookup a crtc
    pub fn crtc(&self, handle: CrtcHandle) -> Option<&Crtc> {
        (handle.device == self.id).then(|| self.crtcs.get(handle.index)).flatten()
    }

    /// Lookup a plane
    pub fn plane(&self, handle: PlaneHandle) -> Option<&Plane> {
        (handle.device == self.id).then(|| self.planes.get(handle.index)).flatten()
    }

    /// Lookup a connector by name
    pub fn connector_by_name(&self, name: &str) -> Option<&Connector> {
        self.connectors.iter().find(|conn| conn.name() == name)
    }

    /// Query a connector again and update its status and properties.
    ///
    /// Returns the previous and the new connection state.
    pub fn refresh_connector(&self, handle: ConnectorHandle) -> Result<(ConnectionState, ConnectionState), Error> {
        let _guard = self.span.enter();
        let connector = self
            .connector(handle)
            .ok_or(Error::UnknownObject(ObjectType::Connector, handle.index as u32))?;
        let info = self.device.rescan_connector(connector.id)?;

        let mut status = connector.status.write().unwrap_or_else(PoisonError::into_inner);
        let previous = status.state;
        let active_mode = status.active_mode.take();
        *status = status_from_info(&info, &self.encoders);
        status.active_mode = active_mode;
        connector
            .props
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .refresh(info.properties);

        if previous != status.state {
            debug!(connector = %connector.name(), ?previous, current = ?status.state, "Connector state changed");
        } else {
            trace!(connector = %connector.name(), "Connector refreshed");
        }
        Ok((previous, status.state))
    }

    /// Read the EDID blob of a connector, if the sink provides one
    pub fn edid(&self, handle: ConnectorHandle) -> Result<Option<Vec<u8>>, Error> {
        let connector = self
            .connector(handle)
            .ok_or(Error::UnknownObject(ObjectType::Connector, handle.index as u32))?;
        let prop = self
            .device
            .get_property(connector.id, ObjectType::Connector, "EDID")?;
        match prop.map(|prop| prop.value as u32) {
            Some(blob) if blob != 0 => self.device.get_blob(blob).map(Some),
            _ => Ok(None),
        }
    }
}

fn status_from_info(info: &ConnectorInfo, encoders: &[Encoder]) -> ConnectorStatus {
    let mut modes: Vec<Mode> = Vec::with_capacity(info.modes.len());
    for mode in &info.modes {
        if !modes.contains(mode) {
            modes.push(mode.clone());
        }
    }
    ConnectorStatus {
        state: info.state,
        modes,
        current_encoder: info
            .current_encoder
            .and_then(|enc_id| encoders.iter().find(|enc| enc.id == enc_id))
            .map(|enc| enc.handle),
        size_mm: info.size_mm,
        active_mode: None,
    }
}
