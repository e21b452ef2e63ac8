//! Simulated device for tests
//!
//! [`DummyDevice`] implements [`KmsDevice`] for a topology described with a [`Topology`]
//! builder. It records every atomic request, keeps track of blobs and framebuffers and
//! can be told to refuse test or real commits. [`DummyOpener`] serves dummy devices by
//! path and [`DummyImporter`] describes fake buffers.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use drm_fourcc::DrmFourcc;
use rustix::event::{eventfd, EventfdFlags};
use smallvec::smallvec;

use super::buffer::{BufferHandle, BufferImporter, BufferInfo, BufferPlane, ImportError};
use super::device::{
    AtomicRequest, CommitFlags, ConnectorInfo, CrtcInfo, DeviceOpener, DeviceResources, EncoderInfo, KmsDevice,
    ObjectType, PlaneInfo,
};
use super::error::{AccessError, Error};
use super::mode::Mode;
use super::properties::RawProperty;
use super::registry::{ConnectionState, ConnectorInterface};

const PLANE_PROPS: [&str; 10] = [
    "CRTC_ID", "FB_ID", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H", "SRC_X", "SRC_Y", "SRC_W", "SRC_H",
];
const OPTIONAL_PLANE_PROPS: [&str; 5] = ["zpos", "alpha", "pixel blend mode", "rotation", "IN_FENCE_FD"];

#[derive(Debug, Clone)]
struct ConnectorSpec {
    interface: ConnectorInterface,
    interface_id: u32,
    connected: bool,
    encoders: Vec<usize>,
    current_encoder: Option<usize>,
    size_mm: Option<(u32, u32)>,
    edid: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct PlaneSpec {
    plane_type: u64,
    possible_crtcs: u32,
}

/// Declarative description of a device
#[derive(Debug, Clone)]
pub struct Topology {
    crtcs: usize,
    encoders: Vec<(u32, Option<usize>)>,
    connectors: Vec<ConnectorSpec>,
    planes: Vec<PlaneSpec>,
    removed: Vec<(ObjectType, usize, &'static str)>,
    atomic: bool,
    min_size: (u32, u32),
    max_size: (u32, u32),
    path: Option<PathBuf>,
}

impl Default for Topology {
    fn default() -> Self {
        Topology {
            crtcs: 0,
            encoders: Vec::new(),
            connectors: Vec::new(),
            planes: Vec::new(),
            removed: Vec::new(),
            atomic: true,
            min_size: (0, 0),
            max_size: (8192, 8192),
            path: None,
        }
    }
}

impl Topology {
    /// Empty topology
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Add a crtc
    pub fn crtc(mut self) -> Self {
        self.crtcs += 1;
        self
    }

    /// Add an encoder able to drive the crtcs in `possible_crtcs`, optionally bound to a crtc index
    pub fn encoder(mut self, possible_crtcs: u32, current_crtc: Option<usize>) -> Self {
        self.encoders.push((possible_crtcs, current_crtc));
        self
    }

    /// Add a connector compatible with the encoders at the given indices.
    ///
    /// Connected connectors report a preferred 1920x1080 mode and a 1280x720 mode.
    pub fn connector(mut self, interface: ConnectorInterface, interface_id: u32, connected: bool, encoders: &[usize]) -> Self {
        self.connectors.push(ConnectorSpec {
            interface,
            interface_id,
            connected,
            encoders: encoders.to_vec(),
            current_encoder: None,
            size_mm: Some((600, 340)),
            edid: None,
        });
        self
    }

    /// Add a connected writeback connector
    pub fn writeback_connector(self, interface_id: u32, encoders: &[usize]) -> Self {
        self.connector(ConnectorInterface::Writeback, interface_id, true, encoders)
    }

    /// Bind a connector to an encoder
    pub fn current_encoder(mut self, connector: usize, encoder: usize) -> Self {
        if let Some(spec) = self.connectors.get_mut(connector) {
            spec.current_encoder = Some(encoder);
        }
        self
    }

    /// Set the physical size of a connector, `None` for unknown
    pub fn size_mm(mut self, connector: usize, size: Option<(u32, u32)>) -> Self {
        if let Some(spec) = self.connectors.get_mut(connector) {
            spec.size_mm = size;
        }
        self
    }

    /// Attach an EDID blob to a connector
    pub fn edid(mut self, connector: usize, edid: &[u8]) -> Self {
        if let Some(spec) = self.connectors.get_mut(connector) {
            spec.edid = Some(edid.to_vec());
        }
        self
    }

    /// Add a primary plane
    pub fn primary_plane(self, possible_crtcs: u32) -> Self {
        self.plane(1, possible_crtcs)
    }

    /// Add an overlay plane
    pub fn overlay_plane(self, possible_crtcs: u32) -> Self {
        self.plane(0, possible_crtcs)
    }

    /// Add a cursor plane
    pub fn cursor_plane(self, possible_crtcs: u32) -> Self {
        self.plane(2, possible_crtcs)
    }

    fn plane(mut self, plane_type: u64, possible_crtcs: u32) -> Self {
        self.planes.push(PlaneSpec {
            plane_type,
            possible_crtcs,
        });
        self
    }

    /// Drop a property of the object at `index`
    pub fn without_property(mut self, object: ObjectType, index: usize, name: &'static str) -> Self {
        self.removed.push((object, index, name));
        self
    }

    /// Refuse the atomic and universal planes capabilities
    pub fn without_atomic(mut self) -> Self {
        self.atomic = false;
        self
    }

    /// Set the framebuffer size limits
    pub fn resolution_limits(mut self, min: (u32, u32), max: (u32, u32)) -> Self {
        self.min_size = min;
        self.max_size = max;
        self
    }

    /// Set the reported device path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

#[derive(Debug, Default)]
struct DummyState {
    resources: DeviceResources,
    next_id: u32,
    prop_handles: HashMap<(ObjectType, String), u32>,
    requests: Vec<(AtomicRequest, CommitFlags)>,
    set_properties: Vec<(u32, u32, u64)>,
    blobs: HashMap<u32, Vec<u8>>,
    framebuffers: Vec<u32>,
    fail_test: bool,
    fail_real: bool,
}

impl DummyState {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn prop(&mut self, object: ObjectType, name: &str, value: u64) -> (String, RawProperty) {
        let next = self.prop_handles.len() as u32 + 1;
        let handle = *self.prop_handles.entry((object, name.to_string())).or_insert(next);
        (name.to_string(), RawProperty::new(handle, value))
    }

    fn props_mut(&mut self, object: u32) -> Option<&mut HashMap<String, RawProperty>> {
        let res = &mut self.resources;
        if let Some(conn) = res.connectors.iter_mut().find(|c| c.id == object) {
            return Some(&mut conn.properties);
        }
        if let Some(crtc) = res.crtcs.iter_mut().find(|c| c.id == object) {
            return Some(&mut crtc.properties);
        }
        res.planes.iter_mut().find(|p| p.id == object).map(|p| &mut p.properties)
    }
}

type EnumerateHook = Box<dyn Fn() + Send + Sync>;

/// A simulated kms device
pub struct DummyDevice {
    path: Option<PathBuf>,
    atomic: bool,
    state: Mutex<DummyState>,
    on_enumerate: Mutex<Option<EnumerateHook>>,
}

impl fmt::Debug for DummyDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DummyDevice")
            .field("path", &self.path)
            .field("atomic", &self.atomic)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn default_modes() -> Vec<Mode> {
    vec![Mode::new(1920, 1080, 60).preferred(), Mode::new(1280, 720, 60)]
}

fn access_error(errmsg: &'static str, errno: i32) -> Error {
    Error::Access(AccessError {
        errmsg,
        dev: None,
        source: io::Error::from_raw_os_error(errno),
    })
}

impl DummyDevice {
    /// Build a device from a topology
    pub fn new(topology: Topology) -> DummyDevice {
        let mut state = DummyState {
            next_id: 30,
            ..DummyState::default()
        };

        let crtc_ids: Vec<u32> = (0..topology.crtcs).map(|_| state.alloc_id()).collect();
        let encoder_ids: Vec<u32> = topology.encoders.iter().map(|_| state.alloc_id()).collect();

        let mut crtcs = Vec::new();
        for (index, id) in crtc_ids.iter().enumerate() {
            let mut properties: HashMap<_, _> = ["ACTIVE", "MODE_ID", "OUT_FENCE_PTR"]
                .iter()
                .map(|name| state.prop(ObjectType::Crtc, name, 0))
                .collect();
            remove_props(&topology, ObjectType::Crtc, index, &mut properties);
            crtcs.push(CrtcInfo { id: *id, properties });
        }

        let encoders = topology
            .encoders
            .iter()
            .zip(&encoder_ids)
            .map(|((possible_crtcs, current), id)| EncoderInfo {
                id: *id,
                possible_crtcs: *possible_crtcs,
                current_crtc: current.and_then(|idx| crtc_ids.get(idx).copied()),
            })
            .collect();

        let mut connectors = Vec::new();
        for (index, spec) in topology.connectors.iter().enumerate() {
            let id = state.alloc_id();
            let edid = match &spec.edid {
                Some(edid) => {
                    let blob = state.alloc_id();
                    state.blobs.insert(blob, edid.clone());
                    blob as u64
                }
                None => 0,
            };
            let mut properties: HashMap<_, _> = [("CRTC_ID", 0), ("DPMS", 0), ("EDID", edid)]
                .iter()
                .map(|(name, value)| state.prop(ObjectType::Connector, name, *value))
                .collect();
            if spec.interface == ConnectorInterface::Writeback {
                for name in ["WRITEBACK_PIXEL_FORMATS", "WRITEBACK_FB_ID", "WRITEBACK_OUT_FENCE_PTR"] {
                    let (name, prop) = state.prop(ObjectType::Connector, name, 0);
                    properties.insert(name, prop);
                }
            }
            remove_props(&topology, ObjectType::Connector, index, &mut properties);
            connectors.push(ConnectorInfo {
                id,
                interface: spec.interface,
                interface_id: spec.interface_id,
                state: if spec.connected {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Disconnected
                },
                modes: if spec.connected { default_modes() } else { Vec::new() },
                encoders: spec.encoders.iter().filter_map(|idx| encoder_ids.get(*idx).copied()).collect(),
                current_encoder: spec.current_encoder.and_then(|idx| encoder_ids.get(idx).copied()),
                size_mm: spec.size_mm,
                properties,
            });
        }

        let mut planes = Vec::new();
        for (index, spec) in topology.planes.iter().enumerate() {
            let id = state.alloc_id();
            let mut properties: HashMap<_, _> = PLANE_PROPS
                .iter()
                .chain(OPTIONAL_PLANE_PROPS.iter().filter(|_| spec.plane_type != 2))
                .map(|name| state.prop(ObjectType::Plane, name, 0))
                .collect();
            let (name, prop) = state.prop(ObjectType::Plane, "type", spec.plane_type);
            properties.insert(name, prop);
            remove_props(&topology, ObjectType::Plane, index, &mut properties);
            planes.push(PlaneInfo {
                id,
                possible_crtcs: spec.possible_crtcs,
                formats: vec![DrmFourcc::Xrgb8888 as u32, DrmFourcc::Argb8888 as u32],
                properties,
            });
        }

        state.resources = DeviceResources {
            connectors,
            encoders,
            crtcs,
            planes,
            min_size: topology.min_size,
            max_size: topology.max_size,
        };

        DummyDevice {
            path: topology.path,
            atomic: topology.atomic,
            state: Mutex::new(state),
            on_enumerate: Mutex::new(None),
        }
    }

    /// Run `hook` every time the device is enumerated, before the objects are read
    pub fn on_enumerate(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_enumerate.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    fn lock(&self) -> MutexGuard<'_, DummyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the state and modes of the connector at `index`, visible with the next rescan
    pub fn set_connector(&self, index: usize, connected: bool, modes: Vec<Mode>) {
        if let Some(conn) = self.lock().resources.connectors.get_mut(index) {
            conn.state = if connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
            conn.modes = modes;
        }
    }

    /// Refuse test-only commits
    pub fn fail_test_commits(&self, fail: bool) {
        self.lock().fail_test = fail;
    }

    /// Refuse real commits
    pub fn fail_real_commits(&self, fail: bool) {
        self.lock().fail_real = fail;
    }

    /// All atomic requests received, test-only ones included
    pub fn requests(&self) -> Vec<(AtomicRequest, CommitFlags)> {
        self.lock().requests.clone()
    }

    /// The last atomic request received
    pub fn last_request(&self) -> Option<(AtomicRequest, CommitFlags)> {
        self.lock().requests.last().cloned()
    }

    /// Properties changed outside of atomic requests
    pub fn set_properties(&self) -> Vec<(u32, u32, u64)> {
        self.lock().set_properties.clone()
    }

    /// Ids of live property blobs, EDID blobs excluded
    pub fn blobs(&self) -> Vec<u32> {
        let state = self.lock();
        let edids: Vec<u64> = state
            .resources
            .connectors
            .iter()
            .filter_map(|conn| conn.properties.get("EDID").map(|prop| prop.value))
            .collect();
        let mut blobs: Vec<u32> = state
            .blobs
            .keys()
            .copied()
            .filter(|blob| !edids.contains(&(*blob as u64)))
            .collect();
        blobs.sort_unstable();
        blobs
    }

    /// Ids of live framebuffers
    pub fn framebuffers(&self) -> Vec<u32> {
        self.lock().framebuffers.clone()
    }
}

fn remove_props(
    topology: &Topology,
    object: ObjectType,
    index: usize,
    properties: &mut HashMap<String, RawProperty>,
) {
    for (ty, idx, name) in &topology.removed {
        if *ty == object && *idx == index {
            properties.remove(*name);
        }
    }
}

impl KmsDevice for DummyDevice {
    fn dev_path(&self) -> Option<PathBuf> {
        self.path.clone()
    }

    fn supports_atomic_and_universal_planes(&self) -> bool {
        self.atomic
    }

    fn enumerate(&self) -> Result<DeviceResources, Error> {
        if let Some(hook) = self.on_enumerate.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            hook();
        }
        Ok(self.lock().resources.clone())
    }

    fn rescan_connector(&self, id: u32) -> Result<ConnectorInfo, Error> {
        self.lock()
            .resources
            .connectors
            .iter()
            .find(|conn| conn.id == id)
            .cloned()
            .ok_or(Error::UnknownObject(ObjectType::Connector, id))
    }

    fn get_property(&self, object: u32, object_type: ObjectType, name: &str) -> Result<Option<RawProperty>, Error> {
        let mut state = self.lock();
        let props = state
            .props_mut(object)
            .ok_or(Error::UnknownObject(object_type, object))?;
        Ok(props.get(name).copied())
    }

    fn set_property(&self, object: u32, object_type: ObjectType, property: u32, value: u64) -> Result<(), Error> {
        let mut state = self.lock();
        let props = state
            .props_mut(object)
            .ok_or(Error::UnknownObject(object_type, object))?;
        match props.values_mut().find(|prop| prop.handle == property) {
            Some(prop) => prop.value = value,
            None => return Err(access_error("Failed to set property", libc::EINVAL)),
        }
        state.set_properties.push((object, property, value));
        Ok(())
    }

    fn get_blob(&self, blob: u32) -> Result<Vec<u8>, Error> {
        self.lock()
            .blobs
            .get(&blob)
            .cloned()
            .ok_or_else(|| access_error("Failed to get property blob", libc::ENOENT))
    }

    fn create_mode_blob(&self, mode: &Mode) -> Result<u32, Error> {
        let mut state = self.lock();
        let blob = state.alloc_id();
        state.blobs.insert(blob, mode.name.clone().into_bytes());
        Ok(blob)
    }

    fn destroy_blob(&self, blob: u32) -> Result<(), Error> {
        match self.lock().blobs.remove(&blob) {
            Some(_) => Ok(()),
            None => Err(access_error("Failed to destroy property blob", libc::ENOENT)),
        }
    }

    fn add_framebuffer(&self, _buffer: &BufferInfo) -> Result<u32, Error> {
        let mut state = self.lock();
        let fb = state.alloc_id();
        state.framebuffers.push(fb);
        Ok(fb)
    }

    fn remove_framebuffer(&self, fb: u32) -> Result<(), Error> {
        let mut state = self.lock();
        match state.framebuffers.iter().position(|id| *id == fb) {
            Some(pos) => {
                state.framebuffers.remove(pos);
                Ok(())
            }
            None => Err(access_error("Failed to destroy framebuffer", libc::ENOENT)),
        }
    }

    fn atomic_commit(&self, request: &AtomicRequest, flags: CommitFlags) -> Result<Option<OwnedFd>, Error> {
        let mut state = self.lock();
        state.requests.push((request.clone(), flags));

        let test_only = flags.contains(CommitFlags::TEST_ONLY);
        if test_only && state.fail_test {
            return Err(access_error("Error testing state", libc::EINVAL));
        }
        if !test_only && state.fail_real {
            return Err(access_error("Error committing state", libc::EIO));
        }
        for (object, property, _) in request.iter() {
            let known = state
                .props_mut(object)
                .map(|props| props.values().any(|prop| prop.handle == property))
                .unwrap_or(false);
            if !known {
                return Err(access_error("Unknown property in request", libc::EINVAL));
            }
        }
        if test_only {
            return Ok(None);
        }

        for (object, property, value) in request.iter() {
            if let Some(prop) = state
                .props_mut(object)
                .and_then(|props| props.values_mut().find(|prop| prop.handle == property))
            {
                prop.value = value;
            }
        }
        match request.out_fence() {
            Some(_) => eventfd(0, EventfdFlags::CLOEXEC)
                .map(Some)
                .map_err(|err| access_error("Failed to create fence", err.raw_os_error())),
            None => Ok(None),
        }
    }
}

/// Serves dummy devices by path
#[derive(Debug, Default)]
pub struct DummyOpener {
    devices: HashMap<PathBuf, Arc<DummyDevice>>,
}

impl DummyOpener {
    /// Opener without devices
    pub fn new() -> DummyOpener {
        DummyOpener::default()
    }

    /// Serve `device` at `path`
    pub fn with(mut self, path: impl Into<PathBuf>, device: DummyDevice) -> Self {
        self.devices.insert(path.into(), Arc::new(device));
        self
    }

    /// The device served at `path`
    pub fn device(&self, path: impl AsRef<Path>) -> Option<Arc<DummyDevice>> {
        self.devices.get(path.as_ref()).cloned()
    }
}

impl DeviceOpener for DummyOpener {
    fn exists(&self, path: &Path) -> bool {
        self.devices.contains_key(path)
    }

    fn open(&self, path: &Path) -> Result<Arc<dyn KmsDevice>, Error> {
        match self.devices.get(path) {
            Some(device) => Ok(device.clone()),
            None => Err(Error::Access(AccessError {
                errmsg: "Failed to open device",
                dev: Some(path.to_path_buf()),
                source: io::Error::from_raw_os_error(libc::ENOENT),
            })),
        }
    }
}

/// Describes fake single plane buffers
#[derive(Debug, Default)]
pub struct DummyImporter {
    buffers: HashMap<BufferHandle, (u32, u32, DrmFourcc)>,
}

impl DummyImporter {
    /// Importer without buffers
    pub fn new() -> DummyImporter {
        DummyImporter::default()
    }

    /// Make `handle` importable
    pub fn with_buffer(mut self, handle: BufferHandle, width: u32, height: u32, format: DrmFourcc) -> Self {
        self.buffers.insert(handle, (width, height, format));
        self
    }
}

impl BufferImporter for DummyImporter {
    fn import(&self, handle: &BufferHandle) -> Result<BufferInfo, ImportError> {
        let (width, height, format) = *self.buffers.get(handle).ok_or(ImportError::UnknownHandle(*handle))?;
        let fd = eventfd(0, EventfdFlags::CLOEXEC).map_err(|_| ImportError::InvalidPlanes(0))?;
        Ok(BufferInfo {
            width,
            height,
            format,
            modifier: None,
            planes: smallvec![BufferPlane {
                fd: Arc::new(fd),
                offset: 0,
                pitch: width * 4,
            }],
        })
    }
}
