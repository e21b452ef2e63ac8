use std::collections::HashMap;
use std::io;
use std::num::NonZeroU32;
use std::ops::{Bound, RangeBounds};
use std::os::unix::io::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use drm::buffer::{Handle as BufferObject, PlanarBuffer};
use drm::control::{
    atomic::AtomicModeReq, connector, crtc, encoder, framebuffer, from_u32, plane, property,
    AtomicCommitFlags, Device as ControlDevice, FbCmd2Flags, ResourceHandle,
};
use drm::{ClientCapability, Device as BasicDevice};
use drm_fourcc::{DrmFourcc, DrmModifier};
use rustix::fs::{Mode as FileMode, OFlags};
use tracing::{debug, error, info, info_span, trace, warn};

use super::{
    AtomicRequest, CommitFlags, ConnectorInfo, CrtcInfo, DeviceOpener, DeviceResources, EncoderInfo, KmsDevice,
    ObjectType, PlaneInfo,
};
use crate::backend::drm::{
    buffer::BufferInfo,
    error::{AccessError, Error},
    mode::Mode,
    properties::RawProperty,
    registry::{ConnectionState, ConnectorInterface},
};

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: OwnedFd,
    path: Option<PathBuf>,
    privileged: bool,
    atomic: bool,
    span: tracing::Span,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        let _guard = self.span.enter();
        info!("Dropping device: {:?}", self.path);
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device
///
/// Implements [`KmsDevice`] on top of the kernel's modesetting interface.
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl DrmDeviceFd {
    /// Open the device node at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<DrmDeviceFd, Error> {
        let path = path.as_ref();
        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK,
            FileMode::empty(),
        )
        .map_err(|err| {
            Error::Access(AccessError {
                errmsg: "Failed to open device",
                dev: Some(path.to_path_buf()),
                source: err.into(),
            })
        })?;
        Ok(DrmDeviceFd::new(fd, Some(path.to_path_buf())))
    }

    /// Create a new `DrmDeviceFd` from an already opened device node.
    ///
    /// This function will try to acquire the master lock for the underlying drm device
    /// and release the lock on drop again, so it should only be called once per node.
    /// It also requests the atomic and universal planes client capabilities.
    pub fn new(fd: OwnedFd, path: Option<PathBuf>) -> DrmDeviceFd {
        let span = info_span!("drm_fd", path = ?path);
        let mut dev = InternalDrmDeviceFd {
            fd,
            path,
            privileged: false,
            atomic: false,
            span,
        };
        let _guard = dev.span.clone().entered();

        // Newer kernels grant modesetting permissions if nobody else is master,
        // so failing to become master is not fatal.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        dev.atomic = dev.set_client_capability(ClientCapability::UniversalPlanes, true).is_ok()
            && dev.set_client_capability(ClientCapability::Atomic, true).is_ok();
        if !dev.atomic {
            warn!("Device does not accept the atomic client capability");
        }

        DrmDeviceFd(Arc::new(dev))
    }

    fn access(&self, errmsg: &'static str) -> impl FnOnce(io::Error) -> Error + '_ {
        move |source| {
            Error::Access(AccessError {
                errmsg,
                dev: self.0.path.clone(),
                source,
            })
        }
    }

    fn handle<T: From<drm::control::RawResourceHandle>>(&self, object_type: ObjectType, id: u32) -> Result<T, Error> {
        from_u32(id).ok_or(Error::UnknownObject(object_type, id))
    }

    fn properties<T: ResourceHandle>(&self, handle: T) -> Result<HashMap<String, RawProperty>, Error> {
        let props = self
            .0
            .get_properties(handle)
            .map_err(self.access("Error reading properties"))?;
        let (handles, values) = props.as_props_and_values();
        let mut map = HashMap::with_capacity(handles.len());
        for (prop, value) in handles.iter().zip(values) {
            match self.0.get_property(*prop) {
                Ok(info) => {
                    let name = info.name().to_string_lossy().into_owned();
                    map.insert(name, RawProperty::new(u32::from(*prop), *value));
                }
                Err(err) => debug!(?err, "Failed to query property info"),
            }
        }
        Ok(map)
    }

    fn object_properties(&self, object: u32, object_type: ObjectType) -> Result<HashMap<String, RawProperty>, Error> {
        match object_type {
            ObjectType::Connector => self.properties(self.handle::<connector::Handle>(object_type, object)?),
            ObjectType::Encoder => self.properties(self.handle::<encoder::Handle>(object_type, object)?),
            ObjectType::Crtc => self.properties(self.handle::<crtc::Handle>(object_type, object)?),
            ObjectType::Plane => self.properties(self.handle::<plane::Handle>(object_type, object)?),
        }
    }

    fn connector_info(&self, handle: connector::Handle, force: bool) -> Result<ConnectorInfo, Error> {
        let info = self
            .0
            .get_connector(handle, force)
            .map_err(self.access("Error loading connector info"))?;
        Ok(ConnectorInfo {
            id: u32::from(handle),
            interface: ConnectorInterface::from_raw(u32::from(info.interface())),
            interface_id: info.interface_id(),
            state: match info.state() {
                connector::State::Connected => ConnectionState::Connected,
                connector::State::Disconnected => ConnectionState::Disconnected,
                connector::State::Unknown => ConnectionState::Unknown,
            },
            modes: info.modes().iter().map(|mode| Mode::from(*mode)).collect(),
            encoders: info.encoders().iter().map(|enc| u32::from(*enc)).collect(),
            current_encoder: info.current_encoder().map(u32::from),
            size_mm: info.size(),
            properties: self.properties(handle)?,
        })
    }
}

fn crtc_mask(crtcs: &[crtc::Handle], compatible: &[crtc::Handle]) -> u32 {
    crtcs
        .iter()
        .enumerate()
        .filter(|(_, crtc)| compatible.contains(crtc))
        .fold(0, |mask, (index, _)| mask | (1 << index))
}

fn limits(range: impl RangeBounds<u32>) -> (u32, u32) {
    let min = match range.start_bound() {
        Bound::Included(v) | Bound::Excluded(v) => *v,
        Bound::Unbounded => 0,
    };
    let max = match range.end_bound() {
        Bound::Included(v) | Bound::Excluded(v) => *v,
        Bound::Unbounded => u32::MAX,
    };
    (min, max)
}

struct PrimeBuffer<'a> {
    info: &'a BufferInfo,
    handles: [Option<BufferObject>; 4],
}

impl<'a> PlanarBuffer for PrimeBuffer<'a> {
    fn size(&self) -> (u32, u32) {
        (self.info.width, self.info.height)
    }

    fn format(&self) -> DrmFourcc {
        self.info.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        self.info.modifier
    }

    fn pitches(&self) -> [u32; 4] {
        let mut pitches = [0; 4];
        for (pitch, plane) in pitches.iter_mut().zip(&self.info.planes) {
            *pitch = plane.pitch;
        }
        pitches
    }

    fn handles(&self) -> [Option<BufferObject>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        let mut offsets = [0; 4];
        for (offset, plane) in offsets.iter_mut().zip(&self.info.planes) {
            *offset = plane.offset;
        }
        offsets
    }
}

impl KmsDevice for DrmDeviceFd {
    fn dev_path(&self) -> Option<PathBuf> {
        self.0.path.clone()
    }

    fn supports_atomic_and_universal_planes(&self) -> bool {
        self.0.atomic
    }

    fn enumerate(&self) -> Result<DeviceResources, Error> {
        let _guard = self.0.span.enter();
        let res = self
            .0
            .resource_handles()
            .map_err(self.access("Error loading drm resources"))?;
        let planes = self.0.plane_handles().map_err(self.access("Error loading planes"))?;

        let crtcs = res
            .crtcs()
            .iter()
            .map(|crtc| {
                Ok(CrtcInfo {
                    id: u32::from(*crtc),
                    properties: self.properties(*crtc)?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let encoders = res
            .encoders()
            .iter()
            .map(|enc| {
                let info = self.0.get_encoder(*enc).map_err(self.access("Error loading encoder info"))?;
                Ok(EncoderInfo {
                    id: u32::from(*enc),
                    possible_crtcs: crtc_mask(res.crtcs(), &res.filter_crtcs(info.possible_crtcs())),
                    current_crtc: info.crtc().map(u32::from),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let connectors = res
            .connectors()
            .iter()
            .map(|conn| self.connector_info(*conn, false))
            .collect::<Result<Vec<_>, Error>>()?;

        let planes = planes
            .iter()
            .map(|plane| {
                let info = self.0.get_plane(*plane).map_err(self.access("Error loading plane info"))?;
                Ok(PlaneInfo {
                    id: u32::from(*plane),
                    possible_crtcs: crtc_mask(res.crtcs(), &res.filter_crtcs(info.possible_crtcs())),
                    formats: info.formats().to_vec(),
                    properties: self.properties(*plane)?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let (min_w, max_w) = limits(res.supported_fb_width());
        let (min_h, max_h) = limits(res.supported_fb_height());
        trace!(
            connectors = connectors.len(),
            crtcs = crtcs.len(),
            planes = planes.len(),
            "Enumerated device"
        );

        Ok(DeviceResources {
            connectors,
            encoders,
            crtcs,
            planes,
            min_size: (min_w, min_h),
            max_size: (max_w, max_h),
        })
    }

    fn rescan_connector(&self, id: u32) -> Result<ConnectorInfo, Error> {
        let handle = self.handle::<connector::Handle>(ObjectType::Connector, id)?;
        self.connector_info(handle, true)
    }

    fn get_property(&self, object: u32, object_type: ObjectType, name: &str) -> Result<Option<RawProperty>, Error> {
        Ok(self.object_properties(object, object_type)?.remove(name))
    }

    fn set_property(&self, object: u32, object_type: ObjectType, property: u32, value: u64) -> Result<(), Error> {
        let prop = self.handle::<property::Handle>(object_type, property)?;
        let res = match object_type {
            ObjectType::Connector => self
                .0
                .set_property(self.handle::<connector::Handle>(object_type, object)?, prop, value),
            ObjectType::Encoder => self
                .0
                .set_property(self.handle::<encoder::Handle>(object_type, object)?, prop, value),
            ObjectType::Crtc => self
                .0
                .set_property(self.handle::<crtc::Handle>(object_type, object)?, prop, value),
            ObjectType::Plane => self
                .0
                .set_property(self.handle::<plane::Handle>(object_type, object)?, prop, value),
        };
        res.map_err(self.access("Failed to set property"))
    }

    fn get_blob(&self, blob: u32) -> Result<Vec<u8>, Error> {
        self.0
            .get_property_blob(blob as u64)
            .map_err(self.access("Failed to get property blob"))
    }

    fn create_mode_blob(&self, mode: &Mode) -> Result<u32, Error> {
        let mode = drm::control::Mode::from(mode);
        match self
            .0
            .create_property_blob(&mode)
            .map_err(self.access("Failed to create blob for mode"))?
        {
            property::Value::Blob(id) => Ok(id as u32),
            _ => Err(self.access("Failed to create blob for mode")(io::Error::from(
                io::ErrorKind::InvalidData,
            ))),
        }
    }

    fn destroy_blob(&self, blob: u32) -> Result<(), Error> {
        self.0
            .destroy_property_blob(blob as u64)
            .map_err(self.access("Failed to destroy property blob"))
    }

    fn add_framebuffer(&self, buffer: &BufferInfo) -> Result<u32, Error> {
        let mut handles = [None; 4];
        for (handle, plane) in handles.iter_mut().zip(&buffer.planes) {
            *handle = Some(
                self.0
                    .prime_fd_to_buffer(plane.fd.as_fd())
                    .map_err(self.access("Failed to import dmabuf"))?,
            );
        }
        let prime = PrimeBuffer { info: buffer, handles };
        let flags = if buffer.modifier.is_some() {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        let res = self.0.add_planar_framebuffer(&prime, flags);

        // The framebuffer holds its own references
        let mut closed: Vec<BufferObject> = Vec::with_capacity(4);
        for handle in handles.into_iter().flatten() {
            if !closed.contains(&handle) {
                if let Err(err) = self.0.close_buffer(handle) {
                    warn!(?err, "Failed to close gem handle");
                }
                closed.push(handle);
            }
        }

        let fb: framebuffer::Handle = res.map_err(self.access("Failed to add framebuffer"))?;
        trace!(fb = ?fb, format = ?prime.format(), "Added framebuffer");
        Ok(u32::from(fb))
    }

    fn remove_framebuffer(&self, fb: u32) -> Result<(), Error> {
        let handle = from_u32::<framebuffer::Handle>(fb).ok_or_else(|| {
            self.access("Invalid framebuffer id")(io::Error::from_raw_os_error(libc::EINVAL))
        })?;
        self.0
            .destroy_framebuffer(handle)
            .map_err(self.access("Failed to destroy framebuffer"))
    }

    fn atomic_commit(&self, request: &AtomicRequest, flags: CommitFlags) -> Result<Option<OwnedFd>, Error> {
        let invalid = || self.access("Invalid object in atomic request")(io::Error::from_raw_os_error(libc::EINVAL));

        let mut req = AtomicModeReq::new();
        for (object, prop, value) in request.iter() {
            let object = NonZeroU32::new(object).ok_or_else(invalid)?;
            let prop = from_u32::<property::Handle>(prop).ok_or_else(invalid)?;
            req.add_raw_property(object, prop, value);
        }

        let mut out_fence: i32 = -1;
        let test_only = flags.contains(CommitFlags::TEST_ONLY);
        if let Some((crtc, prop)) = request.out_fence().filter(|_| !test_only) {
            let crtc = NonZeroU32::new(crtc).ok_or_else(invalid)?;
            let prop = from_u32::<property::Handle>(prop).ok_or_else(invalid)?;
            req.add_raw_property(crtc, prop, &mut out_fence as *mut i32 as u64);
        }

        let errmsg = if test_only {
            "Error testing state"
        } else {
            "Error committing state"
        };
        self.0
            .atomic_commit(AtomicCommitFlags::from_bits_truncate(flags.bits()), req)
            .map_err(self.access(errmsg))?;

        if out_fence >= 0 {
            // SAFETY: the kernel wrote a freshly created fence fd we now own
            Ok(Some(unsafe { OwnedFd::from_raw_fd(out_fence) }))
        } else {
            Ok(None)
        }
    }
}

/// Opens drm device nodes from the filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct DrmDeviceOpener;

impl DeviceOpener for DrmDeviceOpener {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn open(&self, path: &Path) -> Result<Arc<dyn KmsDevice>, Error> {
        Ok(Arc::new(DrmDeviceFd::open(path)?))
    }
}
