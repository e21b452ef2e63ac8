//! Narrow interface to a kernel display device
//!
//! Everything the rest of the crate needs from a drm device goes through the
//! [`KmsDevice`] trait: a one-shot enumeration of all objects with their properties,
//! property queries, blob and framebuffer management and atomic commits.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{
    buffer::BufferInfo, error::Error, mode::Mode, properties::RawProperty, registry::ConnectionState,
    registry::ConnectorInterface,
};

#[cfg(feature = "backend_drm")]
pub(crate) mod fd;

/// Type of a kernel mode object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// Connector
    Connector,
    /// Encoder
    Encoder,
    /// Crtc
    Crtc,
    /// Plane
    Plane,
}

impl ObjectType {
    /// Object type constant used by the kernel
    pub fn raw(&self) -> u32 {
        match self {
            ObjectType::Connector => 0xc0c0_c0c0,
            ObjectType::Encoder => 0xe0e0_e0e0,
            ObjectType::Crtc => 0xcccc_cccc,
            ObjectType::Plane => 0xeeee_eeee,
        }
    }
}

/// Snapshot of a connector as reported by the device
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    /// Kernel id
    pub id: u32,
    /// Connector type
    pub interface: ConnectorInterface,
    /// Index of this connector among the connectors of the same type
    pub interface_id: u32,
    /// Connection state
    pub state: ConnectionState,
    /// Supported modes, as reported (possibly with duplicates)
    pub modes: Vec<Mode>,
    /// Kernel ids of the compatible encoders
    pub encoders: Vec<u32>,
    /// Kernel id of the currently bound encoder
    pub current_encoder: Option<u32>,
    /// Physical size in millimeters
    pub size_mm: Option<(u32, u32)>,
    /// Properties
    pub properties: HashMap<String, RawProperty>,
}

/// Snapshot of an encoder as reported by the device
#[derive(Debug, Clone)]
pub struct EncoderInfo {
    /// Kernel id
    pub id: u32,
    /// Bitmask of compatible crtcs, by crtc index
    pub possible_crtcs: u32,
    /// Kernel id of the currently bound crtc
    pub current_crtc: Option<u32>,
}

/// Snapshot of a crtc as reported by the device
#[derive(Debug, Clone)]
pub struct CrtcInfo {
    /// Kernel id
    pub id: u32,
    /// Properties
    pub properties: HashMap<String, RawProperty>,
}

/// Snapshot of a plane as reported by the device
#[derive(Debug, Clone)]
pub struct PlaneInfo {
    /// Kernel id
    pub id: u32,
    /// Bitmask of compatible crtcs, by crtc index
    pub possible_crtcs: u32,
    /// Supported fourcc codes
    pub formats: Vec<u32>,
    /// Properties, the plane type is read from the `type` property
    pub properties: HashMap<String, RawProperty>,
}

/// All objects of a device
#[derive(Debug, Clone, Default)]
pub struct DeviceResources {
    /// Connectors, in kernel order
    pub connectors: Vec<ConnectorInfo>,
    /// Encoders, in kernel order
    pub encoders: Vec<EncoderInfo>,
    /// Crtcs, in kernel order. The position is the crtc index used by `possible_crtcs`.
    pub crtcs: Vec<CrtcInfo>,
    /// Planes, in kernel order
    pub planes: Vec<PlaneInfo>,
    /// Minimal framebuffer size
    pub min_size: (u32, u32),
    /// Maximal framebuffer size
    pub max_size: (u32, u32),
}

impl DeviceResources {
    /// A device is only usable for modesetting with at least one crtc, connector and encoder
    pub fn is_kms(&self) -> bool {
        !self.crtcs.is_empty() && !self.connectors.is_empty() && !self.encoders.is_empty()
    }
}

bitflags::bitflags! {
    /// Flags of an atomic commit
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommitFlags: u32 {
        /// Request a page flip event
        const PAGE_FLIP_EVENT = 0x01;
        /// Only check whether the state would be accepted
        const TEST_ONLY = 0x0100;
        /// Do not block until the state is applied
        const NONBLOCK = 0x0200;
        /// Allow a full modeset
        const ALLOW_MODESET = 0x0400;
    }
}

/// A set of property changes applied in one atomic transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    properties: Vec<(u32, u32, u64)>,
    out_fence: Option<(u32, u32)>,
}

impl AtomicRequest {
    /// Create an empty request
    pub fn new() -> AtomicRequest {
        AtomicRequest::default()
    }

    /// Set `property` of `object` to `value`, replacing an earlier value in this request
    pub fn add_property(&mut self, object: u32, property: u32, value: u64) {
        match self
            .properties
            .iter_mut()
            .find(|(obj, prop, _)| *obj == object && *prop == property)
        {
            Some(entry) => entry.2 = value,
            None => self.properties.push((object, property, value)),
        }
    }

    /// Request an out-fence through the `OUT_FENCE_PTR` property of a crtc
    pub fn request_out_fence(&mut self, crtc: u32, property: u32) {
        self.out_fence = Some((crtc, property));
    }

    /// The requested out-fence, as (crtc id, property handle)
    pub fn out_fence(&self) -> Option<(u32, u32)> {
        self.out_fence
    }

    /// Value of a property in this request
    pub fn value(&self, object: u32, property: u32) -> Option<u64> {
        self.properties
            .iter()
            .find(|(obj, prop, _)| *obj == object && *prop == property)
            .map(|(_, _, value)| *value)
    }

    /// Iterate over (object, property, value)
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, u64)> + '_ {
        self.properties.iter().copied()
    }

    /// Number of property changes
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether the request changes nothing
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.out_fence.is_none()
    }
}

/// Fence signaled once the buffers of a commit are no longer scanned out
#[derive(Debug)]
pub struct OutFence(OwnedFd);

impl OutFence {
    /// Consume the fence, returning the underlying file descriptor
    pub fn into_fd(self) -> OwnedFd {
        self.0
    }
}

impl From<OwnedFd> for OutFence {
    fn from(fd: OwnedFd) -> Self {
        OutFence(fd)
    }
}

impl AsFd for OutFence {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Interface to a kernel display device
///
/// Implementations are expected to be cheap to share, all methods take `&self`.
pub trait KmsDevice: fmt::Debug + Send + Sync {
    /// Path of the device node, if known
    fn dev_path(&self) -> Option<PathBuf>;

    /// Whether the device accepted the atomic and universal planes client capabilities
    fn supports_atomic_and_universal_planes(&self) -> bool;

    /// Enumerate all objects of the device
    fn enumerate(&self) -> Result<DeviceResources, Error>;

    /// Query a connector again, forcing the kernel to detect the connected sink
    fn rescan_connector(&self, id: u32) -> Result<ConnectorInfo, Error>;

    /// Query a single property of an object
    fn get_property(&self, object: u32, object_type: ObjectType, name: &str) -> Result<Option<RawProperty>, Error>;

    /// Set a single property outside of an atomic transaction
    fn set_property(&self, object: u32, object_type: ObjectType, property: u32, value: u64) -> Result<(), Error>;

    /// Read the contents of a property blob
    fn get_blob(&self, blob: u32) -> Result<Vec<u8>, Error>;

    /// Create a property blob describing `mode`, returning the blob id
    fn create_mode_blob(&self, mode: &Mode) -> Result<u32, Error>;

    /// Destroy a property blob
    fn destroy_blob(&self, blob: u32) -> Result<(), Error>;

    /// Create a framebuffer from an imported buffer, returning the framebuffer id
    fn add_framebuffer(&self, buffer: &BufferInfo) -> Result<u32, Error>;

    /// Destroy a framebuffer
    fn remove_framebuffer(&self, fb: u32) -> Result<(), Error>;

    /// Execute an atomic request.
    ///
    /// If the request asks for an out-fence and the commit is not test-only the fence is returned.
    fn atomic_commit(&self, request: &AtomicRequest, flags: CommitFlags) -> Result<Option<OwnedFd>, Error>;
}

/// Opens device nodes
pub trait DeviceOpener {
    /// Whether something exists at `path`
    fn exists(&self, path: &Path) -> bool;

    /// Open the device at `path`
    fn open(&self, path: &Path) -> Result<Arc<dyn KmsDevice>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_replaces_values() {
        let mut req = AtomicRequest::new();
        assert!(req.is_empty());
        req.add_property(31, 7, 1);
        req.add_property(31, 8, 2);
        req.add_property(31, 7, 0);
        assert_eq!(req.len(), 2);
        assert_eq!(req.value(31, 7), Some(0));
        assert_eq!(req.value(32, 7), None);
        req.request_out_fence(40, 12);
        assert_eq!(req.out_fence(), Some((40, 12)));
    }
}
