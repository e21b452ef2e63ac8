//! Buffers handed in by the host and their framebuffers
//!
//! The host identifies buffers by opaque [`BufferHandle`]s. A [`BufferImporter`]
//! translates a handle into a [`BufferInfo`] describing the dmabuf planes, from which a
//! [`Framebuffer`] is created on the device. Framebuffers are removed once the last
//! reference is dropped, so a committed composition keeps its framebuffers alive for as
//! long as it is scanned out.

use std::fmt;
use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use drm_fourcc::{DrmFourcc, DrmModifier};
use smallvec::SmallVec;
use tracing::{trace, warn};

use super::device::KmsDevice;
use super::error::Error;
use crate::utils::{Buffer as BufferCoords, Size};

/// Maximum amount of planes of a buffer
pub const MAX_PLANES: usize = 4;

/// Opaque handle of a buffer owned by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// One plane of a dmabuf
#[derive(Debug, Clone)]
pub struct BufferPlane {
    /// File descriptor of the plane
    pub fd: Arc<OwnedFd>,
    /// Offset from the start of the fd
    pub offset: u32,
    /// Stride of this plane
    pub pitch: u32,
}

/// Description of an imported buffer
#[derive(Debug, Clone)]
pub struct BufferInfo {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel format
    pub format: DrmFourcc,
    /// Format modifier, `None` for implicit modifiers
    pub modifier: Option<DrmModifier>,
    /// Planes, at least one
    pub planes: SmallVec<[BufferPlane; MAX_PLANES]>,
}

impl BufferInfo {
    /// Size of the buffer
    pub fn size(&self) -> Size<i32, BufferCoords> {
        Size::from((self.width as i32, self.height as i32))
    }
}

/// The buffer could not be translated
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The handle is not known to the importer
    #[error("Unknown buffer handle {0:?}")]
    UnknownHandle(BufferHandle),
    /// The buffer uses a format the importer can not describe
    #[error("Unsupported buffer format {0:?}")]
    UnsupportedFormat(DrmFourcc),
    /// The buffer has no planes or more than supported
    #[error("Invalid plane count {0}")]
    InvalidPlanes(usize),
}

/// Translates host buffer handles into buffer descriptions
pub trait BufferImporter: Send + Sync {
    /// Describe the buffer behind `handle`
    fn import(&self, handle: &BufferHandle) -> Result<BufferInfo, ImportError>;
}

impl fmt::Debug for dyn BufferImporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BufferImporter")
    }
}

impl<T: BufferImporter + ?Sized> BufferImporter for Arc<T> {
    fn import(&self, handle: &BufferHandle) -> Result<BufferInfo, ImportError> {
        (**self).import(handle)
    }
}

/// A framebuffer on a device, removed on drop
pub struct Framebuffer {
    id: u32,
    format: DrmFourcc,
    size: Size<i32, BufferCoords>,
    device: Arc<dyn KmsDevice>,
}

impl fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framebuffer")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("size", &self.size)
            .finish()
    }
}

impl Framebuffer {
    /// Create a framebuffer for `buffer` on `device`
    pub fn create(device: &Arc<dyn KmsDevice>, buffer: &BufferInfo) -> Result<Framebuffer, Error> {
        let id = device.add_framebuffer(buffer)?;
        trace!(fb = id, format = ?buffer.format, "Framebuffer created");
        Ok(Framebuffer {
            id,
            format: buffer.format,
            size: buffer.size(),
            device: device.clone(),
        })
    }

    /// Kernel id of the framebuffer
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Pixel format
    pub fn format(&self) -> DrmFourcc {
        self.format
    }

    /// Size of the underlying buffer
    pub fn size(&self) -> Size<i32, BufferCoords> {
        self.size
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        trace!(fb = self.id, "Destroying framebuffer");
        if let Err(err) = self.device.remove_framebuffer(self.id) {
            warn!(fb = self.id, ?err, "Failed to destroy framebuffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::drm::test::{DummyDevice, DummyImporter, Topology};

    #[test]
    fn framebuffer_is_removed_on_drop() {
        let dummy = Arc::new(DummyDevice::new(Topology::new()));
        let device: Arc<dyn KmsDevice> = dummy.clone();
        let importer = DummyImporter::new().with_buffer(BufferHandle(1), 64, 32, DrmFourcc::Argb8888);
        let info = importer.import(&BufferHandle(1)).unwrap();
        assert_eq!(info.size(), Size::from((64, 32)));

        let fb = Framebuffer::create(&device, &info).unwrap();
        assert_eq!(dummy.framebuffers(), vec![fb.id()]);
        drop(fb);
        assert!(dummy.framebuffers().is_empty());
        assert!(matches!(
            importer.import(&BufferHandle(2)),
            Err(ImportError::UnknownHandle(BufferHandle(2)))
        ));
    }
}
