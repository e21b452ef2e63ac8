use std::{io, path::PathBuf};

use super::device::ObjectType;
use crate::config::ConfigError;

/// Coarse classification of every failure of this crate
///
/// Raw error codes of the kernel never cross the pipeline or composition
/// interfaces, they are always translated into one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The hardware can not satisfy a requested mode, color mode or layer plan.
    ///
    /// The caller is expected to retry with a reduced request.
    ConfigRejection,
    /// No free plane, crtc or encoder is left for a request.
    ResourceExhaustion,
    /// The kernel refused something it accepted before. Logged, the frame is dropped.
    InternalFault,
    /// Nothing usable was found at startup.
    Fatal,
}

/// An error occurred while accessing the drm device
#[derive(Debug, thiserror::Error)]
#[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    #[source]
    pub source: io::Error,
}

impl AccessError {
    /// Whether the kernel rejected the arguments, rather than failing to process them
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.source.raw_os_error(),
            Some(libc::EINVAL) | Some(libc::ERANGE) | Some(libc::ENOSPC)
        )
    }
}

/// Errors thrown by the drm backend, the [`DeviceRegistry`](super::DeviceRegistry)
/// and the [`ResourceManager`](super::ResourceManager).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device encountered an access error
    #[error(transparent)]
    Access(#[from] AccessError),
    /// The device does not offer atomic modesetting with universal planes
    #[error("Device `{0:?}` does not support atomic modesetting with universal planes")]
    Unsupported(Option<PathBuf>),
    /// The device misses crtcs, connectors or encoders
    #[error("Device `{0:?}` is not a kms device")]
    NotKms(Option<PathBuf>),
    /// An object is missing a required property
    #[error("The {object:?} {id} is missing the required property '{name}'")]
    UnknownProperty {
        /// Type of the object
        object: ObjectType,
        /// Kernel id of the object
        id: u32,
        /// Property name
        name: &'static str,
    },
    /// An object id is not known to the device
    #[error("Unknown {0:?} with id {1}")]
    UnknownObject(ObjectType, u32),
    /// No device could be opened
    #[error("No eligible drm device found")]
    NoDevice,
    /// No connector could be used as primary display
    #[error("Failed to initialize any displays")]
    NoDisplays,
    /// No encoder, crtc and primary plane could be claimed for a connector
    #[error("No pipeline available for connector {0}")]
    NoPipelineAvailable(String),
    /// An atomic test commit was refused by the kernel
    #[error("Atomic test failed for crtc {0}")]
    TestFailed(u32),
    /// The configuration could not be read
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TestFailed(_) => ErrorKind::ConfigRejection,
            Error::Access(err) if err.is_rejection() => ErrorKind::ConfigRejection,
            Error::NoPipelineAvailable(_) => ErrorKind::ResourceExhaustion,
            Error::Access(_) | Error::UnknownProperty { .. } | Error::UnknownObject(..) => ErrorKind::InternalFault,
            Error::Unsupported(_)
            | Error::NotKms(_)
            | Error::NoDevice
            | Error::NoDisplays
            | Error::Config(_) => ErrorKind::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_errors_are_classified_by_errno() {
        let rejected = Error::Access(AccessError {
            errmsg: "Error testing state",
            dev: None,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        });
        assert_eq!(rejected.kind(), ErrorKind::ConfigRejection);

        let busy = Error::Access(AccessError {
            errmsg: "Error committing state",
            dev: None,
            source: io::Error::from_raw_os_error(libc::EIO),
        });
        assert_eq!(busy.kind(), ErrorKind::InternalFault);
        assert_eq!(Error::NoDisplays.kind(), ErrorKind::Fatal);
    }
}
