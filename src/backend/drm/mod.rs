//! Drm/Kms resource management and atomic composition
//!
//! This module turns the raw objects of one or more drm devices into exclusive output
//! pipelines and drives them with atomic commits.
//!
//! ## Building blocks
//!
//! - A [`KmsDevice`] is the narrow interface to a kernel device: it enumerates the
//!   connectors, encoders, crtcs and planes together with their properties and executes
//!   atomic requests. [`DrmDeviceFd`] implements it on top of [`drm-rs`](drm), the
//!   simulated [`test::DummyDevice`] implements it for tests.
//! - A [`DeviceRegistry`] holds the discovered objects of one device in an arena, every
//!   object is addressed by a stable handle ([`ConnectorHandle`], [`CrtcHandle`], …).
//! - The [`OwnershipTracker`] records which claimant uses which object. Objects are
//!   never handed out twice.
//! - [`assemble`] searches a legal encoder, crtc and plane set for a connector and claims
//!   them for it, producing a [`DisplayPipeline`].
//! - The [`ResourceManager`] aggregates the registries of all devices, orders the
//!   connectors into display slots and offers the transactional operations
//!   (`assemble`, `teardown`, `reorder`, `refresh_connectors`). Its lock is internal.
//! - A [`DisplayCompositor`](compositor::DisplayCompositor) bound to a pipeline plans
//!   layers onto planes and commits them.
//!
//! ## How to use it
//!
//! ```rust,ignore
//! use kms_hwc::backend::drm::{compositor::{CommitMode, DisplayCompositor}, DrmDeviceOpener, ResourceManager};
//! use kms_hwc::config::{Config, EnvConfig};
//!
//! let config = Config::load(EnvConfig)?;
//! let manager = ResourceManager::init(config, &DrmDeviceOpener)?;
//! let (_slot, connector) = manager.available_connectors().into_iter().next().unwrap();
//! let pipeline = manager.assemble(connector).expect("No pipeline available");
//! let mut compositor = DisplayCompositor::new(pipeline);
//! compositor.stage_mode(manager.connector_info(connector).unwrap().modes[0].clone());
//! let outcome = compositor.plan_and_commit(layers, CommitMode::Real)?;
//! ```

pub mod compositor;
pub(crate) mod device;
mod error;
mod manager;
mod mode;
mod ownership;
mod pipeline;
mod properties;
mod registry;
pub mod vsync;

mod buffer;

#[cfg(any(test, feature = "backend_test"))]
pub mod test;

pub use buffer::{BufferHandle, BufferImporter, BufferInfo, BufferPlane, Framebuffer, ImportError};
#[cfg(feature = "backend_drm")]
pub use device::fd::{DrmDeviceFd, DrmDeviceOpener};
pub use device::{
    AtomicRequest, CommitFlags, ConnectorInfo, CrtcInfo, DeviceOpener, DeviceResources, EncoderInfo, KmsDevice,
    ObjectType, OutFence, PlaneInfo,
};
pub use error::{AccessError, Error, ErrorKind};
pub use manager::{order_primary_candidates, ConnectorEvent, ConnectorSummary, ResourceManager};
pub use mode::{Mode, ModeFlags, ModeTypeFlags};
pub use ownership::{AlreadyOwned, Claimant, ClaimTransaction, ObjectKey, OwnershipTracker};
pub use pipeline::{assemble, DisplayPipeline};
pub use properties::{Property, PropertyStore, RawProperty};
pub use registry::{
    ConnectionState, Connector, ConnectorHandle, ConnectorInterface, ConnectorKind, ConnectorStatus, Crtc,
    CrtcHandle, DeviceId, DeviceRegistry, Encoder, EncoderHandle, Plane, PlaneHandle, PlaneType,
};
