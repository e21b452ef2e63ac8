//! Backend helpers
//!
//! Collection of the system-facing parts of the hardware composer:
//!
//! - [`drm`] manages the display resources of drm devices and commits frames to them
//! - [`udev`] delivers hot-plug notifications of drm devices
//! - [`HotplugSource`] abstracts over where such notifications come from

pub mod drm;
pub mod udev;

pub use self::udev::{HotplugHandler, HotplugSource};
