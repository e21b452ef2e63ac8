#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like CRTC
#![allow(clippy::upper_case_acronyms)]

//! # kms-hwc: hardware composition on top of DRM/KMS
//!
//! This crate drives the scan-out hardware of one or more DRM devices on behalf of a
//! display server. It discovers the connectors, encoders, CRTCs and planes a device
//! exposes, binds them into exclusive output pipelines and maps the layers of every
//! frame onto hardware planes through atomic test-then-commit transactions.
//!
//! ## Structure of the crate
//!
//! - [`backend::drm`] contains the hardware side: the per-device resource registry,
//!   the ownership tracker, the pipeline assembler, the multi-device
//!   [`ResourceManager`](backend::drm::ResourceManager) and the per-display
//!   [`DisplayCompositor`](backend::drm::compositor::DisplayCompositor).
//! - [`composer`] contains the display-server facing side: logical displays with
//!   their layers, configs and power state, and the [`Composer`](composer::Composer)
//!   that owns them, forwards hot-plug notifications and produces dumps.
//! - [`config`] reads the handful of tunables from a key/value source.
//!
//! ## Threads and locking
//!
//! Unlike most display stacks built around a single event loop, this crate is meant to be
//! driven from several threads at once: one thread per display delivering vertical sync
//! events, one thread delivering hot-plug notifications and the display server's own
//! threads submitting frames. All ownership changes of hardware resources go through the
//! single lock of the [`ResourceManager`](backend::drm::ResourceManager), which is never
//! exposed and never held while calling back into the host.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod composer;
pub mod config;
pub mod utils;
