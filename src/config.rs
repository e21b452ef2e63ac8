//! Configuration of the hardware composer
//!
//! All tunables are read once, at initialization, from a [`ConfigSource`]: a read-only
//! key to string lookup. Two sources are provided, [`EnvConfig`] reading the process
//! environment and [`KeyValueConfig`] holding an in-memory map (which can be parsed from
//! a simple `key = value` text).
//!
//! | key | default | meaning |
//! |-----|---------|---------|
//! | `hwc.drm.device` | `/dev/dri/card%` | device node, a trailing `%` enumerates `card0`, `card1`, … |
//! | `hwc.drm.primary_display_order` | `...` | comma separated connector names, `...` appends the rest |
//! | `hwc.drm.use_overlay_planes` | `1` | non-zero enables overlay planes |
//! | `hwc.drm.scale_with_gpu` | `0` | anything not starting with `0` sends scaled layers to client composition |

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::backend::drm::ErrorKind;

/// Key of the device path pattern
pub const DEVICE_KEY: &str = "hwc.drm.device";
/// Key of the primary display ordering list
pub const DISPLAY_ORDER_KEY: &str = "hwc.drm.primary_display_order";
/// Key of the overlay plane switch
pub const USE_OVERLAY_PLANES_KEY: &str = "hwc.drm.use_overlay_planes";
/// Key of the forced gpu scaling switch
pub const SCALE_WITH_GPU_KEY: &str = "hwc.drm.scale_with_gpu";

const DEFAULT_DEVICE: &str = "/dev/dri/card%";
const DEFAULT_DISPLAY_ORDER: &str = "...";

/// Sentinel at the end of the display order, appending all unnamed connectors
pub const WILDCARD: &str = "...";

/// Errors thrown while reading the configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value could not be parsed
    #[error("Invalid value `{value}` for configuration key `{key}`")]
    InvalidValue {
        /// The offending key
        key: &'static str,
        /// The raw value
        value: String,
    },
    /// The device path pattern is empty
    #[error("Empty device path pattern")]
    EmptyDevicePath,
}

impl ConfigError {
    /// Classify this error, a broken configuration stops initialization
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Fatal
    }
}

/// Read-only key to string lookup
pub trait ConfigSource {
    /// Returns the raw value of `key`, if set
    fn get(&self, key: &str) -> Option<String>;
}

impl<T: ConfigSource + ?Sized> ConfigSource for &T {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }
}

/// [`ConfigSource`] reading the process environment
///
/// A key is mapped to an environment variable by upper-casing it and replacing dots
/// with underscores, `hwc.drm.device` is read from `HWC_DRM_DEVICE`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfig;

impl EnvConfig {
    /// Environment variable name for a given key
    pub fn var_name(key: &str) -> String {
        key.replace('.', "_").to_uppercase()
    }
}

impl ConfigSource for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(Self::var_name(key)).ok()
    }
}

/// In-memory [`ConfigSource`]
#[derive(Debug, Default, Clone)]
pub struct KeyValueConfig {
    data: HashMap<String, String>,
}

impl KeyValueConfig {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `key = value` text.
    ///
    /// Everything after a `#` is a comment, outer whitespace is stripped and
    /// lines without `=` are skipped.
    pub fn parse(text: &str) -> Self {
        let mut data = HashMap::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    data.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => warn!(line = i + 1, "Missing '=' in configuration line"),
            }
        }
        KeyValueConfig { data }
    }

    /// Set a value, returning `self` for chaining
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

impl ConfigSource for KeyValueConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }
}

/// Where to look for drm devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePath {
    /// A single device node
    Single(PathBuf),
    /// Enumerate `<prefix>0`, `<prefix>1`, … until a path does not exist
    Enumerate(String),
}

impl DevicePath {
    fn parse(pattern: &str) -> Result<DevicePath, ConfigError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(ConfigError::EmptyDevicePath);
        }
        Ok(match pattern.strip_suffix('%') {
            Some(prefix) => DevicePath::Enumerate(prefix.to_string()),
            None => DevicePath::Single(PathBuf::from(pattern)),
        })
    }

    /// Candidate paths in enumeration order, stopping at the first index for which
    /// `exists` returns `false`.
    pub fn candidates(&self, mut exists: impl FnMut(&PathBuf) -> bool) -> Vec<PathBuf> {
        match self {
            DevicePath::Single(path) => vec![path.clone()],
            DevicePath::Enumerate(prefix) => (0..)
                .map(|idx| PathBuf::from(format!("{}{}", prefix, idx)))
                .take_while(|path| exists(path))
                .collect(),
        }
    }
}

/// Ordering of connectors for primary display selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayOrder {
    /// Connector names, in priority order
    pub names: Vec<String>,
    /// Whether connectors not named are appended after the named ones
    pub use_others: bool,
}

impl DisplayOrder {
    /// Parse a comma separated list of connector names.
    pub fn parse(list: &str) -> DisplayOrder {
        let mut names: Vec<String> = list
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        let use_others = names.last().map(|name| name == WILDCARD).unwrap_or(false);
        if use_others {
            names.pop();
        }
        DisplayOrder { names, use_others }
    }
}

impl Default for DisplayOrder {
    fn default() -> Self {
        DisplayOrder::parse(DEFAULT_DISPLAY_ORDER)
    }
}

/// Typed configuration of the hardware composer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Device nodes to open
    pub device: DevicePath,
    /// Primary display ordering
    pub display_order: DisplayOrder,
    /// Whether overlay planes are claimed for pipelines
    pub use_overlay_planes: bool,
    /// Whether layers needing scaling are always composited by the client
    pub scale_with_gpu: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: DevicePath::Enumerate(DEFAULT_DEVICE.trim_end_matches('%').to_string()),
            display_order: DisplayOrder::default(),
            use_overlay_planes: true,
            scale_with_gpu: false,
        }
    }
}

impl Config {
    /// Read the configuration from a source, falling back to the defaults for unset keys
    pub fn load(source: impl ConfigSource) -> Result<Config, ConfigError> {
        let device = DevicePath::parse(&source.get(DEVICE_KEY).unwrap_or_else(|| DEFAULT_DEVICE.into()))?;
        let display_order = DisplayOrder::parse(
            &source
                .get(DISPLAY_ORDER_KEY)
                .unwrap_or_else(|| DEFAULT_DISPLAY_ORDER.into()),
        );
        let use_overlay_planes = match source.get(USE_OVERLAY_PLANES_KEY) {
            Some(value) => {
                value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: USE_OVERLAY_PLANES_KEY,
                        value: value.clone(),
                    })?
                    != 0
            }
            None => true,
        };
        let scale_with_gpu = source
            .get(SCALE_WITH_GPU_KEY)
            .map(|value| !value.starts_with('0'))
            .unwrap_or(false);

        let config = Config {
            device,
            display_order,
            use_overlay_planes,
            scale_with_gpu,
        };
        debug!(?config, "Loaded configuration");
        Ok(config)
    }
}
