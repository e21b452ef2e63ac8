use std::collections::BTreeMap;

use tracing::debug;

use crate::backend::drm::{ConnectorSummary, Mode};

/// Size of the fake mode exposed while no sink is connected
const HEADLESS_SIZE: (u16, u16) = (1024, 768);
const HEADLESS_REFRESH: u32 = 60;

/// Queryable properties of a [`DisplayConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Width in pixels
    Width,
    /// Height in pixels
    Height,
    /// Duration of one refresh cycle in nanoseconds
    VsyncPeriod,
    /// Horizontal density in dots per thousand inches, -1 if unknown
    DpiX,
    /// Vertical density in dots per thousand inches, -1 if unknown
    DpiY,
}

/// A mode of the display, numbered for the host
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConfig {
    /// Config id, starting at 1
    pub id: u32,
    /// The underlying mode
    pub mode: Mode,
    dpi: (i32, i32),
}

impl DisplayConfig {
    /// Value of an attribute
    pub fn attribute(&self, attribute: Attribute) -> i32 {
        match attribute {
            Attribute::Width => self.mode.hdisplay as i32,
            Attribute::Height => self.mode.vdisplay as i32,
            Attribute::VsyncPeriod => self.mode.vsync_period().as_nanos() as i32,
            Attribute::DpiX => self.dpi.0,
            Attribute::DpiY => self.dpi.1,
        }
    }
}

fn dpi(pixels: u16, mm: u32) -> i32 {
    if mm == 0 {
        return -1;
    }
    (pixels as u64 * 25400 / mm as u64) as i32
}

/// The configs of a display and the one currently active
#[derive(Debug, Clone, Default)]
pub struct DisplayConfigs {
    configs: BTreeMap<u32, DisplayConfig>,
    preferred: Option<u32>,
    active: Option<u32>,
}

impl DisplayConfigs {
    /// Number the modes of a connector.
    ///
    /// Interlaced modes are skipped if a progressive mode of the same size exists. A
    /// connector without modes gets a single headless config.
    pub fn from_connector(connector: &ConnectorSummary) -> DisplayConfigs {
        let modes: Vec<&Mode> = connector
            .modes
            .iter()
            .filter(|mode| {
                !mode.is_interlaced()
                    || !connector
                        .modes
                        .iter()
                        .any(|other| !other.is_interlaced() && other.size() == mode.size())
            })
            .collect();

        let size_mm = connector.size_mm.unwrap_or((0, 0));
        let mut configs = BTreeMap::new();
        let mut preferred = None;
        for (index, mode) in modes.into_iter().enumerate() {
            let id = index as u32 + 1;
            if preferred.is_none() && mode.is_preferred() {
                preferred = Some(id);
            }
            configs.insert(
                id,
                DisplayConfig {
                    id,
                    mode: mode.clone(),
                    dpi: (dpi(mode.hdisplay, size_mm.0), dpi(mode.vdisplay, size_mm.1)),
                },
            );
        }

        if configs.is_empty() {
            debug!(connector = %connector.name, "No modes, using headless config");
            let mode = Mode::new(HEADLESS_SIZE.0, HEADLESS_SIZE.1, HEADLESS_REFRESH).preferred();
            configs.insert(
                1,
                DisplayConfig {
                    id: 1,
                    mode,
                    dpi: (-1, -1),
                },
            );
        }

        let preferred = preferred.or_else(|| configs.keys().next().copied());
        DisplayConfigs {
            configs,
            preferred,
            active: None,
        }
    }

    /// Config ids, ascending
    pub fn ids(&self) -> Vec<u32> {
        self.configs.keys().copied().collect()
    }

    /// Lookup a config
    pub fn get(&self, id: u32) -> Option<&DisplayConfig> {
        self.configs.get(&id)
    }

    /// The first config flagged preferred, else the first config
    pub fn preferred(&self) -> Option<&DisplayConfig> {
        self.preferred.and_then(|id| self.configs.get(&id))
    }

    /// The active config
    pub fn active(&self) -> Option<&DisplayConfig> {
        self.active.and_then(|id| self.configs.get(&id))
    }

    /// Make `id` the active config, returns `false` for unknown ids
    pub fn set_active(&mut self, id: u32) -> bool {
        if self.configs.contains_key(&id) {
            self.active = Some(id);
            true
        } else {
            false
        }
    }

    /// Whether there are no configs
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::drm::{ConnectionState, ConnectorHandle, ConnectorKind, DeviceId, ModeFlags};

    fn summary(modes: Vec<Mode>, size_mm: Option<(u32, u32)>) -> ConnectorSummary {
        ConnectorSummary {
            handle: ConnectorHandle::new(DeviceId(0), 0),
            id: 50,
            name: "HDMI-A-1".into(),
            kind: ConnectorKind::External,
            state: ConnectionState::Connected,
            modes,
            size_mm,
            active_mode: None,
        }
    }

    #[test]
    fn preferred_mode_and_attributes() {
        let configs = DisplayConfigs::from_connector(&summary(
            vec![Mode::new(1280, 720, 60), Mode::new(1920, 1080, 60).preferred()],
            Some((508, 286)),
        ));
        assert_eq!(configs.ids(), vec![1, 2]);
        let preferred = configs.preferred().unwrap();
        assert_eq!(preferred.id, 2);
        assert_eq!(preferred.attribute(Attribute::Width), 1920);
        assert_eq!(preferred.attribute(Attribute::Height), 1080);
        assert_eq!(preferred.attribute(Attribute::DpiX), 1920 * 25400 / 508);
        let period = preferred.attribute(Attribute::VsyncPeriod);
        assert!((16_600_000..16_700_000).contains(&period));
        assert!(configs.active().is_none());
    }

    #[test]
    fn first_mode_without_preference() {
        let mut configs = DisplayConfigs::from_connector(&summary(
            vec![Mode::new(1280, 720, 60), Mode::new(800, 600, 60)],
            None,
        ));
        assert_eq!(configs.preferred().unwrap().id, 1);
        assert_eq!(configs.get(2).unwrap().attribute(Attribute::DpiY), -1);
        assert!(!configs.set_active(3));
        assert!(configs.set_active(2));
        assert_eq!(configs.active().unwrap().mode.size(), (800, 600));
    }

    #[test]
    fn interlaced_duplicates_are_skipped() {
        let mut interlaced = Mode::new(1920, 1080, 60);
        interlaced.flags |= ModeFlags::INTERLACE;
        let configs = DisplayConfigs::from_connector(&summary(
            vec![interlaced.clone(), Mode::new(1920, 1080, 60), Mode::new(720, 480, 60)],
            None,
        ));
        assert_eq!(configs.ids().len(), 2);
        assert!(configs.ids().iter().all(|id| !configs.get(*id).unwrap().mode.is_interlaced()));

        let alone = DisplayConfigs::from_connector(&summary(vec![interlaced], None));
        assert!(alone.get(1).unwrap().mode.is_interlaced());
    }

    #[test]
    fn headless_without_modes() {
        let configs = DisplayConfigs::from_connector(&summary(Vec::new(), None));
        assert_eq!(configs.ids(), vec![1]);
        assert_eq!(configs.preferred().unwrap().mode.size(), HEADLESS_SIZE);
    }
}
