use std::fmt;
use std::time::Duration;

bitflags::bitflags! {
    /// Origin and preference of a [`Mode`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModeTypeFlags: u32 {
        /// Builtin mode
        const BUILTIN = 1 << 0;
        /// Clock constrained
        const CLOCK_C = 1 << 1 | Self::BUILTIN.bits();
        /// Crtc constrained
        const CRTC_C = 1 << 2 | Self::BUILTIN.bits();
        /// Preferred mode of the connected sink
        const PREFERRED = 1 << 3;
        /// Default mode
        const DEFAULT = 1 << 4;
        /// Mode added by the user
        const USERDEF = 1 << 5;
        /// Mode reported by the driver
        const DRIVER = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Timing flags of a [`Mode`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModeFlags: u32 {
        /// Positive horizontal sync
        const PHSYNC = 1 << 0;
        /// Negative horizontal sync
        const NHSYNC = 1 << 1;
        /// Positive vertical sync
        const PVSYNC = 1 << 2;
        /// Negative vertical sync
        const NVSYNC = 1 << 3;
        /// Interlaced
        const INTERLACE = 1 << 4;
        /// Double scan
        const DBLSCAN = 1 << 5;
        /// Composite sync
        const CSYNC = 1 << 6;
        /// Double clock
        const DBLCLK = 1 << 12;
    }
}

/// Display timings of a connector
///
/// Mirrors the kernel's mode description, the pixel clock is given in kHz.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Mode {
    /// Human readable name, usually `<width>x<height>`
    pub name: String,
    /// Pixel clock in kHz
    pub clock: u32,
    /// Visible width
    pub hdisplay: u16,
    /// Start of horizontal sync
    pub hsync_start: u16,
    /// End of horizontal sync
    pub hsync_end: u16,
    /// Total horizontal size, including blanking
    pub htotal: u16,
    /// Horizontal skew
    pub hskew: u16,
    /// Visible height
    pub vdisplay: u16,
    /// Start of vertical sync
    pub vsync_start: u16,
    /// End of vertical sync
    pub vsync_end: u16,
    /// Total vertical size, including blanking
    pub vtotal: u16,
    /// Vertical scan
    pub vscan: u16,
    /// Nominal refresh rate in Hz
    pub vrefresh: u32,
    /// Timing flags
    pub flags: ModeFlags,
    /// Mode type
    pub mode_type: ModeTypeFlags,
}

impl Mode {
    /// Create a simple progressive mode, mostly useful for tests and virtual setups.
    ///
    /// The blanking intervals are synthesized so that the pixel clock matches the refresh rate.
    pub fn new(width: u16, height: u16, refresh: u32) -> Mode {
        let htotal = width.saturating_add(160);
        let vtotal = height.saturating_add(45);
        Mode {
            name: format!("{}x{}", width, height),
            clock: (htotal as u64 * vtotal as u64 * refresh as u64 / 1000) as u32,
            hdisplay: width,
            hsync_start: width.saturating_add(48),
            hsync_end: width.saturating_add(80),
            htotal,
            hskew: 0,
            vdisplay: height,
            vsync_start: height.saturating_add(3),
            vsync_end: height.saturating_add(8),
            vtotal,
            vscan: 0,
            vrefresh: refresh,
            flags: ModeFlags::PHSYNC | ModeFlags::PVSYNC,
            mode_type: ModeTypeFlags::DRIVER,
        }
    }

    /// Returns a copy flagged as preferred
    pub fn preferred(mut self) -> Mode {
        self.mode_type |= ModeTypeFlags::PREFERRED;
        self
    }

    /// Visible size as (width, height)
    pub fn size(&self) -> (u16, u16) {
        (self.hdisplay, self.vdisplay)
    }

    /// Whether the connected sink prefers this mode
    pub fn is_preferred(&self) -> bool {
        self.mode_type.contains(ModeTypeFlags::PREFERRED)
    }

    /// Whether this mode is interlaced
    pub fn is_interlaced(&self) -> bool {
        self.flags.contains(ModeFlags::INTERLACE)
    }

    /// Refresh rate in Hz, computed from the timings when possible
    pub fn refresh_rate(&self) -> f64 {
        if self.htotal != 0 && self.vtotal != 0 && self.clock != 0 {
            let mut refresh = self.clock as f64 * 1000.0 / (self.htotal as f64 * self.vtotal as f64);
            if self.is_interlaced() {
                refresh *= 2.0;
            }
            if self.flags.contains(ModeFlags::DBLSCAN) {
                refresh /= 2.0;
            }
            if self.vscan > 1 {
                refresh /= self.vscan as f64;
            }
            refresh
        } else {
            self.vrefresh as f64
        }
    }

    /// Duration of one refresh cycle
    pub fn vsync_period(&self) -> Duration {
        let refresh = self.refresh_rate();
        if refresh > 0.0 {
            Duration::from_secs_f64(1.0 / refresh)
        } else {
            Duration::from_millis(16)
        }
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mode {{ {} {}x{}@{} clock: {} }}",
            self.name, self.hdisplay, self.vdisplay, self.vrefresh, self.clock
        )
    }
}

#[cfg(feature = "backend_drm")]
impl From<drm::control::Mode> for Mode {
    fn from(mode: drm::control::Mode) -> Mode {
        let raw: drm_ffi::drm_mode_modeinfo = mode.into();
        let name = raw
            .name
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8 as char)
            .collect();
        Mode {
            name,
            clock: raw.clock,
            hdisplay: raw.hdisplay,
            hsync_start: raw.hsync_start,
            hsync_end: raw.hsync_end,
            htotal: raw.htotal,
            hskew: raw.hskew,
            vdisplay: raw.vdisplay,
            vsync_start: raw.vsync_start,
            vsync_end: raw.vsync_end,
            vtotal: raw.vtotal,
            vscan: raw.vscan,
            vrefresh: raw.vrefresh,
            flags: ModeFlags::from_bits_retain(raw.flags),
            mode_type: ModeTypeFlags::from_bits_retain(raw.type_),
        }
    }
}

#[cfg(feature = "backend_drm")]
impl From<&Mode> for drm::control::Mode {
    fn from(mode: &Mode) -> drm::control::Mode {
        // SAFETY: drm_mode_modeinfo is a plain C struct, all zeroes is a valid value
        let mut raw: drm_ffi::drm_mode_modeinfo = unsafe { std::mem::zeroed() };
        raw.clock = mode.clock;
        raw.hdisplay = mode.hdisplay;
        raw.hsync_start = mode.hsync_start;
        raw.hsync_end = mode.hsync_end;
        raw.htotal = mode.htotal;
        raw.hskew = mode.hskew;
        raw.vdisplay = mode.vdisplay;
        raw.vsync_start = mode.vsync_start;
        raw.vsync_end = mode.vsync_end;
        raw.vtotal = mode.vtotal;
        raw.vscan = mode.vscan;
        raw.vrefresh = mode.vrefresh;
        raw.flags = mode.flags.bits();
        raw.type_ = mode.mode_type.bits();
        for (dst, src) in raw.name.iter_mut().zip(mode.name.bytes().take(31)) {
            *dst = src as _;
        }
        drm::control::Mode::from(raw)
    }
}
