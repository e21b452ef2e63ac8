use std::fmt::Write;

/// Frame counters of a display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Frames presented
    pub total_frames: u64,
    /// Frames whose test commit was refused
    pub failed_kms_validate: u64,
    /// Frames that failed to be presented
    pub failed_kms_present: u64,
    /// Frames that used client composition
    pub frames_flattened: u64,
    /// Pixels of all layers
    pub total_pixops: u64,
    /// Pixels of client composited layers
    pub gpu_pixops: u64,
}

impl Stats {
    /// Counters accumulated since `earlier`
    pub fn minus(&self, earlier: &Stats) -> Stats {
        Stats {
            total_frames: self.total_frames.saturating_sub(earlier.total_frames),
            failed_kms_validate: self.failed_kms_validate.saturating_sub(earlier.failed_kms_validate),
            failed_kms_present: self.failed_kms_present.saturating_sub(earlier.failed_kms_present),
            frames_flattened: self.frames_flattened.saturating_sub(earlier.frames_flattened),
            total_pixops: self.total_pixops.saturating_sub(earlier.total_pixops),
            gpu_pixops: self.gpu_pixops.saturating_sub(earlier.gpu_pixops),
        }
    }

    /// Share of pixels not composited by the client
    pub fn efficiency(&self) -> f64 {
        if self.total_pixops == 0 {
            return 1.0;
        }
        1.0 - self.gpu_pixops as f64 / self.total_pixops as f64
    }

    /// Human readable summary
    pub fn dump(&self) -> String {
        if self.total_pixops == 0 {
            return "No stats yet".into();
        }

        let mut out = String::new();
        let _ = writeln!(out, " Total frames count: {}", self.total_frames);
        let _ = writeln!(out, " Failed to test commit frames: {}", self.failed_kms_validate);
        let _ = writeln!(out, " Failed to commit frames: {}", self.failed_kms_present);
        if self.failed_kms_present > 0 {
            let _ = writeln!(out, " !!! Internal failure, FIX it please");
        }
        let _ = writeln!(out, " Flattened frames: {}", self.frames_flattened);
        let _ = writeln!(
            out,
            " Pixel operations (free units) : [TOTAL: {} / GPU: {}]",
            self.total_pixops, self.gpu_pixops
        );
        let _ = write!(out, " Composition efficiency: {}", self.efficiency());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stats() {
        assert_eq!(Stats::default().dump(), "No stats yet");
    }

    #[test]
    fn dump_lists_counters() {
        let stats = Stats {
            total_frames: 10,
            failed_kms_validate: 1,
            failed_kms_present: 0,
            frames_flattened: 2,
            total_pixops: 1000,
            gpu_pixops: 250,
        };
        let dump = stats.dump();
        assert!(dump.starts_with(" Total frames count: 10\n"));
        assert!(dump.contains(" Failed to test commit frames: 1\n"));
        assert!(!dump.contains("Internal failure"));
        assert!(dump.contains(" Pixel operations (free units) : [TOTAL: 1000 / GPU: 250]\n"));
        assert!(dump.ends_with(" Composition efficiency: 0.75"));

        let failed = Stats {
            failed_kms_present: 3,
            ..stats
        };
        assert!(failed.dump().contains(" !!! Internal failure, FIX it please\n"));
    }

    #[test]
    fn delta_since_earlier() {
        let earlier = Stats {
            total_frames: 4,
            total_pixops: 400,
            ..Stats::default()
        };
        let now = Stats {
            total_frames: 10,
            total_pixops: 1000,
            gpu_pixops: 100,
            ..Stats::default()
        };
        let delta = now.minus(&earlier);
        assert_eq!(delta.total_frames, 6);
        assert_eq!(delta.total_pixops, 600);
        assert_eq!(delta.gpu_pixops, 100);
    }
}
