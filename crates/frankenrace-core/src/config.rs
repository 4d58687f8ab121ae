//! Detector configuration.
//!
//! Limits are plain fields on [`DetectorConfig`], overridable from
//! `FRANKENRACE_*` variables. The process-wide report mode is read from
//! `FRANKENRACE_MODE`:
//! - `report` (default): report races and keep running.
//! - `halt`: die after the first race report.
//! - `off`: record nothing; entry points return immediately.

use std::sync::OnceLock;

use crate::vector_clock::MAX_TID_SPACE;

/// Records kept per 8-byte granule.
pub const HISTORY_SIZE: usize = 4;

/// What the detector does when it finds a race.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportMode {
    /// Report every race and continue.
    #[default]
    Report,
    /// Die right after the first race is reported.
    HaltOnRace,
    /// Detection disabled.
    Off,
}

impl ReportMode {
    /// Parse from string (case-insensitive). Unknown values fall back to `Report`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "report" | "default" | "on" => Self::Report,
            "halt" | "halt_on_error" | "abort" | "die" => Self::HaltOnRace,
            "off" | "none" | "disabled" => Self::Off,
            _ => Self::Report,
        }
    }

    #[must_use]
    pub const fn enabled(self) -> bool {
        !matches!(self, Self::Off)
    }

    #[must_use]
    pub const fn halts(self) -> bool {
        matches!(self, Self::HaltOnRace)
    }
}

/// Tunables consumed by every registry in the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Identifier space for threads (process-wide thread count limit).
    pub max_threads: usize,
    /// Dead contexts held back before their tid may be reused.
    pub thread_quarantine_size: usize,
    /// Lock-free insertion attempts before falling back to the registry lock.
    pub cas_retry_limit: usize,
    /// Slot capacity of the sync-object arena.
    pub max_sync_objects: usize,
    /// Slot capacity of the allocation-block arena.
    pub max_blocks: usize,
    /// Process exit code `finalize` reports when races were found.
    pub exit_code: i32,
    pub report_mode: ReportMode,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_threads: MAX_TID_SPACE,
            thread_quarantine_size: 16,
            cas_retry_limit: 64,
            max_sync_objects: 1 << 22,
            max_blocks: 1 << 24,
            exit_code: 66,
            report_mode: ReportMode::Report,
        }
    }
}

impl DetectorConfig {
    /// Defaults overlaid with `FRANKENRACE_*` environment variables. The
    /// report mode is the process-wide one from [`report_mode`].
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            report_mode: report_mode(),
            ..Self::from_vars(|key| std::env::var(key).ok())
        }
    }

    /// Defaults overlaid with whatever `lookup` yields for the
    /// `FRANKENRACE_*` keys. Unparsable values are ignored.
    #[must_use]
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = parse_var(&lookup, "FRANKENRACE_MAX_THREADS") {
            cfg.max_threads = v;
        }
        if let Some(v) = parse_var(&lookup, "FRANKENRACE_QUARANTINE") {
            cfg.thread_quarantine_size = v;
        }
        if let Some(v) = parse_var(&lookup, "FRANKENRACE_EXIT_CODE") {
            cfg.exit_code = v;
        }
        if let Some(v) = lookup(MODE_VAR) {
            cfg.report_mode = ReportMode::from_str_loose(v.trim());
        }
        cfg.normalized()
    }

    /// Clamp limits into the ranges the record encoding can express.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_threads = self.max_threads.clamp(1, MAX_TID_SPACE);
        self.cas_retry_limit = self.cas_retry_limit.max(1);
        self.max_sync_objects = self.max_sync_objects.clamp(1, crate::shadow::MAX_META_INDEX);
        self.max_blocks = self.max_blocks.clamp(1, crate::shadow::MAX_META_INDEX);
        self
    }
}

const MODE_VAR: &str = "FRANKENRACE_MODE";

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    lookup(key)?.trim().parse().ok()
}

static MODE: OnceLock<ReportMode> = OnceLock::new();

/// Process-wide report mode. `FRANKENRACE_MODE` is read on first use; later
/// changes to the environment are not observed.
#[must_use]
pub fn report_mode() -> ReportMode {
    *MODE.get_or_init(|| {
        std::env::var(MODE_VAR)
            .map(|v| ReportMode::from_str_loose(v.trim()))
            .unwrap_or_default()
    })
}
