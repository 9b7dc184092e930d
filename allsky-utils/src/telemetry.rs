//! Lightweight timing instrumentation.
//!
//! [`timing_guard`] returns an RAII guard that logs the elapsed duration of
//! a scope to the `allsky::telemetry` target when dropped. Guards only
//! activate when the requested level is enabled for that target (e.g. via
//! `RUST_LOG=allsky::telemetry=debug`), keeping the disabled-path overhead
//! to a single filter check.

use std::{
    borrow::Cow,
    time::{Duration, Instant},
};

use log::{Level, log, log_enabled};

const TARGET: &str = "allsky::telemetry";

/// RAII helper that logs how long an operation took when dropped.
pub struct TimingGuard {
    label: Cow<'static, str>,
    level: Level,
    start: Instant,
    active: bool,
}

impl TimingGuard {
    /// Returns the elapsed duration since the guard was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Consume the guard and return the elapsed duration without logging.
    pub fn finish(mut self) -> Duration {
        self.active = false;
        self.start.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if self.active {
            log!(
                target: TARGET,
                self.level,
                "{} completed in {:.2?}",
                self.label,
                self.start.elapsed()
            );
        }
    }
}

/// Create a timing guard that logs at the provided level when that level is
/// enabled for the telemetry target.
pub fn timing_guard(label: impl Into<Cow<'static, str>>, level: Level) -> TimingGuard {
    TimingGuard {
        label: label.into(),
        level,
        start: Instant::now(),
        active: log_enabled!(target: TARGET, level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reports_elapsed_without_logging() {
        let guard = timing_guard("test_scope", Level::Trace);
        let elapsed = guard.finish();
        assert!(elapsed < Duration::from_secs(1));
    }
}
