//! Common helpers shared across the allsky monitor crates.

/// Monitor configuration and settings management.
pub mod config;
/// Image loading, cropping, resizing, and tensor conversion.
pub mod image_utils;
/// Verdict type and atomic status-file publication.
pub mod status;
/// Instrumentation helpers for optional performance tracing.
pub mod telemetry;

use std::path::Path;

use anyhow::Result;
use log::LevelFilter;

pub use config::{CropDimensions, InputDimensions, MonitorSettings, default_settings_path};
pub use image_utils::{center_crop, center_crop_origin, load_image, resize_area, rgb_to_bgr_hwc};
pub use status::{Verdict, format_status, write_status};
pub use telemetry::{TimingGuard, timing_guard};

/// Initialize logging once for CLI and embedded environments.
///
/// This function respects the `RUST_LOG` environment variable if it is set.
/// Otherwise, it falls back to the provided default filter level.
///
/// # Arguments
///
/// * `default_filter` - The `LevelFilter` to use if `RUST_LOG` is not set.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module("allsky::telemetry", LevelFilter::Trace);

    if builder.try_init().is_err() {
        // Logger already initialized; nothing to do.
    }
    Ok(())
}

/// Validate that a path exists and resolve it to an absolute path.
///
/// # Arguments
///
/// * `path` - The path to validate and normalize.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<std::path::PathBuf> {
    let path = path.as_ref();
    anyhow::ensure!(path.exists(), "path does not exist: {}", path.display());
    Ok(path.canonicalize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_rejects_missing_paths() {
        let err = normalize_path("no/such/directory").expect_err("missing path must fail");
        assert!(format!("{err}").contains("does not exist"));
    }

    #[test]
    fn normalize_path_resolves_existing_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolved = normalize_path(dir.path()).expect("existing path");
        assert!(resolved.is_absolute());
    }
}
