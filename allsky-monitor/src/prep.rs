//! Batch preprocessing for training images.
//!
//! Applies the exact crop-and-resize pipeline the monitor uses at inference
//! time, writing each result next to its source as `<stem>_prepped.<ext>`.
//! Keeping training data and live frames on the same code path is what makes
//! the classifier's confidence numbers trustworthy.

use std::path::{Path, PathBuf};

use anyhow::Result;
use image::DynamicImage;
use log::{debug, info, warn};
use walkdir::WalkDir;

use allsky_utils::{
    config::MonitorSettings,
    image_utils::{center_crop, resize_area},
};

const PREPPED_SUFFIX: &str = "_prepped";
const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "gif"];

#[derive(Debug, Default, Clone, Copy)]
pub struct PrepReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Preprocess one image or every image under a directory.
pub fn prep_images(input: &Path, settings: &MonitorSettings) -> Result<PrepReport> {
    let images = collect_images(input)?;
    if images.is_empty() {
        anyhow::bail!(
            "no images found at {} (supported extensions: jpg, jpeg, png, bmp, gif)",
            input.display()
        );
    }

    info!("preprocessing {} image(s) from {}", images.len(), input.display());
    let mut report = PrepReport::default();
    for path in images {
        match prep_one(&path, settings) {
            Ok(Some(output)) => {
                debug!("{} -> {}", path.display(), output.display());
                report.processed += 1;
            }
            Ok(None) => {
                report.skipped += 1;
            }
            Err(e) => {
                warn!("failed to preprocess {}: {e:#}", path.display());
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Crop and resize a single image; returns the output path, or `None` for
/// files that are already preprocessed output.
fn prep_one(path: &Path, settings: &MonitorSettings) -> Result<Option<PathBuf>> {
    let Some(output) = prepped_path(path) else {
        debug!("skipping already-preprocessed {}", path.display());
        return Ok(None);
    };

    let image = image::open(path)?;
    let mut rgb = image.to_rgb8();

    if let Some(crop) = settings.effective_crop() {
        let (width, height) = rgb.dimensions();
        if width >= crop.width && height >= crop.height {
            rgb = center_crop(&rgb, crop.width, crop.height)?;
        } else {
            debug!(
                "{} is {}x{}, smaller than crop {}x{}; resizing directly",
                path.display(),
                width,
                height,
                crop.width,
                crop.height
            );
        }
    }

    let resized = resize_area(&rgb, settings.input.width, settings.input.height);
    DynamicImage::ImageRgb8(resized).save(&output)?;
    Ok(Some(output))
}

/// Output path for a source image, or `None` when the file already carries
/// the prepped suffix.
fn prepped_path(path: &Path) -> Option<PathBuf> {
    let stem = path.file_stem()?.to_str()?;
    if stem.ends_with(PREPPED_SUFFIX) {
        return None;
    }
    let ext = path.extension()?.to_str()?;
    Some(path.with_file_name(format!("{stem}{PREPPED_SUFFIX}.{ext}")))
}

fn collect_images(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    if !path.is_dir() {
        anyhow::bail!(
            "input path is neither file nor directory: {}",
            path.display()
        );
    }

    let mut images = Vec::new();
    for entry in WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        if let Some(ext) = entry.path().extension().and_then(|e| e.to_str()) {
            let ext_lower = ext.to_ascii_lowercase();
            if IMAGE_EXTENSIONS.contains(&ext_lower.as_str()) {
                images.push(entry.path().to_path_buf());
            } else {
                debug!("skipping non-image file {}", entry.path().display());
            }
        }
    }
    images.sort();
    Ok(images)
}
