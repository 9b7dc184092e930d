//! Preprocessing for preparing camera frames for classification.
//!
//! The transform here must stay pixel-identical to the one the training
//! corpus was produced with: optional center crop, area-averaging resize,
//! `/255.0` normalization, and `[1, H, W, 3]` BGR tensor layout. Both the
//! runtime path and the `prep` training-corpus tool go through the same
//! `allsky_utils::image_utils` primitives to keep that guarantee.

use std::path::{Path, PathBuf};

use anyhow::Result;
use image::DynamicImage;
use log::warn;
use thiserror::Error;
use tract_onnx::prelude::Tensor;

use allsky_utils::{
    center_crop, load_image, resize_area, rgb_to_bgr_hwc,
    config::{CropDimensions, InputDimensions, MonitorSettings},
    timing_guard,
};

/// Error raised when an input frame cannot be turned into a tensor.
#[derive(Debug, Error)]
pub enum PreprocessError {
    /// The file could not be read or decoded as an image.
    #[error("could not read image {path}")]
    InvalidImage {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Configuration for preprocessing a frame before inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessConfig {
    /// Optional center crop applied before the resize. `None` skips the crop.
    pub crop: Option<CropDimensions>,
    /// Final tensor resolution; must match the classifier's input shape.
    pub target: InputDimensions,
}

impl From<&MonitorSettings> for PreprocessConfig {
    fn from(settings: &MonitorSettings) -> Self {
        Self {
            crop: settings.effective_crop(),
            target: settings.input,
        }
    }
}

/// Preprocess an image file into a classifier-ready tensor.
///
/// Decode failures surface as [`PreprocessError::InvalidImage`]; a valid
/// image always yields a `[1, H, W, 3]` tensor of values in `[0, 1]`.
pub fn preprocess_image<P: AsRef<Path>>(
    path: P,
    config: &PreprocessConfig,
) -> Result<Tensor, PreprocessError> {
    let path_ref = path.as_ref();
    let image = load_image(path_ref).map_err(|source| PreprocessError::InvalidImage {
        path: path_ref.to_path_buf(),
        source,
    })?;
    preprocess_dynamic_image(&image, config).map_err(|source| PreprocessError::InvalidImage {
        path: path_ref.to_path_buf(),
        source,
    })
}

/// Preprocess an in-memory image (useful for tests and the monitor loop,
/// which decodes once and reuses the frame for display).
pub fn preprocess_dynamic_image(image: &DynamicImage, config: &PreprocessConfig) -> Result<Tensor> {
    let _guard = timing_guard("allsky_core::preprocess", log::Level::Debug);
    anyhow::ensure!(
        config.target.width > 0 && config.target.height > 0,
        "target dimensions must be greater than zero"
    );

    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();

    let cropped = match config.crop {
        Some(CropDimensions {
            width: crop_w,
            height: crop_h,
        }) if crop_w > 0 && crop_h > 0 => {
            if width < crop_w || height < crop_h {
                // Never fail on an undersized frame; fall through to a
                // direct resize, exactly like the training-time converter.
                warn!(
                    "image {}x{} is smaller than crop {}x{}; skipping crop and resizing directly",
                    width, height, crop_w, crop_h
                );
                rgb
            } else {
                center_crop(&rgb, crop_w, crop_h)?
            }
        }
        _ => rgb,
    };

    let resized = resize_area(&cropped, config.target.width, config.target.height);

    let array = rgb_to_bgr_hwc(&resized).mapv(|v| v / 255.0);
    let (data, offset) = array.into_raw_vec_and_offset();
    debug_assert_eq!(offset, Some(0), "expected contiguous array");
    let shape = [
        1usize,
        config.target.height as usize,
        config.target.width as usize,
        3,
    ];
    Tensor::from_shape(&shape, &data)
        .map_err(|e| anyhow::anyhow!("failed to build input tensor: {e}"))
}
