//! Image loading, cropping, resizing, and tensor conversion.
//!
//! These primitives are shared by the runtime preprocessing path and the
//! offline training-corpus prep tool. The training corpus was produced with
//! OpenCV, so [`resize_area`] reimplements `INTER_AREA` exactly and
//! [`rgb_to_bgr_hwc`] keeps OpenCV's BGR channel order; both sides of the
//! train/inference boundary must keep using these same functions.

use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, Rgb, RgbImage, imageops};
use ndarray::Array3;

/// Load an image from disk into memory.
///
/// # Arguments
///
/// * `path` - The path to the image file.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path_ref = path.as_ref();
    image::open(path_ref).with_context(|| format!("failed to open image {}", path_ref.display()))
}

/// Compute the origin of a centered crop using floor division.
///
/// Callers must ensure the image is at least as large as the crop.
pub fn center_crop_origin(width: u32, height: u32, crop_w: u32, crop_h: u32) -> (u32, u32) {
    ((width - crop_w) / 2, (height - crop_h) / 2)
}

/// Extract a centered `crop_w` x `crop_h` region from an image.
///
/// Returns an error if the image is smaller than the crop in either
/// dimension; callers that want the skip-on-undersized policy check first.
pub fn center_crop(image: &RgbImage, crop_w: u32, crop_h: u32) -> Result<RgbImage> {
    let (width, height) = image.dimensions();
    anyhow::ensure!(crop_w > 0 && crop_h > 0, "crop dimensions must be non-zero");
    anyhow::ensure!(
        width >= crop_w && height >= crop_h,
        "image {}x{} is smaller than the requested crop {}x{}",
        width,
        height,
        crop_w,
        crop_h
    );
    let (start_x, start_y) = center_crop_origin(width, height, crop_w, crop_h);
    Ok(imageops::crop_imm(image, start_x, start_y, crop_w, crop_h).to_image())
}

/// Resize an image using area-averaging interpolation.
///
/// Each destination pixel is the mean of the source rectangle it covers,
/// with fractional edge pixels weighted by their overlap. This matches
/// OpenCV's `INTER_AREA` for downscaling, which is what produced the
/// training corpus; the `image` crate offers no equivalent filter.
pub fn resize_area(image: &RgbImage, dst_w: u32, dst_h: u32) -> RgbImage {
    assert!(dst_w > 0 && dst_h > 0, "target dimensions must be non-zero");
    let (src_w, src_h) = image.dimensions();
    if src_w == dst_w && src_h == dst_h {
        return image.clone();
    }

    let scale_x = src_w as f64 / dst_w as f64;
    let scale_y = src_h as f64 / dst_h as f64;

    let mut out = RgbImage::new(dst_w, dst_h);
    for dy in 0..dst_h {
        let y0 = dy as f64 * scale_y;
        let y1 = (y0 + scale_y).min(src_h as f64);
        let sy0 = y0.floor() as u32;
        let sy1 = (y1.ceil() as u32).min(src_h);

        for dx in 0..dst_w {
            let x0 = dx as f64 * scale_x;
            let x1 = (x0 + scale_x).min(src_w as f64);
            let sx0 = x0.floor() as u32;
            let sx1 = (x1.ceil() as u32).min(src_w);

            let mut acc = [0f64; 3];
            let mut total = 0f64;
            for sy in sy0..sy1 {
                let wy = overlap(sy as f64, (sy + 1) as f64, y0, y1);
                if wy <= 0.0 {
                    continue;
                }
                for sx in sx0..sx1 {
                    let wx = overlap(sx as f64, (sx + 1) as f64, x0, x1);
                    if wx <= 0.0 {
                        continue;
                    }
                    let weight = wx * wy;
                    let px = image.get_pixel(sx, sy).0;
                    acc[0] += px[0] as f64 * weight;
                    acc[1] += px[1] as f64 * weight;
                    acc[2] += px[2] as f64 * weight;
                    total += weight;
                }
            }

            let pixel = if total > 0.0 {
                [
                    (acc[0] / total).round().clamp(0.0, 255.0) as u8,
                    (acc[1] / total).round().clamp(0.0, 255.0) as u8,
                    (acc[2] / total).round().clamp(0.0, 255.0) as u8,
                ]
            } else {
                [0u8; 3]
            };
            out.put_pixel(dx, dy, Rgb(pixel));
        }
    }
    out
}

fn overlap(a0: f64, a1: f64, b0: f64, b1: f64) -> f64 {
    (a1.min(b1) - a0.max(b0)).max(0.0)
}

/// Convert an RGB image into a BGR HWC array with raw channel values.
///
/// The training images were decoded with OpenCV, which stores pixels as BGR,
/// so the red and blue channels are swapped here to match.
///
/// # Arguments
///
/// * `image` - The RGB image to convert.
pub fn rgb_to_bgr_hwc(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut array = Array3::<f32>::zeros((height as usize, width as usize, 3));
    for (x, y, pixel) in image.enumerate_pixels() {
        let (xi, yi) = (x as usize, y as usize);
        array[(yi, xi, 0)] = pixel[2] as f32; // Blue
        array[(yi, xi, 1)] = pixel[1] as f32; // Green
        array[(yi, xi, 2)] = pixel[0] as f32; // Red
    }
    array
}
