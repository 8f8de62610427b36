//! Image decoding, resizing and feature extraction.

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array1;
use std::path::Path;
use thiserror::Error;

/// Pixel normalization: `x / 127.5 - 1` maps [0, 255] to [-1, 1].
const PIXEL_HALF_RANGE: f32 = 127.5;

#[derive(Error, Debug)]
pub enum ImageLoadError {
    #[error("image not found: {0}")]
    NotFound(String),
    #[error("decode {path}: {source}")]
    Decode {
        path: String,
        source: image::ImageError,
    },
}

/// Decode an image and resize it to `size × size` RGB.
pub fn load_image(path: impl AsRef<Path>, size: u32) -> Result<RgbImage, ImageLoadError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ImageLoadError::NotFound(path.display().to_string()));
    }
    let decoded = image::open(path).map_err(|source| ImageLoadError::Decode {
        path: path.display().to_string(),
        source,
    })?;
    let rgb = decoded.to_rgb8();
    if rgb.width() == size && rgb.height() == size {
        return Ok(rgb);
    }
    Ok(image::imageops::resize(&rgb, size, size, FilterType::Triangle))
}

pub fn normalize_pixel(v: u8) -> f32 {
    v as f32 / PIXEL_HALF_RANGE - 1.0
}

/// Network input: the image downsampled to `feature_size²` RGB cells,
/// normalized to [-1, 1] and flattened row-major (y, x, channel).
pub fn features(image: &RgbImage, feature_size: u32) -> Array1<f32> {
    let small = if image.width() == feature_size && image.height() == feature_size {
        image.clone()
    } else {
        image::imageops::resize(image, feature_size, feature_size, FilterType::Triangle)
    };
    small.pixels().flat_map(|p| p.0).map(normalize_pixel).collect()
}

pub fn feature_len(feature_size: u32) -> usize {
    (feature_size * feature_size * 3) as usize
}
