//! Landmark overlays for evaluation images.

use image::{Rgb, RgbImage};
use ndarray::{s, ArrayView2, ArrayView3};
use std::path::{Path, PathBuf};

const PREDICTED: Rgb<u8> = Rgb([255, 48, 48]);
const LABELLED: Rgb<u8> = Rgb([48, 255, 48]);
/// Half-length of each marker arm, in pixels.
const MARKER_RADIUS: i64 = 2;

/// Copy of `image` with labelled landmarks (green) and predicted landmarks
/// (red) drawn as small crosses. Points are (2, n): row 0 = x, row 1 = y.
pub fn draw_landmarks(image: &RgbImage, predicted: ArrayView2<'_, f32>, labelled: Option<ArrayView2<'_, f32>>) -> RgbImage {
    let mut out = image.clone();
    if let Some(l) = labelled {
        draw_points(&mut out, l, LABELLED);
    }
    draw_points(&mut out, predicted, PREDICTED);
    out
}

fn draw_points(image: &mut RgbImage, points: ArrayView2<'_, f32>, color: Rgb<u8>) {
    let (w, h) = (image.width() as i64, image.height() as i64);
    for k in 0..points.ncols() {
        let (x, y) = (points[[0, k]], points[[1, k]]);
        if !x.is_finite() || !y.is_finite() {
            continue;
        }
        let (cx, cy) = (x.round() as i64, y.round() as i64);
        for d in -MARKER_RADIUS..=MARKER_RADIUS {
            for (px, py) in [(cx + d, cy), (cx, cy + d)] {
                if (0..w).contains(&px) && (0..h).contains(&py) {
                    image.put_pixel(px as u32, py as u32, color);
                }
            }
        }
    }
}

/// Write `step_<step>_<i>.png` overlays for each image into `dir`.
pub fn save_overlays(
    dir: &Path,
    step: u64,
    images: &[RgbImage],
    predicted: ArrayView3<'_, f32>,
    labelled: Option<ArrayView3<'_, f32>>,
) -> Result<Vec<PathBuf>, image::ImageError> {
    std::fs::create_dir_all(dir)?;
    let mut paths = Vec::with_capacity(images.len());
    for (i, img) in images.iter().enumerate().take(predicted.shape()[0]) {
        let overlay = draw_landmarks(
            img,
            predicted.slice(s![i, .., ..]),
            labelled.as_ref().map(|l| l.slice(s![i, .., ..])),
        );
        let path = dir.join(format!("step_{step}_{i}.png"));
        overlay.save(&path)?;
        paths.push(path);
    }
    tracing::debug!(dir = %dir.display(), step, count = paths.len(), "evaluation overlays written");
    Ok(paths)
}
