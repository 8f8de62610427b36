//! Label normalization for resized training images.
//!
//! Labels are extracted in the source frame (the original image, 450 px for
//! 300W-LP) and stored relative to the target frame the network sees
//! (typically 224 px). The compact layout additionally divides pose
//! translation by the source size, multiplies the pose scale by 1000 and
//! divides shape/texture by their eigenvalues.

use crate::layout::{self, Block, Layout, LayoutError, NUM_LANDMARKS};
use crate::model::FaceModel;
use crate::types::{FaceLabel, PhysicalParams, Pose};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Multiplier applied to the 3DDFA pose scale in compact labels.
pub const POSE_SCALE_FACTOR: f32 = 1000.0;
/// Trailing color value dropped from compact labels (always 1).
pub const COLOR_CONSTANT: f32 = 1.0;
/// Trailing illumination value dropped from compact labels (always 2).
pub const ILLUM_CONSTANT: f32 = 2.0;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("layout: {0}")]
    Layout(#[from] LayoutError),
    #[error("{block} has {actual} values, expected {expected}")]
    Coefficients {
        block: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("compact labels require a region of interest")]
    MissingRoi,
    #[error("eigenvalue {index} of {block} is zero")]
    ZeroEigenvalue { block: &'static str, index: usize },
}

/// Source and target image sizes for a resized dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameScaling {
    pub source_size: f32,
    pub target_size: f32,
}

impl FrameScaling {
    pub fn new(source_size: f32, target_size: f32) -> Self {
        Self {
            source_size,
            target_size,
        }
    }

    /// Target size over source size.
    pub fn ratio(&self) -> f32 {
        self.target_size / self.source_size
    }
}

impl Default for FrameScaling {
    fn default() -> Self {
        Self::new(450.0, 224.0)
    }
}

pub fn normalize_translation(t: [f32; 3], image_size: f32) -> [f32; 3] {
    t.map(|v| v / image_size)
}

pub fn unnormalize_translation(t: [f32; 3], image_size: f32) -> [f32; 3] {
    t.map(|v| v * image_size)
}

/// Divide coefficients by their eigenvalues. `ev` may be longer than `coeffs`.
pub fn eigen_normalize(
    coeffs: &[f32],
    ev: &[f32],
    block: &'static str,
) -> Result<Vec<f32>, NormalizeError> {
    if ev.len() < coeffs.len() {
        return Err(NormalizeError::Coefficients {
            block,
            expected: ev.len(),
            actual: coeffs.len(),
        });
    }
    coeffs
        .iter()
        .zip(ev)
        .enumerate()
        .map(|(index, (c, e))| {
            if *e == 0.0 {
                Err(NormalizeError::ZeroEigenvalue { block, index })
            } else {
                Ok(c / e)
            }
        })
        .collect()
}

/// Multiply coefficients back by their eigenvalues.
pub fn eigen_unnormalize(
    coeffs: &[f32],
    ev: &[f32],
    block: &'static str,
) -> Result<Vec<f32>, NormalizeError> {
    if ev.len() < coeffs.len() {
        return Err(NormalizeError::Coefficients {
            block,
            expected: ev.len(),
            actual: coeffs.len(),
        });
    }
    Ok(coeffs.iter().zip(ev).map(|(c, e)| c * e).collect())
}

/// Pack a source-frame label into a flat vector for `layout`.
pub fn normalize_label(
    layout: Layout,
    label: &FaceLabel,
    scaling: FrameScaling,
    model: &FaceModel,
) -> Result<Vec<f32>, NormalizeError> {
    let ratio = scaling.ratio();
    let mut landmarks: Vec<f32> = label.landmarks.iter().map(|v| v * ratio).collect();
    expect_len("landmarks", &landmarks, 2 * NUM_LANDMARKS)?;

    let mut pose = label.pose;
    let mut out = Vec::with_capacity(layout.len());

    match layout {
        Layout::Compact430 => {
            let roi = label.roi.ok_or(NormalizeError::MissingRoi)?;
            pose.translation = normalize_translation(pose.translation, scaling.source_size);
            pose.scale *= POSE_SCALE_FACTOR;

            let shape_ev = model.shape_ev().to_vec();
            let tex_ev = model.tex_ev().to_vec();
            let shape = eigen_normalize(&label.shape, &shape_ev, "shape")?;
            let tex = eigen_normalize(&label.texture, &tex_ev, "texture")?;

            out.extend(roi.iter().map(|v| (v * ratio).round()));
            out.append(&mut landmarks);
            out.extend_from_slice(&pose.to_block());
            push_block(&mut out, layout, Block::Shape, &shape)?;
            push_block(&mut out, layout, Block::Expression, &label.expression)?;
            push_block(&mut out, layout, Block::Color, &label.color)?;
            push_block(&mut out, layout, Block::Illumination, &label.illumination)?;
            push_block(&mut out, layout, Block::Texture, &tex)?;
        }
        Layout::Full587 => {
            pose.translation = pose.translation.map(|v| v * ratio);
            pose.scale *= ratio;

            push_block(&mut out, layout, Block::Shape, &label.shape)?;
            out.extend_from_slice(&pose.to_block());
            push_block(&mut out, layout, Block::Expression, &label.expression)?;
            push_block(&mut out, layout, Block::Color, &label.color)?;
            push_block(&mut out, layout, Block::Illumination, &label.illumination)?;
            out.append(&mut landmarks);
            push_block(&mut out, layout, Block::Texture, &label.texture)?;
        }
    }

    debug_assert_eq!(out.len(), layout.len());
    Ok(out)
}

/// Inverse of [`normalize_label`]: recover a source-frame label.
///
/// Compact labels lose the texture components past the 40th and the ROI
/// fraction lost to rounding; the dropped color and illumination constants
/// are restored.
pub fn unnormalize_label(
    layout: Layout,
    labels: &[f32],
    scaling: FrameScaling,
    model: &FaceModel,
) -> Result<FaceLabel, NormalizeError> {
    let parts = layout::split(layout, labels)?;
    let ratio = scaling.ratio();

    let landmarks = layout::landmarks_2xn(parts.require(Block::Landmarks)?)?.mapv(|v| v / ratio);
    let pose_block = parts.require(Block::Pose)?;
    let mut pose = Pose::from_block(pose_block).ok_or(NormalizeError::Coefficients {
        block: "pose",
        expected: 7,
        actual: pose_block.len(),
    })?;

    let label = match layout {
        Layout::Compact430 => {
            pose.translation = unnormalize_translation(pose.translation, scaling.source_size);
            pose.scale /= POSE_SCALE_FACTOR;

            let roi_block = parts.require(Block::Roi)?;
            let roi = [roi_block[0], roi_block[1], roi_block[2], roi_block[3]].map(|v| v / ratio);

            let mut color = parts.require(Block::Color)?.to_vec();
            color.push(COLOR_CONSTANT);
            let mut illumination = parts.require(Block::Illumination)?.to_vec();
            illumination.push(ILLUM_CONSTANT);

            FaceLabel {
                roi: Some(roi),
                landmarks,
                pose,
                shape: eigen_unnormalize(
                    parts.require(Block::Shape)?,
                    &model.shape_ev().to_vec(),
                    "shape",
                )?,
                expression: parts.require(Block::Expression)?.to_vec(),
                color,
                illumination,
                texture: eigen_unnormalize(
                    parts.require(Block::Texture)?,
                    &model.tex_ev().to_vec(),
                    "texture",
                )?,
            }
        }
        Layout::Full587 => {
            pose.translation = pose.translation.map(|v| v / ratio);
            pose.scale /= ratio;

            FaceLabel {
                roi: None,
                landmarks,
                pose,
                shape: parts.require(Block::Shape)?.to_vec(),
                expression: parts.require(Block::Expression)?.to_vec(),
                color: parts.require(Block::Color)?.to_vec(),
                illumination: parts.require(Block::Illumination)?.to_vec(),
                texture: parts.require(Block::Texture)?.to_vec(),
            }
        }
    };

    Ok(label)
}

/// Per-element factors mapping stored (normalized) coefficients to physical
/// target-frame parameters. Every mapping is a diagonal scaling, so the same
/// factors pull gradients back from physical to stored space.
#[derive(Debug, Clone)]
pub struct Denormalizer {
    translation: f32,
    scale: f32,
    shape: Vec<f32>,
}

impl Denormalizer {
    pub fn new(layout: Layout, scaling: FrameScaling, model: &FaceModel) -> Self {
        match layout {
            Layout::Compact430 => Self {
                translation: scaling.target_size,
                scale: scaling.ratio() / POSE_SCALE_FACTOR,
                shape: model.shape_ev().to_vec(),
            },
            Layout::Full587 => Self {
                translation: 1.0,
                scale: 1.0,
                shape: vec![1.0; model.shape_dims()],
            },
        }
    }

    /// Physical parameters from stored pose, shape and expression blocks.
    pub fn physical(
        &self,
        pose: &[f32],
        shape: &[f32],
        expression: &[f32],
    ) -> Result<PhysicalParams, NormalizeError> {
        let stored = Pose::from_block(pose).ok_or(NormalizeError::Coefficients {
            block: "pose",
            expected: 7,
            actual: pose.len(),
        })?;
        if shape.len() > self.shape.len() {
            return Err(NormalizeError::Coefficients {
                block: "shape",
                expected: self.shape.len(),
                actual: shape.len(),
            });
        }

        Ok(PhysicalParams {
            pose: Pose {
                angles: stored.angles,
                translation: stored.translation.map(|v| v * self.translation),
                scale: stored.scale * self.scale,
            },
            shape: shape.iter().zip(&self.shape).map(|(c, f)| c * f).collect(),
            expression: expression.to_vec(),
        })
    }

    /// Pull a physical pose gradient back to stored pose space.
    pub fn pull_back_pose(&self, grad: [f32; 7]) -> [f32; 7] {
        [
            grad[0],
            grad[1],
            grad[2],
            grad[3] * self.translation,
            grad[4] * self.translation,
            grad[5] * self.translation,
            grad[6] * self.scale,
        ]
    }

    /// Pull a physical shape gradient back to stored shape space, in place.
    pub fn pull_back_shape(&self, grad: &mut [f32]) {
        for (g, f) in grad.iter_mut().zip(&self.shape) {
            *g *= f;
        }
    }
}

fn expect_len(block: &'static str, values: &[f32], expected: usize) -> Result<(), NormalizeError> {
    if values.len() != expected {
        return Err(NormalizeError::Coefficients {
            block,
            expected,
            actual: values.len(),
        });
    }
    Ok(())
}

/// Append `values` truncated to the block width; shorter input is an error.
fn push_block(
    out: &mut Vec<f32>,
    layout: Layout,
    block: Block,
    values: &[f32],
) -> Result<(), NormalizeError> {
    let n = layout.block_len(block).ok_or(LayoutError::MissingBlock { layout, block })?;
    if values.len() < n {
        return Err(NormalizeError::Coefficients {
            block: block.name(),
            expected: n,
            actual: values.len(),
        });
    }
    out.extend_from_slice(&values[..n]);
    Ok(())
}
