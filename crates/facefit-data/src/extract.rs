//! 3DMM label extraction from 300W-LP / AFLW2000 `.mat` files.

use crate::mat::{LabelMat, MatError};
use facefit_core::normalize::{self, FrameScaling, NormalizeError};
use facefit_core::{FaceLabel, FaceModel, Layout, Pose, NUM_LANDMARKS};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("mat: {0}")]
    Mat(#[from] MatError),
    #[error("normalize: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("landmark field `{name}` has shape {dims:?}, expected at least 2x68")]
    Landmarks { name: String, dims: Vec<usize> },
}

/// Which dataset the label files come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    /// 300W-LP: 2D landmarks in `pt2d`.
    Lp300W,
    /// AFLW2000-3D: landmarks are the first two rows of `pt3d_68`.
    Aflw2000,
}

impl LabelSource {
    fn landmark_field(self) -> &'static str {
        match self {
            LabelSource::Lp300W => "pt2d",
            LabelSource::Aflw2000 => "pt3d_68",
        }
    }
}

/// Turns label files into flat coefficient vectors for one layout.
#[derive(Debug, Clone)]
pub struct LabelExtractor {
    layout: Layout,
    source: LabelSource,
    scaling: FrameScaling,
    model: Arc<FaceModel>,
}

impl LabelExtractor {
    pub fn new(layout: Layout, source: LabelSource, scaling: FrameScaling, model: Arc<FaceModel>) -> Self {
        Self {
            layout,
            source,
            scaling,
            model,
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn scaling(&self) -> FrameScaling {
        self.scaling
    }

    pub fn source(&self) -> LabelSource {
        self.source
    }

    pub fn model(&self) -> &Arc<FaceModel> {
        &self.model
    }

    /// Read the source-frame label fields.
    pub fn read_label(&self, mat: &LabelMat) -> Result<FaceLabel, ExtractError> {
        let pose_block = mat.vector("Pose_Para", Some(7))?;
        let pose = Pose::from_block(&pose_block).ok_or_else(|| {
            ExtractError::Mat(MatError::FieldSize {
                name: "Pose_Para".into(),
                expected: 7,
                actual: pose_block.len(),
            })
        })?;

        let roi = if mat.contains("roi") {
            let r = mat.vector("roi", Some(4))?;
            Some([r[0], r[1], r[2], r[3]])
        } else {
            None
        };

        Ok(FaceLabel {
            roi,
            landmarks: self.read_landmarks(mat)?,
            pose,
            shape: mat.vector("Shape_Para", None)?,
            expression: mat.vector("Exp_Para", None)?,
            color: mat.vector("Color_Para", None)?,
            illumination: mat.vector("Illum_Para", None)?,
            texture: mat.vector("Tex_Para", None)?,
        })
    }

    fn read_landmarks(&self, mat: &LabelMat) -> Result<Array2<f32>, ExtractError> {
        let name = self.source.landmark_field();
        let array = mat.get(name)?;
        if array.rows() < 2 || array.cols() != NUM_LANDMARKS {
            return Err(ExtractError::Landmarks {
                name: name.to_string(),
                dims: array.dims.clone(),
            });
        }
        let full = array.to_matrix();
        Ok(full.slice(ndarray::s![..2, ..]).to_owned())
    }

    /// Extract and normalize one label file into a flat vector.
    pub fn extract(&self, mat: &LabelMat) -> Result<Vec<f32>, ExtractError> {
        let label = self.read_label(mat)?;
        Ok(normalize::normalize_label(
            self.layout,
            &label,
            self.scaling,
            &self.model,
        )?)
    }
}
