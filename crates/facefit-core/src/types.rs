use serde::{Deserialize, Serialize};

/// Rigid pose in the 3DDFA convention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Rotation angles in radians: pitch, yaw, roll.
    pub angles: [f32; 3],
    /// Translation in image-space pixels of the target frame.
    pub translation: [f32; 3],
    /// Isotropic scale mapping model units to target-frame pixels.
    pub scale: f32,
}

impl Pose {
    /// Read a pose from the 7-value block `[pitch, yaw, roll, tx, ty, tz, s]`.
    pub fn from_block(block: &[f32]) -> Option<Self> {
        if block.len() < 7 {
            return None;
        }
        Some(Self {
            angles: [block[0], block[1], block[2]],
            translation: [block[3], block[4], block[5]],
            scale: block[6],
        })
    }

    pub fn to_block(&self) -> [f32; 7] {
        [
            self.angles[0],
            self.angles[1],
            self.angles[2],
            self.translation[0],
            self.translation[1],
            self.translation[2],
            self.scale,
        ]
    }
}

/// Unnormalized parameters ready for projection.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalParams {
    pub pose: Pose,
    /// Raw shape coefficients (eigenvalue scale restored).
    pub shape: Vec<f32>,
    /// Raw expression coefficients.
    pub expression: Vec<f32>,
}

/// Fully unnormalized label, as stored by the original dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceLabel {
    pub roi: Option<[f32; 4]>,
    /// Landmarks as (2, 68): row 0 = x, row 1 = y.
    pub landmarks: ndarray::Array2<f32>,
    /// Pose in the source frame (translation in source pixels, raw scale).
    pub pose: Pose,
    pub shape: Vec<f32>,
    pub expression: Vec<f32>,
    /// Color parameters, trailing constant restored (7 values).
    pub color: Vec<f32>,
    /// Illumination parameters, trailing constant restored (10 values).
    pub illumination: Vec<f32>,
    pub texture: Vec<f32>,
}
