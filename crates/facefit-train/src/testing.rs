//! In-memory fixtures shared by unit tests.

use facefit_core::{FaceModel, FaceModelParts};
use ndarray::{Array1, Array2};
use std::sync::Arc;

/// 80-vertex model with full-size bases (199 shape, 29 expression, 199 texture).
pub(crate) fn synthetic_model() -> Arc<FaceModel> {
    let n = 80;
    Arc::new(
        FaceModel::from_parts(FaceModelParts {
            shape_mu: Array1::from_shape_fn(3 * n, |i| ((i * 37) % 101) as f32 - 50.0),
            shape_pc: Array2::from_shape_fn((3 * n, 199), |(r, c)| (((r * 3 + c * 7) % 13) as f32 - 6.0) * 1e-3),
            shape_ev: Array1::from_shape_fn(199, |i| 2.0 + (i % 5) as f32),
            exp_pc: Array2::from_shape_fn((3 * n, 29), |(r, c)| (((r + c * 5) % 11) as f32 - 5.0) * 1e-2),
            exp_ev: None,
            tex_ev: Array1::from_shape_fn(199, |i| 1.0 + i as f32),
            landmark_indices: (0..68).map(|i| i + 6).collect(),
        })
        .expect("synthetic model is consistent"),
    )
}
