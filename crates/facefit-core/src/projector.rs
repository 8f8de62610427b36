//! Landmark projector: model blend, rigid pose, image-space projection.
//!
//! Also provides the analytic gradient of a scalar loss w.r.t. pose, shape
//! and expression given the loss gradient on the projected landmarks.

use crate::layout::{Block, Layout};
use crate::model::{FaceModel, ModelError};
use crate::normalize::{Denormalizer, NormalizeError};
use crate::transform::{self, Projection};
use crate::types::PhysicalParams;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProjectorError {
    #[error("model: {0}")]
    Model(#[from] ModelError),
    #[error("normalize: {0}")]
    Normalize(#[from] NormalizeError),
    #[error("gradients are only available for orthographic projection")]
    GradientUnsupported,
    #[error("upstream gradient has shape {actual:?}, expected [2, {landmarks}]")]
    UpstreamShape { actual: Vec<usize>, landmarks: usize },
    #[error("{layout:?} predictions have no {block:?} block")]
    MissingBlock { layout: Layout, block: Block },
}

/// Gradients of a scalar loss w.r.t. physical parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGrads {
    /// `[pitch, yaw, roll, tx, ty, tz, s]`.
    pub pose: [f32; 7],
    pub shape: Vec<f32>,
    pub expression: Vec<f32>,
}

/// Projects model landmarks into a square output image.
#[derive(Debug, Clone)]
pub struct LandmarkProjector {
    model: Arc<FaceModel>,
    projection: Projection,
    output_size: f32,
}

impl LandmarkProjector {
    pub fn new(model: Arc<FaceModel>, projection: Projection, output_size: f32) -> Self {
        Self {
            model,
            projection,
            output_size,
        }
    }

    pub fn model(&self) -> &Arc<FaceModel> {
        &self.model
    }

    pub fn output_size(&self) -> f32 {
        self.output_size
    }

    pub fn num_landmarks(&self) -> usize {
        self.model.landmark_indices().len()
    }

    /// Projected landmarks as (2, landmarks): row 0 = x, row 1 = y.
    pub fn project(&self, params: &PhysicalParams) -> Result<Array2<f32>, ProjectorError> {
        let vertices = self
            .model
            .generate_landmark_vertices(&params.shape, &params.expression)?;
        let r = transform::angle_to_matrix_3ddfa(params.pose.angles);
        let moved = transform::similarity_transform(
            vertices.view(),
            params.pose.scale,
            &r,
            params.pose.translation,
        );
        let image = self
            .projection
            .project(moved.view(), self.output_size, self.output_size);
        Ok(image.slice(s![.., ..2]).t().to_owned())
    }

    /// Project and back-propagate `upstream` (dLoss/dLandmarks, shape (2, n)).
    pub fn project_with_grad(
        &self,
        params: &PhysicalParams,
        upstream: ArrayView2<'_, f32>,
    ) -> Result<(Array2<f32>, ParamGrads), ProjectorError> {
        if self.projection != Projection::Orthographic {
            return Err(ProjectorError::GradientUnsupported);
        }
        let n = self.num_landmarks();
        if upstream.shape() != &[2, n] {
            return Err(ProjectorError::UpstreamShape {
                actual: upstream.shape().to_vec(),
                landmarks: n,
            });
        }

        let vertices = self
            .model
            .generate_landmark_vertices(&params.shape, &params.expression)?;
        let pose = &params.pose;
        let s = pose.scale;
        let r = transform::angle_to_matrix_3ddfa(pose.angles);
        let dr = transform::angle_to_matrix_3ddfa_grad(pose.angles);

        let mut landmarks = Array2::<f32>::zeros((2, n));
        let mut grad_pose = [0.0f32; 7];
        // dLoss/dVertex, interleaved like the landmark basis rows.
        let mut grad_vertices = Array1::<f32>::zeros(3 * n);

        for (k, v) in vertices.outer_iter().enumerate() {
            let v = [v[0], v[1], v[2]];
            let rv = transform::rotate(&r, v);
            landmarks[[0, k]] = s * rv[0] + pose.translation[0];
            landmarks[[1, k]] = self.output_size - 1.0 - (s * rv[1] + pose.translation[1]);

            // Gradient w.r.t. the transformed point; y is flipped, z unused.
            let u = [upstream[[0, k]], -upstream[[1, k]], 0.0];

            grad_pose[3] += u[0];
            grad_pose[4] += u[1];
            grad_pose[6] += dot(u, rv);
            for (a, dra) in dr.iter().enumerate() {
                grad_pose[a] += s * dot(u, transform::rotate(dra, v));
            }

            let gv = transform::rotate_transposed(&r, u);
            for j in 0..3 {
                grad_vertices[3 * k + j] = s * gv[j];
            }
        }

        let shape = basis_grad(self.model.landmark_shape_basis(), &grad_vertices, params.shape.len());
        let expression = basis_grad(
            self.model.landmark_exp_basis(),
            &grad_vertices,
            params.expression.len(),
        );

        Ok((
            landmarks,
            ParamGrads {
                pose: grad_pose,
                shape,
                expression,
            },
        ))
    }

    /// Project a batch of network outputs (one row per sample, predicted
    /// block order) into (batch, 2, landmarks).
    pub fn project_predictions(
        &self,
        predictions: ArrayView2<'_, f32>,
        layout: Layout,
        denormalizer: &Denormalizer,
    ) -> Result<Array3<f32>, ProjectorError> {
        let n = self.num_landmarks();
        let mut out = Array3::<f32>::zeros((predictions.nrows(), 2, n));
        for (i, row) in predictions.outer_iter().enumerate() {
            let params = physical_from_prediction(row, layout, denormalizer)?;
            let lm = self.project(&params)?;
            out.slice_mut(s![i, .., ..]).assign(&lm);
        }
        Ok(out)
    }
}

/// Read pose, shape and expression out of a network output row.
pub fn physical_from_prediction(
    row: ArrayView1<'_, f32>,
    layout: Layout,
    denormalizer: &Denormalizer,
) -> Result<PhysicalParams, ProjectorError> {
    let block = |b: Block| -> Result<Vec<f32>, ProjectorError> {
        let range = layout
            .predicted_range(b)
            .ok_or(ProjectorError::MissingBlock { layout, block: b })?;
        Ok(row.slice(s![range]).to_vec())
    };
    let pose = block(Block::Pose)?;
    let shape = block(Block::Shape)?;
    let exp = block(Block::Expression)?;
    Ok(denormalizer.physical(&pose, &shape, &exp)?)
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// `basisᵀ · grad` restricted to the leading `dims` columns.
fn basis_grad(basis: &Array2<f32>, grad: &Array1<f32>, dims: usize) -> Vec<f32> {
    if dims == 0 {
        return Vec::new();
    }
    basis.slice(s![.., ..dims]).t().dot(grad).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::synthetic_model;
    use crate::types::Pose;

    fn params() -> PhysicalParams {
        PhysicalParams {
            pose: Pose {
                angles: [0.2, -0.35, 0.1],
                translation: [112.0, 115.0, 3.0],
                scale: 0.9,
            },
            shape: vec![0.4, -0.2, 1.0, 0.3, -0.7],
            expression: vec![0.5, -1.0, 0.25],
        }
    }

    /// Scalar test loss: weighted sum of landmark coordinates.
    fn weights(n: usize) -> Array2<f32> {
        Array2::from_shape_fn((2, n), |(r, c)| ((r * 7 + c * 3) % 5) as f32 * 0.1 - 0.2)
    }

    fn loss(proj: &LandmarkProjector, p: &PhysicalParams, w: &Array2<f32>) -> f32 {
        let lm = proj.project(p).unwrap();
        (&lm * w).sum()
    }

    #[test]
    fn test_identity_pose_projects_mean_shape() {
        let model = Arc::new(synthetic_model());
        let proj = LandmarkProjector::new(model.clone(), Projection::Orthographic, 224.0);
        let p = PhysicalParams {
            pose: Pose {
                angles: [0.0; 3],
                translation: [0.0; 3],
                scale: 1.0,
            },
            shape: vec![],
            expression: vec![],
        };
        let lm = proj.project(&p).unwrap();
        let v = model.generate_landmark_vertices(&[], &[]).unwrap();
        assert_eq!(lm.shape(), &[2, 68]);
        for k in 0..68 {
            assert!((lm[[0, k]] - v[[k, 0]]).abs() < 1e-5);
            assert!((lm[[1, k]] - (223.0 - v[[k, 1]])).abs() < 1e-4);
        }
    }

    #[test]
    fn test_project_with_grad_matches_project() {
        let proj = LandmarkProjector::new(Arc::new(synthetic_model()), Projection::Orthographic, 224.0);
        let p = params();
        let w = weights(68);
        let (lm, _) = proj.project_with_grad(&p, w.view()).unwrap();
        let plain = proj.project(&p).unwrap();
        assert!((&lm - &plain).iter().all(|d| d.abs() < 1e-3));
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let proj = LandmarkProjector::new(Arc::new(synthetic_model()), Projection::Orthographic, 224.0);
        let p = params();
        let w = weights(68);
        let (_, grads) = proj.project_with_grad(&p, w.view()).unwrap();

        let eps = 1e-2f32;
        let check = |analytic: f32, plus: PhysicalParams, minus: PhysicalParams, what: &str| {
            let fd = (loss(&proj, &plus, &w) - loss(&proj, &minus, &w)) / (2.0 * eps);
            let tol = 2e-2 * fd.abs().max(1.0);
            assert!((analytic - fd).abs() < tol, "{what}: analytic {analytic} vs fd {fd}");
        };

        for i in 0..7 {
            let mut plus = p.clone();
            let mut minus = p.clone();
            let mut bp = plus.pose.to_block();
            let mut bm = minus.pose.to_block();
            let step = if i == 6 { eps * 0.1 } else { eps };
            bp[i] += step;
            bm[i] -= step;
            plus.pose = Pose::from_block(&bp).unwrap();
            minus.pose = Pose::from_block(&bm).unwrap();
            let fd_scale = step / eps;
            check(grads.pose[i] * fd_scale, plus, minus, &format!("pose[{i}]"));
        }

        for j in 0..p.shape.len() {
            let mut plus = p.clone();
            let mut minus = p.clone();
            plus.shape[j] += eps;
            minus.shape[j] -= eps;
            check(grads.shape[j], plus, minus, &format!("shape[{j}]"));
        }

        for j in 0..p.expression.len() {
            let mut plus = p.clone();
            let mut minus = p.clone();
            plus.expression[j] += eps;
            minus.expression[j] -= eps;
            check(grads.expression[j], plus, minus, &format!("exp[{j}]"));
        }
    }

    #[test]
    fn test_translation_z_has_no_gradient() {
        let proj = LandmarkProjector::new(Arc::new(synthetic_model()), Projection::Orthographic, 224.0);
        let (_, grads) = proj.project_with_grad(&params(), weights(68).view()).unwrap();
        assert_eq!(grads.pose[5], 0.0);
    }

    #[test]
    fn test_perspective_gradient_unsupported() {
        let proj = LandmarkProjector::new(
            Arc::new(synthetic_model()),
            Projection::Perspective {
                fovy_deg: 30.0,
                near: 0.1,
                far: 1000.0,
            },
            224.0,
        );
        let err = proj.project_with_grad(&params(), weights(68).view()).unwrap_err();
        assert!(matches!(err, ProjectorError::GradientUnsupported));
        assert!(proj.project(&params()).is_ok());
    }

    #[test]
    fn test_upstream_shape_checked() {
        let proj = LandmarkProjector::new(Arc::new(synthetic_model()), Projection::Orthographic, 224.0);
        let w = Array2::<f32>::zeros((2, 10));
        assert!(matches!(
            proj.project_with_grad(&params(), w.view()),
            Err(ProjectorError::UpstreamShape { .. })
        ));
    }
}
