//! Weighted multi-term regression loss with a projected-landmark term.

use crate::config::LossConfig;
use facefit_core::layout::{self, Block, Layout, LayoutError, PREDICTED_BLOCKS};
use facefit_core::projector::{self, LandmarkProjector, ProjectorError};
use facefit_core::Denormalizer;
use ndarray::{s, Array2, Array3, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LossError {
    #[error("projector: {0}")]
    Projector(#[from] ProjectorError),
    #[error("layout: {0}")]
    Layout(#[from] LayoutError),
    #[error("predictions have {actual} columns, expected {expected}")]
    PredictionWidth { expected: usize, actual: usize },
    #[error("labels have {actual} columns, expected {expected}")]
    LabelWidth { expected: usize, actual: usize },
    #[error("batch size mismatch: {predictions} predictions, {labels} labels")]
    BatchMismatch { predictions: usize, labels: usize },
    #[error("gradient was not computed")]
    MissingGradient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Mean squared error.
    L2,
    /// Mean absolute error.
    L1,
}

impl FromStr for LossKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l2" => Ok(LossKind::L2),
            "l1" => Ok(LossKind::L1),
            other => Err(format!("unknown loss type `{other}`")),
        }
    }
}

impl LossKind {
    /// Mean error over all elements and its gradient w.r.t. `pred`.
    pub fn value_and_grad(self, pred: ArrayView2<'_, f32>, target: ArrayView2<'_, f32>) -> (f32, Array2<f32>) {
        let n = pred.len().max(1) as f32;
        let diff = &pred - &target;
        match self {
            LossKind::L2 => {
                let value = diff.iter().map(|d| d * d).sum::<f32>() / n;
                (value, diff.mapv(|d| 2.0 * d / n))
            }
            LossKind::L1 => {
                let value = diff.iter().map(|d| d.abs()).sum::<f32>() / n;
                (value, diff.mapv(|d| sign(d) / n))
            }
        }
    }
}

fn sign(d: f32) -> f32 {
    if d > 0.0 {
        1.0
    } else if d < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Losses for one batch.
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Weighted sum of all terms.
    pub total: f32,
    /// Unweighted value per term, in evaluation order.
    pub terms: Vec<(Block, f32)>,
    /// dTotal/dPredictions, present when requested.
    pub grad: Option<Array2<f32>>,
    /// Projected landmarks, (batch, 2, landmarks).
    pub landmarks: Array3<f32>,
}

impl LossOutput {
    pub fn require_grad(&self) -> Result<&Array2<f32>, LossError> {
        self.grad.as_ref().ok_or(LossError::MissingGradient)
    }
}

/// Compares network outputs (predicted block order) against stored label
/// rows (layout order).
#[derive(Debug, Clone)]
pub struct FaceLoss {
    layout: Layout,
    config: LossConfig,
    projector: LandmarkProjector,
    denormalizer: Denormalizer,
}

impl FaceLoss {
    pub fn new(layout: Layout, config: LossConfig, projector: LandmarkProjector, denormalizer: Denormalizer) -> Self {
        Self {
            layout,
            config,
            projector,
            denormalizer,
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn projector(&self) -> &LandmarkProjector {
        &self.projector
    }

    pub fn compute(
        &self,
        predictions: ArrayView2<'_, f32>,
        labels: ArrayView2<'_, f32>,
        with_grad: bool,
    ) -> Result<LossOutput, LossError> {
        self.check_shapes(predictions, labels)?;
        let batch = predictions.nrows();

        let mut grad = with_grad.then(|| Array2::<f32>::zeros(predictions.raw_dim()));
        let mut terms = Vec::with_capacity(PREDICTED_BLOCKS.len() + 1);
        let mut total = 0.0;

        for &block in &PREDICTED_BLOCKS {
            let (Some(pred_range), Some(label_range), Some(term)) = (
                self.layout.predicted_range(block),
                self.layout.range(block),
                self.config.term(block),
            ) else {
                continue;
            };
            let (value, g) = term
                .kind
                .value_and_grad(predictions.slice(s![.., pred_range.clone()]), labels.slice(s![.., label_range]));
            total += term.weight * value;
            terms.push((block, value));
            if let Some(grad) = grad.as_mut() {
                grad.slice_mut(s![.., pred_range]).scaled_add(term.weight, &g);
            }
        }

        // Landmark term: project predicted pose/shape/expression and compare
        // with the labelled landmark block.
        let landmarks = self
            .projector
            .project_predictions(predictions, self.layout, &self.denormalizer)?;
        let n = self.projector.num_landmarks();
        let mut target = Array3::<f32>::zeros((batch, 2, n));
        let label_range = self
            .layout
            .range(Block::Landmarks)
            .ok_or(LayoutError::MissingBlock {
                layout: self.layout,
                block: Block::Landmarks,
            })?;
        for (i, row) in labels.outer_iter().enumerate() {
            let block = row.slice(s![label_range.clone()]).to_vec();
            target.slice_mut(s![i, .., ..]).assign(&layout::landmarks_2xn(&block)?);
        }

        let term = self.config.landmark;
        let flat = |a: &Array3<f32>| -> Result<Array2<f32>, LossError> {
            a.to_shape((batch, 2 * n))
                .map(|v| v.to_owned())
                .map_err(|_| LossError::PredictionWidth {
                    expected: 2 * n,
                    actual: a.len() / batch.max(1),
                })
        };
        let (value, g) = term.kind.value_and_grad(flat(&landmarks)?.view(), flat(&target)?.view());
        total += term.weight * value;
        terms.push((Block::Landmarks, value));

        if let Some(grad) = grad.as_mut() {
            self.landmark_grad(predictions, g * term.weight, n, grad)?;
        }

        Ok(LossOutput {
            total,
            terms,
            grad,
            landmarks,
        })
    }

    /// Route dLoss/dLandmarks (batch, 2n) into the pose, shape and
    /// expression columns of `grad`.
    fn landmark_grad(
        &self,
        predictions: ArrayView2<'_, f32>,
        upstream: Array2<f32>,
        n: usize,
        grad: &mut Array2<f32>,
    ) -> Result<(), LossError> {
        let range = |b: Block| {
            self.layout.predicted_range(b).ok_or(ProjectorError::MissingBlock {
                layout: self.layout,
                block: b,
            })
        };
        let (pose_r, shape_r, exp_r) = (range(Block::Pose)?, range(Block::Shape)?, range(Block::Expression)?);

        for (i, row) in predictions.outer_iter().enumerate() {
            let params = projector::physical_from_prediction(row, self.layout, &self.denormalizer)?;
            let up = upstream
                .row(i)
                .into_shape_with_order((2, n))
                .map_err(|_| LossError::PredictionWidth {
                    expected: 2 * n,
                    actual: upstream.ncols(),
                })?;
            let (_, pg) = self.projector.project_with_grad(&params, up)?;

            let pose = self.denormalizer.pull_back_pose(pg.pose);
            let mut shape = pg.shape;
            self.denormalizer.pull_back_shape(&mut shape);

            let mut out = grad.row_mut(i);
            add_into(out.slice_mut(s![pose_r.clone()]), &pose);
            add_into(out.slice_mut(s![shape_r.start..shape_r.start + shape.len()]), &shape);
            add_into(
                out.slice_mut(s![exp_r.start..exp_r.start + pg.expression.len()]),
                &pg.expression,
            );
        }
        Ok(())
    }

    fn check_shapes(&self, predictions: ArrayView2<'_, f32>, labels: ArrayView2<'_, f32>) -> Result<(), LossError> {
        if predictions.ncols() != self.layout.predicted_len() {
            return Err(LossError::PredictionWidth {
                expected: self.layout.predicted_len(),
                actual: predictions.ncols(),
            });
        }
        if labels.ncols() != self.layout.len() {
            return Err(LossError::LabelWidth {
                expected: self.layout.len(),
                actual: labels.ncols(),
            });
        }
        if predictions.nrows() != labels.nrows() {
            return Err(LossError::BatchMismatch {
                predictions: predictions.nrows(),
                labels: labels.nrows(),
            });
        }
        Ok(())
    }
}

fn add_into(mut dst: ndarray::ArrayViewMut1<'_, f32>, src: &[f32]) {
    Zip::from(&mut dst).and(src).for_each(|d, &s| *d += s);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::synthetic_model;
    use facefit_core::{FrameScaling, Projection};
    use ndarray::{array, Array2};

    fn loss_fn(layout: Layout, config: LossConfig) -> FaceLoss {
        let model = synthetic_model();
        let scaling = FrameScaling::new(450.0, 224.0);
        FaceLoss::new(
            layout,
            config,
            LandmarkProjector::new(model.clone(), Projection::Orthographic, scaling.target_size),
            Denormalizer::new(layout, scaling, &model),
        )
    }

    fn sample_rows(layout: Layout, batch: usize) -> (Array2<f32>, Array2<f32>) {
        let preds = Array2::from_shape_fn((batch, layout.predicted_len()), |(i, j)| {
            ((i * 7 + j * 13) % 11) as f32 * 0.01 - 0.05
        });
        let mut labels = Array2::from_shape_fn((batch, layout.len()), |(i, j)| ((i + j) % 5) as f32 * 0.1);
        if let Some(r) = layout.range(Block::Landmarks) {
            for i in 0..batch {
                for (k, j) in r.clone().enumerate() {
                    labels[[i, j]] = 80.0 + (k % 68) as f32;
                }
            }
        }
        if let Some(r) = layout.range(Block::Pose) {
            for i in 0..batch {
                // Plausible stored pose: translation near the center, small scale.
                labels[[i, r.start + 3]] = 0.5;
                labels[[i, r.start + 4]] = 0.5;
                labels[[i, r.start + 6]] = 1.0;
            }
        }
        (preds, labels)
    }

    #[test]
    fn test_value_and_grad_kinds() {
        let p = array![[1.0, 2.0], [3.0, 4.0]];
        let t = array![[0.0, 2.0], [5.0, 4.0]];
        let (v2, g2) = LossKind::L2.value_and_grad(p.view(), t.view());
        assert!((v2 - 1.25).abs() < 1e-6);
        assert_eq!(g2, array![[0.5, 0.0], [-1.0, 0.0]]);
        let (v1, g1) = LossKind::L1.value_and_grad(p.view(), t.view());
        assert!((v1 - 0.75).abs() < 1e-6);
        assert_eq!(g1, array![[0.25, 0.0], [-0.25, 0.0]]);
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("L1".parse::<LossKind>(), Ok(LossKind::L1));
        assert!("huber".parse::<LossKind>().is_err());
    }

    #[test]
    fn test_terms_and_total() {
        let config = LossConfig::default();
        let loss = loss_fn(Layout::Compact430, config);
        let (p, l) = sample_rows(Layout::Compact430, 3);
        let out = loss.compute(p.view(), l.view(), false).unwrap();
        assert_eq!(out.terms.len(), 7);
        assert!(out.grad.is_none());
        assert!(matches!(out.require_grad(), Err(LossError::MissingGradient)));
        assert_eq!(out.landmarks.dim(), (3, 2, 68));
        let weighted: f32 = out
            .terms
            .iter()
            .map(|(b, v)| config.term(*b).unwrap().weight * v)
            .sum();
        assert!((weighted - out.total).abs() <= 1e-3 * out.total.abs().max(1.0));
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let loss = loss_fn(Layout::Compact430, LossConfig::default());
        let (p, mut l) = sample_rows(Layout::Compact430, 2);

        // Put the labelled landmarks a pixel or two off the projection so the
        // total stays small enough for f32 central differences.
        let projected = loss.compute(p.view(), l.view(), false).unwrap().landmarks;
        let lm = Layout::Compact430.range(Block::Landmarks).unwrap();
        for i in 0..2 {
            for axis in 0..2 {
                for k in 0..68 {
                    l[[i, lm.start + axis * 68 + k]] = projected[[i, axis, k]] + 1.0 + (k % 3) as f32 * 0.5;
                }
            }
        }

        let out = loss.compute(p.view(), l.view(), true).unwrap();
        let grad = out.require_grad().unwrap().clone();

        let pose = Layout::Compact430.predicted_range(Block::Pose).unwrap();
        let shape = Layout::Compact430.predicted_range(Block::Shape).unwrap();
        let exp = Layout::Compact430.predicted_range(Block::Expression).unwrap();
        let color = Layout::Compact430.predicted_range(Block::Color).unwrap();
        // Angles, translation, scale, a shape and an expression coefficient
        // and a plain regression column.
        let cols = [
            pose.start,
            pose.start + 1,
            pose.start + 3,
            pose.start + 6,
            shape.start + 2,
            exp.start + 1,
            color.start,
        ];

        for &c in &cols {
            let eps = 1e-3;
            let mut plus = p.clone();
            plus[[1, c]] += eps;
            let mut minus = p.clone();
            minus[[1, c]] -= eps;
            let fp = loss.compute(plus.view(), l.view(), false).unwrap().total as f64;
            let fm = loss.compute(minus.view(), l.view(), false).unwrap().total as f64;
            let fd = (fp - fm) / (2.0 * eps as f64);
            let an = grad[[1, c]] as f64;
            assert!(
                (fd - an).abs() <= 2e-2 * an.abs().max(fd.abs()).max(1.0),
                "column {c}: analytic {an} vs numeric {fd}"
            );
        }
    }

    #[test]
    fn test_shape_errors() {
        let loss = loss_fn(Layout::Full587, LossConfig::default());
        let p = Array2::<f32>::zeros((2, 10));
        let l = Array2::<f32>::zeros((2, 587));
        assert!(matches!(
            loss.compute(p.view(), l.view(), false),
            Err(LossError::PredictionWidth { .. })
        ));
        let (p, _) = sample_rows(Layout::Full587, 2);
        let l = Array2::<f32>::zeros((3, 587));
        assert!(matches!(
            loss.compute(p.view(), l.view(), false),
            Err(LossError::BatchMismatch { .. })
        ));
    }

    #[test]
    fn test_full_layout_has_no_normalized_factors() {
        let loss = loss_fn(Layout::Full587, LossConfig::default());
        let (p, l) = sample_rows(Layout::Full587, 2);
        let out = loss.compute(p.view(), l.view(), true).unwrap();
        assert_eq!(out.grad.unwrap().ncols(), Layout::Full587.predicted_len());
        assert!(out.total.is_finite());
    }
}
