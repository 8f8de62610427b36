//! Training loop: forward, loss, backward, Adam; periodic evaluation,
//! summaries and checkpoints.

use crate::checkpoint::{CheckpointError, CheckpointManager, TrainState};
use crate::config::TrainConfig;
use crate::loss::{FaceLoss, LossError, LossOutput};
use crate::metrics::Metrics;
use crate::network::{LinearNet, NetworkError};
use crate::optimizer::Adam;
use crate::render;
use crate::summary::SummaryWriter;
use chrono::Utc;
use facefit_core::{Block, Denormalizer, FaceModel, FrameScaling, LandmarkProjector, Layout};
use facefit_data::{feature_len, Batch, ImageLoadError};
use ndarray::s;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Batches between progress log lines.
const PROGRESS_EVERY: usize = 100;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("config: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("dataset: {0}")]
    Dataset(#[from] facefit_data::DatasetError),
    #[error("face model: {0}")]
    Model(#[from] facefit_core::ModelError),
    #[error("image: {0}")]
    Image(#[from] ImageLoadError),
    #[error("loss: {0}")]
    Loss(#[from] LossError),
    #[error("network: {0}")]
    Network(#[from] NetworkError),
    #[error("checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("render: {0}")]
    Render(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint was trained for {found:?} labels, dataset is {expected:?}")]
    LayoutMismatch { expected: Layout, found: Layout },
    #[error("checkpoint expects feature size {found}, config has {expected}")]
    FeatureMismatch { expected: u32, found: u32 },
    #[error("training set has {samples} samples, fewer than one batch of {batch_size}")]
    TooFewSamples { samples: usize, batch_size: usize },
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Mean test losses over a set of batches.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    pub step: u64,
    pub loss: f32,
    pub terms: Vec<(String, f32)>,
    pub batches: usize,
}

/// Where a finished run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    pub step: u64,
    pub epochs_completed: usize,
    pub stopped: bool,
    pub checkpoint: Option<PathBuf>,
}

pub struct Trainer {
    config: TrainConfig,
    scaling: FrameScaling,
    net: LinearNet,
    optimizer: Adam,
    loss: FaceLoss,
    metrics: Metrics,
    test_metrics: Metrics,
    train_summary: SummaryWriter,
    test_summary: SummaryWriter,
    checkpoints: CheckpointManager,
    step: u64,
    epoch: usize,
}

fn term_tag(block: Block) -> String {
    format!("{}_loss", block.name())
}

impl Trainer {
    /// Build a trainer for `layout`, resuming from the latest checkpoint in
    /// `config.checkpoint_dir` when one exists.
    pub fn new(config: TrainConfig, layout: Layout, scaling: FrameScaling, model: Arc<FaceModel>) -> Result<Self, TrainError> {
        let projector = LandmarkProjector::new(model.clone(), config.projection, scaling.target_size);
        let denormalizer = Denormalizer::new(layout, scaling, &model);
        let loss = FaceLoss::new(layout, config.loss, projector, denormalizer);

        let checkpoints = CheckpointManager::open(&config.checkpoint_dir, config.max_to_keep)?;
        let (net, optimizer, step, epoch) = match checkpoints.restore_latest()? {
            Some(state) => {
                if state.layout != layout {
                    return Err(TrainError::LayoutMismatch {
                        expected: layout,
                        found: state.layout,
                    });
                }
                if state.feature_size != config.feature_size {
                    return Err(TrainError::FeatureMismatch {
                        expected: config.feature_size,
                        found: state.feature_size,
                    });
                }
                tracing::info!(step = state.step, epoch = state.epoch, "resuming from checkpoint");
                (LinearNet::from_state(state.net)?, state.optimizer, state.step, state.epoch)
            }
            None => {
                let net = LinearNet::new(feature_len(config.feature_size), layout.predicted_len(), config.seed);
                let optimizer = Adam::new(config.learning_rate, config.beta_1);
                (net, optimizer, 0, 0)
            }
        };

        let train_summary = SummaryWriter::create(config.log_dir.join("train"))?;
        let test_summary = SummaryWriter::create(config.log_dir.join("test"))?;

        Ok(Self {
            config,
            scaling,
            net,
            optimizer,
            loss,
            metrics: Metrics::default(),
            test_metrics: Metrics::default(),
            train_summary,
            test_summary,
            checkpoints,
            step,
            epoch,
        })
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn net(&self) -> &LinearNet {
        &self.net
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// One optimizer step on `batch`; returns the total loss.
    pub fn train_step(&mut self, batch: &Batch) -> Result<f32, TrainError> {
        self.step += 1;

        let predictions = self.net.forward(batch.features.view())?;
        let out = self.loss.compute(predictions.view(), batch.labels.view(), true)?;
        let dy = out.require_grad()?;
        let grads = self.net.backward(batch.features.view(), dy.view())?;
        self.optimizer.apply(&mut self.net, &grads);

        record(&mut self.metrics, &out);
        if self.optimizer.iterations() % self.config.log_freq == 0 {
            for (tag, value) in self.metrics.means() {
                self.train_summary.scalar(self.optimizer.iterations(), &tag, value)?;
            }
            self.train_summary.flush()?;
            self.metrics.reset();
        }
        Ok(out.total)
    }

    /// Loss over `batches` without updating parameters.
    pub fn evaluate(&mut self, batches: &[Batch]) -> Result<EvalReport, TrainError> {
        self.test_metrics.reset();
        let mut total = 0.0f64;
        for batch in batches {
            let out = self.forward_loss(batch)?;
            total += out.total as f64;
            record(&mut self.test_metrics, &out);
        }
        let loss = if batches.is_empty() {
            0.0
        } else {
            (total / batches.len() as f64) as f32
        };
        Ok(EvalReport {
            step: self.step,
            loss,
            terms: self.test_metrics.means(),
            batches: batches.len(),
        })
    }

    fn forward_loss(&self, batch: &Batch) -> Result<LossOutput, TrainError> {
        let predictions = self.net.forward(batch.features.view())?;
        Ok(self.loss.compute(predictions.view(), batch.labels.view(), false)?)
    }

    /// Evaluate, write test summaries, render overlays for the first test
    /// batch and save a checkpoint.
    pub fn eval_and_checkpoint(&mut self, test_batches: &[Batch]) -> Result<EvalReport, TrainError> {
        let report = self.evaluate(test_batches)?;
        for (tag, value) in &report.terms {
            self.test_summary.scalar(self.step, tag, *value)?;
        }
        self.test_summary.flush()?;

        if let Some(first) = test_batches.first() {
            self.render_batch(first)?;
        }
        tracing::info!("step={}, test loss: {:.5}", self.step, report.loss);
        self.save()?;
        Ok(report)
    }

    fn render_batch(&self, batch: &Batch) -> Result<(), TrainError> {
        let out = self.forward_loss(batch)?;
        let layout = self.loss.layout();
        let n = self.loss.projector().num_landmarks();
        let labelled = layout.range(Block::Landmarks).map(|r| {
            let block = batch.labels.slice(s![.., r]).to_owned();
            let rows = block.nrows();
            ndarray::Array3::from_shape_fn((rows, 2, n), |(i, axis, k)| block[[i, axis * n + k]])
        });
        render::save_overlays(
            &self.config.eval_dir,
            self.step,
            &batch.images,
            out.landmarks.view(),
            labelled.as_ref().map(|l| l.view()),
        )?;
        Ok(())
    }

    pub fn save(&mut self) -> Result<PathBuf, TrainError> {
        let state = TrainState {
            step: self.step,
            epoch: self.epoch,
            layout: self.loss.layout(),
            scaling: self.scaling,
            feature_size: self.config.feature_size,
            net: self.net.state(),
            optimizer: self.optimizer.clone(),
            saved_at: Utc::now(),
        };
        Ok(self.checkpoints.save(&state)?)
    }

    /// Run the configured epochs. `next_batch` yields training batches and
    /// `should_stop` is polled between batches; either ending the run saves
    /// a final checkpoint.
    pub fn run(
        &mut self,
        batches_per_epoch: usize,
        test_batches: &[Batch],
        mut next_batch: impl FnMut() -> Option<Batch>,
        mut should_stop: impl FnMut(&TrainProgress) -> bool,
    ) -> Result<TrainOutcome, TrainError> {
        let mut stopped = false;
        'epochs: while self.epoch < self.config.epochs {
            for batch_id in 0..batches_per_epoch {
                if should_stop(&self.progress()) {
                    stopped = true;
                    break 'epochs;
                }
                let Some(batch) = next_batch() else {
                    tracing::warn!("batch source closed early");
                    stopped = true;
                    break 'epochs;
                };
                let loss = self.train_step(&batch)?;

                if batch_id % PROGRESS_EVERY == 0 {
                    tracing::info!(
                        epoch = self.epoch,
                        batch = batch_id,
                        of = batches_per_epoch,
                        step = self.step,
                        loss,
                        "training"
                    );
                }
                if batch_id > 0 && batch_id % self.config.eval_every == 0 {
                    self.eval_and_checkpoint(test_batches)?;
                }
            }
            self.epoch += 1;
            tracing::info!(epoch = self.epoch, step = self.step, "epoch finished");
        }

        let checkpoint = Some(self.save()?);
        Ok(TrainOutcome {
            step: self.step,
            epochs_completed: self.epoch,
            stopped,
            checkpoint,
        })
    }

    pub fn progress(&self) -> TrainProgress {
        TrainProgress {
            step: self.step,
            epoch: self.epoch,
            loss: self.metrics.get("loss"),
        }
    }
}

/// Snapshot reported to engine callers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainProgress {
    pub step: u64,
    pub epoch: usize,
    /// Running mean of the training loss since the last summary write.
    pub loss: Option<f32>,
}

fn record(metrics: &mut Metrics, out: &LossOutput) {
    metrics.record("loss", out.total);
    for (block, value) in &out.terms {
        metrics.record(&term_tag(*block), *value);
    }
}
