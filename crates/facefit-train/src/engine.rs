use crate::config::TrainConfig;
use crate::trainer::{EvalReport, TrainError, TrainOutcome, TrainProgress, Trainer};
use facefit_core::FaceModel;
use facefit_data::{load_batches, Batch, BatchLoader, Dataset, LoaderConfig};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Messages sent from the async side to the training thread.
enum EngineRequest {
    Progress { reply: oneshot::Sender<TrainProgress> },
    Stop,
}

/// Clone-safe handle to the training thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Step, epoch and running loss as of the last completed batch.
    pub async fn progress(&self) -> Result<TrainProgress, TrainError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Progress { reply: reply_tx })
            .await
            .map_err(|_| TrainError::ChannelClosed)?;
        reply_rx.await.map_err(|_| TrainError::ChannelClosed)
    }

    /// Ask training to stop after the current batch and save.
    pub async fn stop(&self) -> Result<(), TrainError> {
        self.tx
            .send(EngineRequest::Stop)
            .await
            .map_err(|_| TrainError::ChannelClosed)
    }
}

/// A running training job.
pub struct TrainJob {
    pub handle: EngineHandle,
    done: oneshot::Receiver<Result<TrainOutcome, TrainError>>,
}

impl TrainJob {
    /// Wait for the training thread to finish.
    pub async fn wait(self) -> Result<TrainOutcome, TrainError> {
        self.done.await.map_err(|_| TrainError::ChannelClosed)?
    }
}

/// Datasets, model and test batches shared by training and evaluation.
struct Prepared {
    model: Arc<FaceModel>,
    train: Dataset,
    test_batches: Vec<Batch>,
    loader: LoaderConfig,
}

fn prepare(config: &TrainConfig) -> Result<Prepared, TrainError> {
    let model = Arc::new(FaceModel::load(&config.model_path)?);

    let train = Dataset::open(&config.data_train_dir)?;
    let (train, test) = match &config.data_test_dir {
        Some(dir) => (train, Dataset::open(dir)?),
        None => train.split_train_test(config.test_fraction, config.seed),
    };
    if test.manifest.layout != train.manifest.layout {
        return Err(TrainError::LayoutMismatch {
            expected: train.manifest.layout,
            found: test.manifest.layout,
        });
    }

    let loader = LoaderConfig {
        batch_size: config.batch_size,
        image_size: train.manifest.scaling.target_size.round() as u32,
        feature_size: config.feature_size,
        seed: config.seed,
    };
    let test_batches = load_batches(&test, &loader, None)?;
    tracing::info!(
        train = train.len(),
        test = test.len(),
        test_batches = test_batches.len(),
        layout = ?train.manifest.layout,
        "datasets ready"
    );

    Ok(Prepared {
        model,
        train,
        test_batches,
        loader,
    })
}

/// Spawn training on a dedicated OS thread.
///
/// Loads the face model and datasets synchronously so configuration errors
/// surface before the thread starts.
pub fn spawn_engine(config: TrainConfig) -> Result<TrainJob, TrainError> {
    let prepared = prepare(&config)?;
    let batches_per_epoch = prepared.train.len() / config.batch_size;
    if batches_per_epoch == 0 {
        return Err(TrainError::TooFewSamples {
            samples: prepared.train.len(),
            batch_size: config.batch_size,
        });
    }

    let layout = prepared.train.manifest.layout;
    let scaling = prepared.train.manifest.scaling;
    let mut trainer = Trainer::new(config, layout, scaling, prepared.model)?;
    let mut loader = BatchLoader::spawn(prepared.train, prepared.loader)?;
    let test_batches = prepared.test_batches;

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("facefit-engine".into())
        .spawn(move || {
            tracing::info!(batches_per_epoch, "engine thread started");
            let result = trainer.run(
                batches_per_epoch,
                &test_batches,
                || loader.next_blocking(),
                |progress| {
                    let mut stop = false;
                    loop {
                        match rx.try_recv() {
                            Ok(EngineRequest::Progress { reply }) => {
                                let _ = reply.send(*progress);
                            }
                            Ok(EngineRequest::Stop) => stop = true,
                            Err(mpsc::error::TryRecvError::Empty) => break,
                            // Every handle dropped; keep training.
                            Err(mpsc::error::TryRecvError::Disconnected) => break,
                        }
                    }
                    stop
                },
            );
            match &result {
                Ok(outcome) => tracing::info!(step = outcome.step, stopped = outcome.stopped, "engine thread exiting"),
                Err(e) => tracing::error!(error = %e, "training failed"),
            }
            let _ = done_tx.send(result);
        })?;

    Ok(TrainJob {
        handle: EngineHandle { tx },
        done: done_rx,
    })
}

/// Test-set loss of the latest checkpoint.
pub fn evaluate_latest(config: TrainConfig) -> Result<EvalReport, TrainError> {
    let prepared = prepare(&config)?;
    let layout = prepared.train.manifest.layout;
    let scaling = prepared.train.manifest.scaling;
    let mut trainer = Trainer::new(config, layout, scaling, prepared.model)?;
    if trainer.step() == 0 {
        tracing::warn!("no checkpoint found, evaluating freshly initialized weights");
    }
    let report = trainer.evaluate(&prepared.test_batches)?;
    tracing::info!("step={}, test loss: {:.5}", report.step, report.loss);
    Ok(report)
}
