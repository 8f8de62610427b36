use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use facefit_core::layout;
use facefit_core::{Block, Denormalizer, FaceModel, FrameScaling, LandmarkProjector, Layout, Projection};
use facefit_data::{discover_samples, export_dataset, read_label_mat, LabelExtractor, LabelSource};
use facefit_train::{evaluate_latest, spawn_engine, TrainConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facefit", about = "3DMM coefficient regression: dataset export, inspection and training")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LayoutArg {
    /// 430 values, eigen-normalized (300W-LP / AFLW2000)
    Compact,
    /// 587 raw values
    Full,
}

impl From<LayoutArg> for Layout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::Compact => Layout::Compact430,
            LayoutArg::Full => Layout::Full587,
        }
    }
}

/// Options shared by every command that reads `.mat` labels.
#[derive(Args)]
struct LabelOpts {
    /// Face model archive (.npz)
    #[arg(long)]
    model: PathBuf,
    /// Labels come from AFLW2000-3D (landmarks in pt3d_68)
    #[arg(long)]
    aflw2000: bool,
    /// Side length of the original images
    #[arg(long, default_value_t = 450.0)]
    source_size: f32,
    /// Side length the network sees
    #[arg(long, default_value_t = 224.0)]
    target_size: f32,
    #[arg(long, value_enum, default_value_t = LayoutArg::Compact)]
    layout: LayoutArg,
}

impl LabelOpts {
    fn extractor(&self) -> Result<LabelExtractor> {
        let model = FaceModel::load(&self.model)
            .with_context(|| format!("loading face model {}", self.model.display()))?;
        let source = if self.aflw2000 {
            LabelSource::Aflw2000
        } else {
            LabelSource::Lp300W
        };
        Ok(LabelExtractor::new(
            self.layout.into(),
            source,
            FrameScaling::new(self.source_size, self.target_size),
            Arc::new(model),
        ))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Extract labels for every image under a dataset root
    Export {
        /// Dataset root; images are matched as <root>/*/*.jpg
        #[arg(long)]
        root: PathBuf,
        /// Output dataset directory
        #[arg(long)]
        out: PathBuf,
        #[command(flatten)]
        labels: LabelOpts,
        /// Shuffle seed
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Print the blocks of one label file
    Split {
        #[arg(long)]
        label: PathBuf,
        #[command(flatten)]
        labels: LabelOpts,
    },
    /// Project a label's pose and shape and compare with its landmarks
    Project {
        #[arg(long)]
        label: PathBuf,
        #[command(flatten)]
        labels: LabelOpts,
    },
    /// Train a regressor
    Train {
        /// TOML config; FACEFIT_* environment variables override it
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Test-set loss of the latest checkpoint
    Eval {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Export {
            root,
            out,
            labels,
            seed,
        } => {
            let extractor = labels.extractor()?;
            let samples = discover_samples(&root, 2, seed)
                .with_context(|| format!("scanning {}", root.display()))?;
            let summary = export_dataset(&samples, &extractor, &out)?;
            println!(
                "Exported {} samples to {} ({} skipped)",
                summary.written,
                out.display(),
                summary.skipped
            );
        }
        Commands::Split { label, labels } => {
            let extractor = labels.extractor()?;
            let mat = read_label_mat(&label)?;
            let values = extractor.extract(&mat)?;
            let parts = layout::split(extractor.layout(), &values)?;
            for (block, slice) in parts.iter() {
                let head: Vec<String> = slice.iter().take(6).map(|v| format!("{v:.4}")).collect();
                let more = if slice.len() > 6 { ", ..." } else { "" };
                println!("{:<9} {:>4}  [{}{more}]", block.name(), slice.len(), head.join(", "));
            }
        }
        Commands::Project { label, labels } => {
            let extractor = labels.extractor()?;
            let model = extractor.model().clone();
            let label_layout = extractor.layout();
            let scaling = extractor.scaling();

            let values = extractor.extract(&read_label_mat(&label)?)?;
            let parts = layout::split(label_layout, &values)?;
            let denormalizer = Denormalizer::new(label_layout, scaling, &model);
            let params = denormalizer.physical(
                parts.require(Block::Pose)?,
                parts.require(Block::Shape)?,
                parts.require(Block::Expression)?,
            )?;

            let projector = LandmarkProjector::new(model, Projection::Orthographic, scaling.target_size);
            let projected = projector.project(&params)?;
            let labelled = layout::landmarks_2xn(parts.require(Block::Landmarks)?)?;

            let mut total = 0.0f32;
            println!("{:>3}  {:>16}  {:>16}  {:>7}", "idx", "projected", "labelled", "error");
            for k in 0..projected.ncols() {
                let (px, py) = (projected[[0, k]], projected[[1, k]]);
                let (lx, ly) = (labelled[[0, k]], labelled[[1, k]]);
                let err = ((px - lx).powi(2) + (py - ly).powi(2)).sqrt();
                total += err;
                println!("{k:>3}  ({px:>6.1}, {py:>6.1})  ({lx:>6.1}, {ly:>6.1})  {err:>7.2}");
            }
            println!("mean error: {:.3} px", total / projected.ncols().max(1) as f32);
        }
        Commands::Train { config } => {
            let config = TrainConfig::load(config.as_deref())?;
            let job = spawn_engine(config)?;
            let handle = job.handle.clone();
            let wait = job.wait();
            tokio::pin!(wait);

            let outcome = tokio::select! {
                outcome = &mut wait => outcome?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received, stopping after the current batch");
                    if let Err(e) = handle.stop().await {
                        tracing::debug!(error = %e, "engine already finished");
                    }
                    wait.await?
                }
            };
            println!(
                "Training {} at step {} after {} epochs",
                if outcome.stopped { "stopped" } else { "finished" },
                outcome.step,
                outcome.epochs_completed
            );
            if let Some(path) = outcome.checkpoint {
                println!("Checkpoint: {}", path.display());
            }
        }
        Commands::Eval { config } => {
            let config = TrainConfig::load(config.as_deref())?;
            let report = tokio::task::spawn_blocking(move || evaluate_latest(config)).await??;
            println!("step={}, test loss: {:.5}", report.step, report.loss);
            for (tag, value) in &report.terms {
                println!("  {tag:<14} {value:.5}");
            }
        }
    }

    Ok(())
}
