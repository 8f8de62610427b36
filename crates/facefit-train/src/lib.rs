//! facefit-train - regress 3DMM coefficients from face images.
//!
//! A linear network is trained with Adam on exported datasets. The loss
//! combines per-block regression terms with a projected-landmark term whose
//! gradient flows through the face model into pose, shape and expression.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod loss;
pub mod metrics;
pub mod network;
pub mod optimizer;
pub mod render;
pub mod summary;
pub mod trainer;

#[cfg(test)]
mod testing;

pub use checkpoint::{CheckpointError, CheckpointManager, TrainState};
pub use config::{ConfigError, LossConfig, TermConfig, TrainConfig};
pub use engine::{evaluate_latest, spawn_engine, EngineHandle, TrainJob};
pub use loss::{FaceLoss, LossKind};
pub use network::LinearNet;
pub use optimizer::Adam;
pub use trainer::{EvalReport, TrainError, TrainOutcome, TrainProgress, Trainer};
