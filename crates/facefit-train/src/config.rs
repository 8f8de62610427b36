use crate::loss::LossKind;
use facefit_core::{Block, Projection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Loss type and weight for one term.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TermConfig {
    pub kind: LossKind,
    pub weight: f32,
}

impl TermConfig {
    const fn l2(weight: f32) -> Self {
        Self {
            kind: LossKind::L2,
            weight,
        }
    }
}

/// Per-term loss settings. Terms left out of the TOML keep their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub shape: TermConfig,
    pub pose: TermConfig,
    pub expression: TermConfig,
    pub color: TermConfig,
    pub illumination: TermConfig,
    pub texture: TermConfig,
    pub landmark: TermConfig,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            shape: TermConfig::l2(10.0),
            pose: TermConfig::l2(10.0),
            expression: TermConfig::l2(5.0),
            color: TermConfig::l2(5.0),
            illumination: TermConfig::l2(5.0),
            texture: TermConfig::l2(5.0),
            landmark: TermConfig::l2(10.0),
        }
    }
}

impl LossConfig {
    pub fn term(&self, block: Block) -> Option<TermConfig> {
        match block {
            Block::Shape => Some(self.shape),
            Block::Pose => Some(self.pose),
            Block::Expression => Some(self.expression),
            Block::Color => Some(self.color),
            Block::Illumination => Some(self.illumination),
            Block::Texture => Some(self.texture),
            Block::Landmarks => Some(self.landmark),
            Block::Roi => None,
        }
    }

    fn term_mut(&mut self, block: Block) -> Option<&mut TermConfig> {
        match block {
            Block::Shape => Some(&mut self.shape),
            Block::Pose => Some(&mut self.pose),
            Block::Expression => Some(&mut self.expression),
            Block::Color => Some(&mut self.color),
            Block::Illumination => Some(&mut self.illumination),
            Block::Texture => Some(&mut self.texture),
            Block::Landmarks => Some(&mut self.landmark),
            Block::Roi => None,
        }
    }
}

/// Training configuration, loaded from TOML and overridden by `FACEFIT_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Exported training dataset directory.
    pub data_train_dir: PathBuf,
    /// Exported test dataset. When unset, `test_fraction` of the training
    /// set is held out instead.
    pub data_test_dir: Option<PathBuf>,
    pub test_fraction: f32,
    /// Face model `.npz`.
    pub model_path: PathBuf,
    pub log_dir: PathBuf,
    pub eval_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub max_to_keep: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub beta_1: f32,
    pub epochs: usize,
    /// Optimizer iterations between train summary writes.
    pub log_freq: u64,
    /// Batches between evaluations and checkpoints.
    pub eval_every: usize,
    /// Side length of the downsampled image fed to the network.
    pub feature_size: u32,
    pub seed: u64,
    pub projection: Projection,
    pub loss: LossConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_train_dir: PathBuf::from("data/train"),
            data_test_dir: None,
            test_fraction: 0.1,
            model_path: PathBuf::from("BFM.npz"),
            log_dir: PathBuf::from("logs"),
            eval_dir: PathBuf::from("eval"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            max_to_keep: 5,
            batch_size: 32,
            learning_rate: 1e-4,
            beta_1: 0.9,
            epochs: 10,
            log_freq: 10,
            eval_every: 100,
            feature_size: 16,
            seed: 0,
            projection: Projection::Orthographic,
            loss: LossConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Load `path` (defaults when `None`), apply env overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Override fields from `FACEFIT_*` environment variables. Unset or
    /// unparsable variables leave the field unchanged.
    pub fn apply_env(&mut self) {
        self.data_train_dir = env_path("FACEFIT_DATA_TRAIN_DIR", &self.data_train_dir);
        if let Ok(dir) = std::env::var("FACEFIT_DATA_TEST_DIR") {
            self.data_test_dir = Some(PathBuf::from(dir));
        }
        self.test_fraction = env_f32("FACEFIT_TEST_FRACTION", self.test_fraction);
        self.model_path = env_path("FACEFIT_MODEL_PATH", &self.model_path);
        self.log_dir = env_path("FACEFIT_LOG_DIR", &self.log_dir);
        self.eval_dir = env_path("FACEFIT_EVAL_DIR", &self.eval_dir);
        self.checkpoint_dir = env_path("FACEFIT_CHECKPOINT_DIR", &self.checkpoint_dir);
        self.max_to_keep = env_usize("FACEFIT_MAX_TO_KEEP", self.max_to_keep);
        self.batch_size = env_usize("FACEFIT_BATCH_SIZE", self.batch_size);
        self.learning_rate = env_f32("FACEFIT_LEARNING_RATE", self.learning_rate);
        self.beta_1 = env_f32("FACEFIT_BETA_1", self.beta_1);
        self.epochs = env_usize("FACEFIT_EPOCHS", self.epochs);
        self.log_freq = env_u64("FACEFIT_LOG_FREQ", self.log_freq);
        self.eval_every = env_usize("FACEFIT_EVAL_EVERY", self.eval_every);
        self.feature_size = env_u32("FACEFIT_FEATURE_SIZE", self.feature_size);
        self.seed = env_u64("FACEFIT_SEED", self.seed);

        for block in [
            Block::Shape,
            Block::Pose,
            Block::Expression,
            Block::Color,
            Block::Illumination,
            Block::Texture,
            Block::Landmarks,
        ] {
            let key = block.name().to_ascii_uppercase();
            if let Some(term) = self.loss.term_mut(block) {
                term.weight = env_f32(&format!("FACEFIT_LOSS_WEIGHT_{key}"), term.weight);
                if let Ok(kind) = std::env::var(format!("FACEFIT_LOSS_TYPE_{key}")) {
                    match kind.parse() {
                        Ok(k) => term.kind = k,
                        Err(e) => tracing::warn!(term = block.name(), error = %e, "ignoring loss type override"),
                    }
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.feature_size == 0 {
            return Err(ConfigError::Invalid("feature_size must be positive".into()));
        }
        if self.log_freq == 0 || self.eval_every == 0 {
            return Err(ConfigError::Invalid("log_freq and eval_every must be positive".into()));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(ConfigError::Invalid("learning_rate must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.beta_1) {
            return Err(ConfigError::Invalid("beta_1 must be in [0, 1)".into()));
        }
        if !(0.0..1.0).contains(&self.test_fraction) {
            return Err(ConfigError::Invalid("test_fraction must be in [0, 1)".into()));
        }
        // The landmark gradient is only derived for orthographic projection.
        if self.projection != Projection::Orthographic {
            return Err(ConfigError::Invalid("training requires orthographic projection".into()));
        }
        Ok(())
    }
}

fn env_path(key: &str, default: &Path) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| default.to_path_buf())
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
