//! Dataset side of facefit: label files, image decoding, exported
//! datasets and batch loading.

pub mod dataset;
pub mod extract;
pub mod images;
pub mod loader;
pub mod mat;

pub use dataset::{discover_samples, export_dataset, Dataset, DatasetError, ExportSummary, Manifest, Sample, SamplePaths};
pub use extract::{ExtractError, LabelExtractor, LabelSource};
pub use images::{feature_len, features, load_image, ImageLoadError};
pub use loader::{load_batch, load_batches, Batch, BatchLoader, LoaderConfig};
pub use mat::{read_label_mat, LabelMat, MatError};
