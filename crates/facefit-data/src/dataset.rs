//! Dataset discovery, export and loading.
//!
//! An exported dataset is a directory holding `manifest.json` (layout,
//! frame scaling, counts) and `samples.jsonl` (one image path and label
//! vector per line).

use crate::extract::{ExtractError, LabelExtractor, LabelSource};
use crate::mat;
use chrono::{DateTime, Utc};
use facefit_core::{FrameScaling, Layout};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SAMPLES_FILE: &str = "samples.jsonl";

/// Progress is logged every this many samples.
const LOG_EVERY: usize = 100;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("dataset directory not found: {0}")]
    NotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("walk: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("sample {line}: expected {expected} labels, got {actual}")]
    LabelLength {
        line: usize,
        expected: usize,
        actual: usize,
    },
    #[error("no samples found under {0}")]
    Empty(String),
}

/// An image with its label file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePaths {
    pub image: PathBuf,
    pub label: PathBuf,
}

/// One exported training sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub image: PathBuf,
    pub labels: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub layout: Layout,
    pub scaling: FrameScaling,
    pub source: LabelSource,
    pub samples: usize,
    pub skipped: usize,
    pub created_at: DateTime<Utc>,
}

/// Find `*.jpg` files exactly `depth` levels below `root` that have a
/// sibling `.mat` label, shuffled with `seed`.
pub fn discover_samples(root: &Path, depth: usize, seed: u64) -> Result<Vec<SamplePaths>, DatasetError> {
    if !root.is_dir() {
        return Err(DatasetError::NotFound(root.display().to_string()));
    }

    let mut found = Vec::new();
    let mut unlabeled = 0usize;
    for entry in WalkDir::new(root).min_depth(depth).max_depth(depth).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let is_jpeg = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"));
        if !entry.file_type().is_file() || !is_jpeg {
            continue;
        }
        let label = path.with_extension("mat");
        if label.exists() {
            found.push(SamplePaths {
                image: path.to_path_buf(),
                label,
            });
        } else {
            unlabeled += 1;
        }
    }

    found.shuffle(&mut StdRng::seed_from_u64(seed));
    tracing::info!(
        root = %root.display(),
        images = found.len(),
        unlabeled,
        "discovered labeled images"
    );
    Ok(found)
}

/// Counts from an export run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub written: usize,
    pub skipped: usize,
}

/// Extract labels for every sample and write the dataset directory.
///
/// Samples whose label file cannot be read or normalized are skipped
/// with a warning.
pub fn export_dataset(
    samples: &[SamplePaths],
    extractor: &LabelExtractor,
    out_dir: &Path,
) -> Result<ExportSummary, DatasetError> {
    fs::create_dir_all(out_dir)?;
    let mut writer = BufWriter::new(File::create(out_dir.join(SAMPLES_FILE))?);

    let mut summary = ExportSummary {
        written: 0,
        skipped: 0,
    };
    for (i, paths) in samples.iter().enumerate() {
        if i % LOG_EVERY == 0 {
            tracing::info!(index = i, total = samples.len(), "exporting labels");
        }
        match extract_one(extractor, paths) {
            Ok(labels) => {
                let sample = Sample {
                    image: paths.image.clone(),
                    labels,
                };
                serde_json::to_writer(&mut writer, &sample)?;
                writer.write_all(b"\n")?;
                summary.written += 1;
            }
            Err(e) => {
                tracing::warn!(label = %paths.label.display(), error = %e, "skipping sample");
                summary.skipped += 1;
            }
        }
    }
    writer.flush()?;

    let manifest = Manifest {
        layout: extractor.layout(),
        scaling: extractor.scaling(),
        source: extractor.source(),
        samples: summary.written,
        skipped: summary.skipped,
        created_at: Utc::now(),
    };
    fs::write(out_dir.join(MANIFEST_FILE), serde_json::to_string_pretty(&manifest)?)?;

    tracing::info!(
        out = %out_dir.display(),
        written = summary.written,
        skipped = summary.skipped,
        "dataset exported"
    );
    Ok(summary)
}

fn extract_one(extractor: &LabelExtractor, paths: &SamplePaths) -> Result<Vec<f32>, ExtractError> {
    let mat = mat::read_label_mat(&paths.label)?;
    extractor.extract(&mat)
}

/// An exported dataset loaded into memory.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub manifest: Manifest,
    pub samples: Vec<Sample>,
}

impl Dataset {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(DatasetError::NotFound(dir.display().to_string()));
        }

        let manifest: Manifest = serde_json::from_str(&fs::read_to_string(dir.join(MANIFEST_FILE))?)?;
        let expected = manifest.layout.len();

        let reader = BufReader::new(File::open(dir.join(SAMPLES_FILE))?);
        let mut samples = Vec::with_capacity(manifest.samples);
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let sample: Sample = serde_json::from_str(&line)?;
            if sample.labels.len() != expected {
                return Err(DatasetError::LabelLength {
                    line: i + 1,
                    expected,
                    actual: sample.labels.len(),
                });
            }
            samples.push(sample);
        }

        if samples.len() != manifest.samples {
            tracing::warn!(
                manifest = manifest.samples,
                found = samples.len(),
                "sample count differs from manifest"
            );
        }
        tracing::debug!(dir = %dir.display(), samples = samples.len(), "dataset opened");

        Ok(Self { manifest, samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Shuffle and split into (train, test); `test_fraction` of the samples
    /// (at least one when the dataset has two or more) go to test.
    pub fn split_train_test(mut self, test_fraction: f32, seed: u64) -> (Dataset, Dataset) {
        self.samples.shuffle(&mut StdRng::seed_from_u64(seed));
        let n = self.samples.len();
        let mut n_test = ((n as f32) * test_fraction.clamp(0.0, 1.0)).round() as usize;
        if n >= 2 && n_test == 0 && test_fraction > 0.0 {
            n_test = 1;
        }
        let test_samples = self.samples.split_off(n - n_test.min(n));

        let mut train_manifest = self.manifest.clone();
        train_manifest.samples = self.samples.len();
        let mut test_manifest = self.manifest;
        test_manifest.samples = test_samples.len();

        (
            Dataset {
                manifest: train_manifest,
                samples: self.samples,
            },
            Dataset {
                manifest: test_manifest,
                samples: test_samples,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::tests::{label_fields, test_model};
    use crate::mat::tests::write_test_mat;

    fn write_sample(dir: &Path, stem: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(format!("{stem}.jpg")), b"not decoded during export").unwrap();
        let fields = label_fields("pt2d", 2);
        let borrowed: Vec<(&str, usize, usize, Vec<f64>)> = fields
            .iter()
            .map(|(n, r, c, d)| (n.as_str(), *r, *c, d.clone()))
            .collect();
        write_test_mat(&dir.join(format!("{stem}.mat")), &borrowed);
    }

    #[test]
    fn test_discover_pairs_and_depth() {
        let root = tempfile::tempdir().unwrap();
        write_sample(&root.path().join("AFW"), "a_0");
        write_sample(&root.path().join("HELEN"), "b_0");
        // Unlabeled image and an image at the wrong depth.
        fs::write(root.path().join("HELEN/orphan.jpg"), b"x").unwrap();
        write_sample(root.path(), "top");

        let found = discover_samples(root.path(), 2, 7).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|s| s.label.extension().unwrap() == "mat"));
    }

    #[test]
    fn test_discover_shuffle_is_seeded() {
        let root = tempfile::tempdir().unwrap();
        for i in 0..6 {
            write_sample(&root.path().join("set"), &format!("img_{i}"));
        }
        let a = discover_samples(root.path(), 2, 42).unwrap();
        let b = discover_samples(root.path(), 2, 42).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_export_and_open() {
        let root = tempfile::tempdir().unwrap();
        write_sample(&root.path().join("set"), "one");
        write_sample(&root.path().join("set"), "two");
        fs::create_dir_all(root.path().join("bad")).unwrap();
        fs::write(root.path().join("bad/broken.jpg"), b"x").unwrap();
        fs::write(root.path().join("bad/broken.mat"), b"garbage").unwrap();

        let samples = discover_samples(root.path(), 2, 1).unwrap();
        assert_eq!(samples.len(), 3);

        let extractor = LabelExtractor::new(
            Layout::Compact430,
            LabelSource::Lp300W,
            FrameScaling::new(450.0, 224.0),
            test_model(),
        );
        let out = tempfile::tempdir().unwrap();
        let summary = export_dataset(&samples, &extractor, out.path()).unwrap();
        assert_eq!(summary, ExportSummary { written: 2, skipped: 1 });

        let ds = Dataset::open(out.path()).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.manifest.layout, Layout::Compact430);
        assert_eq!(ds.manifest.skipped, 1);
        assert!(ds.samples.iter().all(|s| s.labels.len() == 430));
    }

    #[test]
    fn test_open_rejects_wrong_label_length() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest {
            layout: Layout::Full587,
            scaling: FrameScaling::default(),
            source: LabelSource::Lp300W,
            samples: 1,
            skipped: 0,
            created_at: Utc::now(),
        };
        fs::write(dir.path().join(MANIFEST_FILE), serde_json::to_string(&manifest).unwrap()).unwrap();
        fs::write(dir.path().join(SAMPLES_FILE), "{\"image\":\"a.jpg\",\"labels\":[1.0,2.0]}\n").unwrap();
        assert!(matches!(
            Dataset::open(dir.path()),
            Err(DatasetError::LabelLength { line: 1, expected: 587, actual: 2 })
        ));
    }

    #[test]
    fn test_split_train_test() {
        let ds = Dataset {
            manifest: Manifest {
                layout: Layout::Compact430,
                scaling: FrameScaling::default(),
                source: LabelSource::Lp300W,
                samples: 10,
                skipped: 0,
                created_at: Utc::now(),
            },
            samples: (0..10)
                .map(|i| Sample {
                    image: PathBuf::from(format!("{i}.jpg")),
                    labels: vec![i as f32],
                })
                .collect(),
        };
        let (train, test) = ds.split_train_test(0.2, 3);
        assert_eq!(train.len(), 8);
        assert_eq!(test.len(), 2);
        assert_eq!(test.manifest.samples, 2);
    }
}
