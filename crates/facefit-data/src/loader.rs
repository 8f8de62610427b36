//! Batch assembly and the background loader thread.

use crate::dataset::{Dataset, Sample};
use crate::images::{self, ImageLoadError};
use image::RgbImage;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Batches buffered ahead of the consumer.
const PREFETCH: usize = 4;

/// Images, features and labels for one step.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, feature_len)` network inputs.
    pub features: Array2<f32>,
    /// `(batch, layout_len)` normalized labels.
    pub labels: Array2<f32>,
    /// Decoded `image_size²` images, kept for landmark overlays.
    pub images: Vec<RgbImage>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.nrows() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub image_size: u32,
    pub feature_size: u32,
    pub seed: u64,
}

/// Decode images and stack labels for `samples`.
pub fn load_batch(samples: &[Sample], image_size: u32, feature_size: u32) -> Result<Batch, ImageLoadError> {
    let label_len = samples.first().map(|s| s.labels.len()).unwrap_or(0);
    let feature_len = images::feature_len(feature_size);

    let mut features = Array2::zeros((samples.len(), feature_len));
    let mut labels = Array2::zeros((samples.len(), label_len));
    let mut decoded = Vec::with_capacity(samples.len());

    for (i, sample) in samples.iter().enumerate() {
        let img = images::load_image(&sample.image, image_size)?;
        features.row_mut(i).assign(&images::features(&img, feature_size));
        for (j, v) in sample.labels.iter().take(label_len).enumerate() {
            labels[[i, j]] = *v;
        }
        decoded.push(img);
    }

    Ok(Batch {
        features,
        labels,
        images: decoded,
    })
}

/// Split `dataset` into consecutive batches of `batch_size`, dropping the
/// trailing partial batch.
pub fn batch_ranges(len: usize, batch_size: usize) -> impl Iterator<Item = std::ops::Range<usize>> {
    let size = batch_size.max(1);
    (0..len / size).map(move |b| b * size..(b + 1) * size)
}

/// Read the first `count` batches of `dataset` in order. Used for
/// evaluation, where the test set is not shuffled.
pub fn load_batches(dataset: &Dataset, config: &LoaderConfig, count: Option<usize>) -> Result<Vec<Batch>, ImageLoadError> {
    batch_ranges(dataset.len(), config.batch_size)
        .take(count.unwrap_or(usize::MAX))
        .map(|r| load_batch(&dataset.samples[r], config.image_size, config.feature_size))
        .collect()
}

/// Handle to a running loader thread.
pub struct BatchLoader {
    rx: mpsc::Receiver<Batch>,
    thread: Option<JoinHandle<()>>,
}

impl BatchLoader {
    /// Spawn a thread that yields shuffled training batches forever,
    /// reshuffling each epoch. A batch with any image that fails to decode
    /// is skipped whole with a warning. If a full epoch yields no batch the
    /// thread exits, and `next` returns `None`.
    pub fn spawn(dataset: Dataset, config: LoaderConfig) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel(PREFETCH);
        let thread = std::thread::Builder::new()
            .name("facefit-loader".into())
            .spawn(move || run_loader(dataset, config, tx))?;
        Ok(Self {
            rx,
            thread: Some(thread),
        })
    }

    /// Next batch, or `None` when the loader has stopped.
    pub fn next_blocking(&mut self) -> Option<Batch> {
        self.rx.blocking_recv()
    }

    pub async fn next(&mut self) -> Option<Batch> {
        self.rx.recv().await
    }
}

impl Drop for BatchLoader {
    fn drop(&mut self) {
        self.rx.close();
        // Drain so a sender blocked on a full channel observes the close.
        while self.rx.try_recv().is_ok() {}
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_loader(dataset: Dataset, config: LoaderConfig, tx: mpsc::Sender<Batch>) {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut samples = dataset.samples;
    if samples.len() < config.batch_size.max(1) {
        tracing::error!(
            samples = samples.len(),
            batch_size = config.batch_size,
            "dataset smaller than one batch, loader exiting"
        );
        return;
    }

    let mut epoch = 0u64;
    loop {
        samples.shuffle(&mut rng);
        tracing::debug!(epoch, "loader epoch start");
        let mut sent = 0usize;
        for range in batch_ranges(samples.len(), config.batch_size) {
            let batch = match load_batch(&samples[range], config.image_size, config.feature_size) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping batch");
                    if tx.is_closed() {
                        tracing::debug!("loader consumer gone, exiting");
                        return;
                    }
                    continue;
                }
            };
            if tx.blocking_send(batch).is_err() {
                tracing::debug!("loader consumer gone, exiting");
                return;
            }
            sent += 1;
        }
        if sent == 0 {
            tracing::error!(epoch, samples = samples.len(), "no batch could be loaded in a full epoch, loader exiting");
            return;
        }
        epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Manifest;
    use crate::extract::LabelSource;
    use chrono::Utc;
    use facefit_core::{FrameScaling, Layout};
    use image::Rgb;
    use std::path::Path;

    fn tiny_dataset(dir: &Path, n: usize) -> Dataset {
        let samples = (0..n)
            .map(|i| {
                let path = dir.join(format!("{i}.png"));
                RgbImage::from_pixel(12, 12, Rgb([(i * 20) as u8, 0, 0])).save(&path).unwrap();
                Sample {
                    image: path,
                    labels: vec![i as f32, 1.0, 2.0],
                }
            })
            .collect();
        Dataset {
            manifest: Manifest {
                layout: Layout::Compact430,
                scaling: FrameScaling::default(),
                source: LabelSource::Lp300W,
                samples: n,
                skipped: 0,
                created_at: Utc::now(),
            },
            samples,
        }
    }

    #[test]
    fn test_batch_ranges_drop_remainder() {
        let r: Vec<_> = batch_ranges(7, 3).collect();
        assert_eq!(r, vec![0..3, 3..6]);
        assert_eq!(batch_ranges(2, 3).count(), 0);
    }

    #[test]
    fn test_load_batch_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let ds = tiny_dataset(dir.path(), 3);
        let batch = load_batch(&ds.samples, 8, 4).unwrap();
        assert_eq!(batch.features.dim(), (3, 48));
        assert_eq!(batch.labels.dim(), (3, 3));
        assert_eq!(batch.labels[[2, 0]], 2.0);
        assert_eq!(batch.images[0].dimensions(), (8, 8));
    }

    #[test]
    fn test_loader_thread_cycles_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let ds = tiny_dataset(dir.path(), 4);
        let config = LoaderConfig {
            batch_size: 2,
            image_size: 8,
            feature_size: 4,
            seed: 9,
        };
        let mut loader = BatchLoader::spawn(ds, config).unwrap();
        // Two batches per epoch; five pulls crosses into the third epoch.
        for _ in 0..5 {
            let batch = loader.next_blocking().unwrap();
            assert_eq!(batch.len(), 2);
        }
    }

    #[test]
    fn test_loader_exits_when_no_image_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = tiny_dataset(dir.path(), 4);
        for sample in &mut ds.samples {
            sample.image = dir.path().join("moved").join("gone.png");
        }
        let config = LoaderConfig {
            batch_size: 2,
            image_size: 8,
            feature_size: 4,
            seed: 1,
        };
        let mut loader = BatchLoader::spawn(ds, config).unwrap();
        assert!(loader.next_blocking().is_none());
        // Dropping joins the thread; it must already have exited.
        drop(loader);
    }

    #[test]
    fn test_loader_skips_only_bad_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = tiny_dataset(dir.path(), 4);
        ds.samples[0].image = dir.path().join("gone.png");
        let config = LoaderConfig {
            batch_size: 2,
            image_size: 8,
            feature_size: 4,
            seed: 3,
        };
        let mut loader = BatchLoader::spawn(ds, config).unwrap();
        for _ in 0..3 {
            let batch = loader.next_blocking().unwrap();
            assert_eq!(batch.len(), 2);
            assert!(batch.labels.column(0).iter().all(|&v| v != 0.0));
        }
    }

    #[test]
    fn test_load_batches_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let ds = tiny_dataset(dir.path(), 5);
        let config = LoaderConfig {
            batch_size: 2,
            image_size: 8,
            feature_size: 4,
            seed: 0,
        };
        let batches = load_batches(&ds, &config, None).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].labels[[0, 0]], 2.0);
        assert_eq!(load_batches(&ds, &config, Some(1)).unwrap().len(), 1);
    }
}
