use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use candle_core::Tensor;
use image::{Rgb, RgbImage};

use crate::TrainingError;

const LATENT_DIR: &str = "latents";
const RECONSTRUCTION_DIR: &str = "reconstructions";
const SAMPLE_DIR: &str = "samples";

/// Writes side artifacts produced during training: latent snapshots for the
/// fixed evaluation subset, reconstruction grids, and prior-sample grids.
/// Everything is keyed by global step so artifacts from one run sort
/// chronologically.
pub struct ArtifactWriter {
    base_dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(base_dir: &Path) -> Result<Self, TrainingError> {
        for sub in [LATENT_DIR, RECONSTRUCTION_DIR, SAMPLE_DIR] {
            let dir = base_dir.join(sub);
            fs::create_dir_all(&dir).map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to create artifact directory {}: {err}",
                    dir.display()
                ))
            })?;
        }
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    /// Persist the latent vectors and labels of the evaluation subset as a
    /// safetensors file with two tensors: `latent` ([n, latent_dim] f32) and
    /// `label` ([n] u32).
    pub fn save_latent_snapshot(
        &self,
        step: usize,
        latents: &Tensor,
        labels: &Tensor,
    ) -> Result<PathBuf, TrainingError> {
        if latents.dims().len() != 2 {
            return Err(TrainingError::runtime(format!(
                "latent snapshot expects a [n, latent_dim] tensor, got {:?}",
                latents.dims()
            )));
        }
        if latents.dims()[0] != labels.dims().first().copied().unwrap_or(0) {
            return Err(TrainingError::runtime(
                "latent snapshot has mismatched latent and label counts",
            ));
        }

        let path = self
            .base_dir
            .join(LATENT_DIR)
            .join(format!("step_{:08}.safetensors", step));
        let tensors = HashMap::from([
            ("latent".to_string(), latents.clone()),
            ("label".to_string(), labels.clone()),
        ]);
        candle_core::safetensors::save(&tensors, &path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to write latent snapshot {}: {err}",
                path.display()
            ))
        })?;
        Ok(path)
    }

    /// Save a PNG with the original images on the top rows and their
    /// reconstructions directly below, one column per sample.
    pub fn save_reconstruction_grid(
        &self,
        step: usize,
        originals: &Tensor,
        reconstructions: &Tensor,
    ) -> Result<PathBuf, TrainingError> {
        if originals.dims() != reconstructions.dims() {
            return Err(TrainingError::runtime(format!(
                "reconstruction grid shape mismatch: {:?} vs {:?}",
                originals.dims(),
                reconstructions.dims()
            )));
        }
        let stacked = Tensor::cat(&[originals, reconstructions], 0).map_err(|err| {
            TrainingError::runtime(format!("failed to stack reconstruction grid: {err}"))
        })?;
        let columns = originals.dims()[0];
        let grid = render_grid(&stacked, columns)?;

        let path = self
            .base_dir
            .join(RECONSTRUCTION_DIR)
            .join(format!("step_{:08}.png", step));
        save_png(&grid, &path)?;
        Ok(path)
    }

    /// Save a PNG grid of decoder outputs for latents drawn from the prior.
    pub fn save_sample_grid(&self, step: usize, samples: &Tensor) -> Result<PathBuf, TrainingError> {
        let count = samples.dims().first().copied().unwrap_or(0);
        let columns = (count as f64).sqrt().ceil() as usize;
        let grid = render_grid(samples, columns.max(1))?;

        let path = self
            .base_dir
            .join(SAMPLE_DIR)
            .join(format!("step_{:08}.png", step));
        save_png(&grid, &path)?;
        Ok(path)
    }
}

/// Run a fallible storage operation, retrying exactly once on failure.
pub fn with_one_retry<T>(
    mut op: impl FnMut() -> Result<T, TrainingError>,
) -> Result<T, TrainingError> {
    match op() {
        Ok(value) => Ok(value),
        Err(_) => op(),
    }
}

/// Tile a `[batch, channels, height, width]` tensor of [-1, 1] pixels into a
/// single image with `columns` tiles per row.
fn render_grid(images: &Tensor, columns: usize) -> Result<RgbImage, TrainingError> {
    let dims = images.dims();
    if dims.len() != 4 {
        return Err(TrainingError::runtime(format!(
            "image grid expects [batch, channels, height, width], got {:?}",
            dims
        )));
    }
    let (batch, channels, height, width) = (dims[0], dims[1], dims[2], dims[3]);
    if batch == 0 || columns == 0 {
        return Err(TrainingError::runtime("cannot render an empty image grid"));
    }
    if !matches!(channels, 1 | 3) {
        return Err(TrainingError::runtime(format!(
            "image grid supports 1 or 3 channels, got {}",
            channels
        )));
    }

    let values = images
        .flatten_all()
        .map_err(|err| TrainingError::runtime(err.to_string()))?
        .to_vec1::<f32>()
        .map_err(|err| TrainingError::runtime(err.to_string()))?;

    let rows = batch.div_ceil(columns);
    let plane = height * width;
    let image_stride = channels * plane;

    let grid = RgbImage::from_fn(
        (columns * width) as u32,
        (rows * height) as u32,
        |gx, gy| {
            let (gx, gy) = (gx as usize, gy as usize);
            let tile = (gy / height) * columns + gx / width;
            if tile >= batch {
                return Rgb([0, 0, 0]);
            }
            let (x, y) = (gx % width, gy % height);
            let base = tile * image_stride + y * width + x;
            let sample = |channel: usize| {
                let v = values[base + channel * plane];
                ((v + 1.0) * 127.5).clamp(0.0, 255.0) as u8
            };
            if channels == 1 {
                let v = sample(0);
                Rgb([v, v, v])
            } else {
                Rgb([sample(0), sample(1), sample(2)])
            }
        },
    );
    Ok(grid)
}

fn save_png(grid: &RgbImage, path: &Path) -> Result<(), TrainingError> {
    grid.save(path).map_err(|err| {
        TrainingError::runtime(format!("failed to write image grid {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn latent_snapshots_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();

        let latents = Tensor::from_vec(
            vec![0.1f32, 0.2, 0.3, 0.4, 0.5, 0.6],
            (3, 2),
            &Device::Cpu,
        )
        .unwrap();
        let labels = Tensor::from_vec(vec![0u32, 1, 1], 3, &Device::Cpu).unwrap();

        let path = writer.save_latent_snapshot(500, &latents, &labels).unwrap();
        assert!(path.ends_with("latents/step_00000500.safetensors"));

        let loaded = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        let restored_latents = loaded.get("latent").unwrap();
        let restored_labels = loaded.get("label").unwrap();
        assert_eq!(restored_latents.dims(), &[3, 2]);
        assert_eq!(restored_labels.to_vec1::<u32>().unwrap(), vec![0, 1, 1]);
        assert_eq!(
            restored_latents.to_vec2::<f32>().unwrap(),
            latents.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn mismatched_latents_and_labels_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();

        let latents = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros(2, DType::U32, &Device::Cpu).unwrap();
        assert!(writer.save_latent_snapshot(0, &latents, &labels).is_err());
    }

    #[test]
    fn reconstruction_grid_stacks_rows() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();

        // Two white originals over two black reconstructions.
        let originals = Tensor::ones((2, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let recons = originals.affine(0.0, -1.0).unwrap();

        let path = writer
            .save_reconstruction_grid(12, &originals, &recons)
            .unwrap();
        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (8, 8));
        assert_eq!(decoded.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(decoded.get_pixel(0, 4), &Rgb([0, 0, 0]));
    }

    #[test]
    fn sample_grid_is_roughly_square() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();

        let samples = Tensor::zeros((5, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let path = writer.save_sample_grid(3, &samples).unwrap();
        let decoded = image::open(&path).unwrap().to_rgb8();
        // 5 tiles in 3 columns means 2 rows.
        assert_eq!(decoded.dimensions(), (12, 8));
    }

    #[test]
    fn retry_runs_the_operation_a_second_time() {
        let mut attempts = 0;
        let result = with_one_retry(|| {
            attempts += 1;
            if attempts == 1 {
                Err(TrainingError::runtime("transient"))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.unwrap(), 2);

        let mut attempts = 0;
        let result: Result<(), _> = with_one_retry(|| {
            attempts += 1;
            Err(TrainingError::runtime("persistent"))
        });
        assert!(result.is_err());
        assert_eq!(attempts, 2);
    }
}
