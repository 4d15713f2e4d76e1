use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{config::DataSection, TrainingError};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// One labelled image on disk. Pixels are decoded lazily at batch time.
#[derive(Debug, Clone)]
struct ImageSample {
    path: PathBuf,
    label: u32,
}

/// Directory-per-class image dataset with a deterministic train/validation
/// split. Class labels are assigned by sorting the subdirectory names, so the
/// mapping is stable across runs and machines.
pub struct ImageFolderDataset {
    samples: Vec<ImageSample>,
    classes: Vec<String>,
    train_indices: Vec<usize>,
    val_indices: Vec<usize>,
    image_size: usize,
    in_channels: usize,
    batch_size: usize,
    eval_subset_size: usize,
    seed: u64,
    device: Device,
}

impl ImageFolderDataset {
    pub fn new(
        data: &DataSection,
        image_size: usize,
        in_channels: usize,
        seed: u64,
        device: Device,
    ) -> Result<Self, TrainingError> {
        if !matches!(in_channels, 1 | 3) {
            return Err(TrainingError::initialization(format!(
                "image loading supports 1 or 3 channels, got {}",
                in_channels
            )));
        }

        let (samples, classes) = scan_image_folder(&data.root)?;
        if samples.len() < 2 {
            return Err(TrainingError::initialization(format!(
                "found {} image(s) under {}; need at least two to split into train and validation",
                samples.len(),
                data.root.display()
            )));
        }

        let mut indices: Vec<usize> = (0..samples.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        let mut val_count = ((samples.len() as f64) * data.val_ratio).round() as usize;
        val_count = val_count.clamp(1, samples.len() - 1);
        let val_indices = indices[..val_count].to_vec();
        let train_indices = indices[val_count..].to_vec();

        Ok(Self {
            samples,
            classes,
            train_indices,
            val_indices,
            image_size,
            in_channels,
            batch_size: data.batch_size,
            eval_subset_size: data.eval_subset_size,
            seed,
            device,
        })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn train_len(&self) -> usize {
        self.train_indices.len()
    }

    pub fn val_len(&self) -> usize {
        self.val_indices.len()
    }

    /// Shuffled training batches for one epoch. The shuffle is a pure
    /// function of the dataset seed and the epoch number, so an interrupted
    /// run that restarts at epoch `e` sees the same batch order.
    pub fn train_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut indices = self.train_indices.clone();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64 + 1));
        indices.shuffle(&mut rng);
        chunk_indices(&indices, self.batch_size)
    }

    /// Validation batches in fixed order.
    pub fn val_batches(&self) -> Vec<Vec<usize>> {
        chunk_indices(&self.val_indices, self.batch_size)
    }

    /// The fixed validation prefix used for latent snapshots. Always the same
    /// samples in the same order, so snapshots from different steps are
    /// comparable point for point.
    pub fn eval_subset(&self) -> Result<(Tensor, Tensor), TrainingError> {
        let count = self.eval_subset_size.min(self.val_indices.len());
        self.load_batch(&self.val_indices[..count])
    }

    /// Decode and stack one batch: images as `[batch, channels, size, size]`
    /// f32 in [-1, 1], labels as `[batch]` u32.
    pub fn load_batch(&self, indices: &[usize]) -> Result<(Tensor, Tensor), TrainingError> {
        if indices.is_empty() {
            return Err(TrainingError::runtime("cannot load an empty batch"));
        }

        let pixels_per_image = self.in_channels * self.image_size * self.image_size;
        let mut pixels = Vec::with_capacity(indices.len() * pixels_per_image);
        let mut labels = Vec::with_capacity(indices.len());

        for &index in indices {
            let sample = &self.samples[index];
            self.decode_into(&sample.path, &mut pixels)?;
            labels.push(sample.label);
        }

        let images = Tensor::from_vec(
            pixels,
            (
                indices.len(),
                self.in_channels,
                self.image_size,
                self.image_size,
            ),
            &self.device,
        )
        .map_err(to_runtime_error)?;
        let labels =
            Tensor::from_vec(labels, indices.len(), &self.device).map_err(to_runtime_error)?;
        Ok((images, labels))
    }

    fn decode_into(&self, path: &Path, pixels: &mut Vec<f32>) -> Result<(), TrainingError> {
        let decoded = image::open(path).map_err(|err| {
            TrainingError::runtime(format!("failed to decode {}: {}", path.display(), err))
        })?;
        let size = self.image_size;
        let resized = decoded.resize_exact(size as u32, size as u32, FilterType::Lanczos3);

        match self.in_channels {
            1 => {
                let gray = resized.to_luma8();
                for value in gray.as_raw() {
                    pixels.push(*value as f32 / 127.5 - 1.0);
                }
            }
            _ => {
                let rgb = resized.to_rgb8();
                // Channel-major layout: one full plane per channel.
                for channel in 0..3 {
                    for pixel in rgb.pixels() {
                        pixels.push(pixel[channel] as f32 / 127.5 - 1.0);
                    }
                }
            }
        }
        Ok(())
    }
}

fn scan_image_folder(root: &Path) -> Result<(Vec<ImageSample>, Vec<String>), TrainingError> {
    if !root.is_dir() {
        return Err(TrainingError::initialization(format!(
            "data root {} is not a directory",
            root.display()
        )));
    }

    let mut class_dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            class_dirs.push(entry.path());
        }
    }
    class_dirs.sort();

    let mut samples = Vec::new();
    let mut classes = Vec::new();
    for (label, dir) in class_dirs.iter().enumerate() {
        let name = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if entry.file_type()?.is_file() && is_image {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            samples.push(ImageSample {
                path,
                label: label as u32,
            });
        }
        classes.push(name);
    }

    Ok((samples, classes))
}

fn chunk_indices(indices: &[usize], batch_size: usize) -> Vec<Vec<usize>> {
    indices
        .chunks(batch_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn write_images(root: &Path, class: &str, count: usize, shade: u8) {
        let dir = root.join(class);
        fs::create_dir_all(&dir).unwrap();
        for idx in 0..count {
            let img = RgbImage::from_pixel(8, 8, image::Rgb([shade, shade, shade]));
            img.save(dir.join(format!("img_{idx:03}.png"))).unwrap();
        }
    }

    fn build(root: &Path) -> ImageFolderDataset {
        let section = DataSection {
            root: root.to_path_buf(),
            batch_size: 4,
            val_ratio: 0.25,
            eval_subset_size: 3,
        };
        ImageFolderDataset::new(&section, 16, 3, 7, Device::Cpu).unwrap()
    }

    #[test]
    fn labels_follow_sorted_directory_order() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "zebra", 4, 200);
        write_images(dir.path(), "apple", 4, 40);

        let dataset = build(dir.path());
        assert_eq!(dataset.classes(), &["apple".to_string(), "zebra".to_string()]);
        assert_eq!(dataset.train_len() + dataset.val_len(), 8);
    }

    #[test]
    fn split_is_deterministic_for_a_seed() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "a", 10, 10);
        write_images(dir.path(), "b", 10, 90);

        let first = build(dir.path());
        let second = build(dir.path());
        assert_eq!(first.train_indices, second.train_indices);
        assert_eq!(first.val_indices, second.val_indices);
        assert_eq!(first.val_len(), 5);
    }

    #[test]
    fn epoch_shuffles_differ_but_replay_identically() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "a", 12, 10);

        let dataset = build(dir.path());
        let epoch0 = dataset.train_batches(0);
        let epoch0_again = dataset.train_batches(0);
        let epoch1 = dataset.train_batches(1);

        assert_eq!(epoch0, epoch0_again);
        assert_ne!(epoch0, epoch1);

        let total: usize = epoch0.iter().map(|batch| batch.len()).sum();
        assert_eq!(total, dataset.train_len());
    }

    #[test]
    fn batches_are_normalized_chw_tensors() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "bright", 4, 255);

        let dataset = build(dir.path());
        let batches = dataset.train_batches(0);
        let (images, labels) = dataset.load_batch(&batches[0]).unwrap();

        assert_eq!(images.dims()[1..], [3, 16, 16]);
        assert_eq!(labels.dims(), &[images.dims()[0]]);

        let values = images.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
        // Uniform white pixels land at the top of the range.
        assert!(values.iter().all(|v| (*v - 1.0).abs() < 1e-3));
    }

    #[test]
    fn eval_subset_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), "a", 8, 30);
        write_images(dir.path(), "b", 8, 220);

        let dataset = build(dir.path());
        let (first_imgs, first_labels) = dataset.eval_subset().unwrap();
        let (second_imgs, second_labels) = dataset.eval_subset().unwrap();

        assert_eq!(first_imgs.dims()[0], 3);
        assert_eq!(
            first_imgs.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            second_imgs.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
        assert_eq!(
            first_labels.to_vec1::<u32>().unwrap(),
            second_labels.to_vec1::<u32>().unwrap()
        );
    }
}
