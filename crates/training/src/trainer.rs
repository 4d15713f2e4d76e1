use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device, Tensor,
};
use model::{GenerativeModel, VanillaVae};

use crate::{
    artifacts::{with_one_retry, ArtifactWriter},
    checkpoint::{self, SaveRequest},
    data::ImageFolderDataset,
    logging::{Logger, LoggingSettings},
    metrics::{EpochMetrics, EpochSummary, TrainingMetrics},
    optimizer::{AdamConfig, AdamOptimizer},
    TrainingConfig, TrainingError,
};

const GRID_IMAGE_COUNT: usize = 8;

/// Single-threaded training loop: for every epoch, run the shuffled training
/// steps, then a full validation pass, then checkpoint on the configured
/// cadence. Latent snapshots and image grids are exported by global step.
pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    dataset: ImageFolderDataset,
    model: VanillaVae,
    optimizer: AdamOptimizer,
    eval_images: Tensor,
    eval_labels: Tensor,
    epochs_completed: usize,
    global_step: usize,
    log_every: usize,
    metrics: TrainingMetrics,
    logger: Logger,
    artifacts: ArtifactWriter,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;

        let device = select_device();
        if let Err(err) = device.set_seed(config.runtime.seed) {
            eprintln!("warning: failed to seed device RNG: {}", err);
        }

        let logger = Logger::new(LoggingSettings::from(&config.runtime.logging))?;
        logger.log_message(&format!(
            "device selected: is_cuda={} is_metal={} is_cpu={}",
            device.is_cuda(),
            device.is_metal(),
            device.is_cpu()
        ));

        let dataset = ImageFolderDataset::new(
            &config.data,
            config.model.image_size,
            config.model.in_channels,
            config.runtime.seed,
            device.clone(),
        )?;
        logger.log_message(&format!(
            "dataset ready: {} train / {} val images across {} classes",
            dataset.train_len(),
            dataset.val_len(),
            dataset.classes().len()
        ));

        let model = VanillaVae::new(config.vae_config(device.clone())).map_err(|err| {
            TrainingError::initialization(format!("failed to build model: {err}"))
        })?;

        let named_parameters = model.named_parameters();
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "model produced no trainable parameters",
            ));
        }
        logger.log_message(&format!(
            "optimizer will track {} tensor(s)",
            named_parameters.len()
        ));
        let optimizer = AdamOptimizer::new(named_parameters, AdamConfig::from(&config.optimizer))?;

        // The snapshot subset is pinned once so every latent export describes
        // the same samples in the same order.
        let (eval_images, eval_labels) = dataset.eval_subset()?;

        let artifacts = ArtifactWriter::new(&config.runtime.snapshot.directory)?;
        let log_every = config.runtime.log_every_n_steps.max(1);

        Ok(Self {
            config,
            device,
            dataset,
            model,
            optimizer,
            eval_images,
            eval_labels,
            epochs_completed: 0,
            global_step: 0,
            log_every,
            metrics: TrainingMetrics::new(),
            logger,
            artifacts,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs_completed
    }

    pub fn model(&self) -> &VanillaVae {
        &self.model
    }

    /// Restore model weights and progress counters from the newest checkpoint
    /// under the configured checkpoint directory, if any exists. Optimizer
    /// moments restart from zero; the learning rate is re-derived by
    /// replaying the per-epoch decay.
    pub fn resume_from_latest(
        &mut self,
    ) -> Result<Option<checkpoint::CheckpointDescriptor>, TrainingError> {
        let directory = self.config.runtime.checkpoint.directory.clone();
        let Some(descriptor) = checkpoint::latest_checkpoint(&directory)? else {
            return Ok(None);
        };
        self.resume_from_path(&descriptor.directory)?;
        Ok(Some(descriptor))
    }

    pub fn resume_from_path(
        &mut self,
        directory: &std::path::Path,
    ) -> Result<checkpoint::CheckpointDescriptor, TrainingError> {
        let descriptor = checkpoint::load_checkpoint(directory)?;

        let expected = self.config.fingerprint()?;
        if descriptor.manifest.config_sha256 != expected {
            self.logger.log_warning(&format!(
                "checkpoint {} was produced by a different configuration",
                directory.display()
            ));
        }

        checkpoint::apply_model_weights(&self.model, directory)?;
        self.epochs_completed = descriptor.manifest.epoch;
        self.global_step = descriptor.manifest.global_step;
        for _ in 0..self.epochs_completed {
            self.optimizer.decay();
        }

        self.logger.log_message(&format!(
            "resumed from checkpoint {} (epoch {}, step {})",
            directory.display(),
            self.epochs_completed,
            self.global_step
        ));
        Ok(descriptor)
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        let total_epochs = self.config.runtime.epochs;
        let kld_weight = self.config.runtime.kld_weight;

        self.logger.log_message(&format!(
            "starting training on {:?} for {} epoch(s), kld_weight={}",
            self.device, total_epochs, kld_weight
        ));

        'epochs: while self.epochs_completed < total_epochs {
            let epoch = self.epochs_completed;

            for batch_indices in self.dataset.train_batches(epoch) {
                if should_stop() {
                    self.logger.log_message("shutdown requested; stopping");
                    break 'epochs;
                }
                self.train_step(epoch, &batch_indices, kld_weight)?;
            }

            // Decay happens once per epoch, before the validation pass, so
            // the logged learning rate already reflects the next epoch.
            self.optimizer.decay();

            let summary = self.evaluate()?;
            self.logger.log_validation(epoch + 1, &summary);

            self.epochs_completed = epoch + 1;
            self.maybe_checkpoint();
        }

        self.logger.flush();
        Ok(())
    }

    fn train_step(
        &mut self,
        epoch: usize,
        batch_indices: &[usize],
        kld_weight: f64,
    ) -> Result<(), TrainingError> {
        let (images, _labels) = self.dataset.load_batch(batch_indices)?;

        let output = self
            .model
            .forward(&images, true)
            .map_err(to_runtime_error)?;
        let loss = self
            .model
            .loss(&output, kld_weight)
            .map_err(to_runtime_error)?;

        if !loss.record.is_finite() {
            return Err(TrainingError::divergence(format!(
                "non-finite loss at epoch {} step {}: total={} recon={} kld={}",
                epoch + 1,
                self.global_step + 1,
                loss.record.total,
                loss.record.reconstruction,
                loss.record.kld
            )));
        }

        let mut grads = loss.total.backward().map_err(to_runtime_error)?;
        let grad_norm = self.optimizer.step(&mut grads)?;
        if !grad_norm.is_finite() {
            return Err(TrainingError::divergence(format!(
                "non-finite gradient norm at epoch {} step {}",
                epoch + 1,
                self.global_step + 1
            )));
        }

        self.global_step += 1;
        let snapshot =
            self.metrics
                .record_step(batch_indices.len() as u64, &loss.record, grad_norm);
        if self.global_step % self.log_every == 0 || self.global_step <= 5 {
            self.logger.log_training_step(
                epoch + 1,
                self.global_step,
                self.optimizer.learning_rate(),
                &snapshot,
            );
        }

        if self.global_step % self.config.runtime.snapshot.every_n_steps == 0 {
            self.export_artifacts();
        }

        Ok(())
    }

    /// Full pass over the validation split in inference mode. No parameter
    /// or batch-norm statistic changes; running this is observationally free.
    pub fn evaluate(&mut self) -> Result<EpochSummary, TrainingError> {
        let kld_weight = self.config.runtime.kld_weight;
        let mut metrics = EpochMetrics::default();

        for batch_indices in self.dataset.val_batches() {
            let (images, _labels) = self.dataset.load_batch(&batch_indices)?;
            let output = self
                .model
                .forward(&images, false)
                .map_err(to_runtime_error)?;
            let loss = self
                .model
                .loss(&output, kld_weight)
                .map_err(to_runtime_error)?;
            metrics.update(&loss.record, batch_indices.len() as u64);
        }

        metrics
            .finalize()
            .ok_or_else(|| TrainingError::runtime("validation produced no samples"))
    }

    /// Latent snapshot plus reconstruction and prior-sample grids for the
    /// current global step. Each write is retried once; a second failure is
    /// logged and training continues.
    fn export_artifacts(&mut self) {
        let step = self.global_step;

        match self.eval_latents() {
            Ok(latents) => {
                let result = with_one_retry(|| {
                    self.artifacts
                        .save_latent_snapshot(step, &latents, &self.eval_labels)
                });
                if let Err(err) = result {
                    self.logger
                        .log_warning(&format!("latent snapshot at step {} failed: {}", step, err));
                }
            }
            Err(err) => {
                self.logger
                    .log_warning(&format!("latent encoding at step {} failed: {}", step, err));
            }
        }

        match self.reconstruction_pair() {
            Ok((originals, reconstructions)) => {
                let result = with_one_retry(|| {
                    self.artifacts
                        .save_reconstruction_grid(step, &originals, &reconstructions)
                });
                if let Err(err) = result {
                    self.logger.log_warning(&format!(
                        "reconstruction grid at step {} failed: {}",
                        step, err
                    ));
                }
            }
            Err(err) => {
                self.logger
                    .log_warning(&format!("reconstruction at step {} failed: {}", step, err));
            }
        }

        match self.model.sample_prior(self.config.runtime.snapshot.sample_count) {
            Ok(samples) => {
                let result = with_one_retry(|| self.artifacts.save_sample_grid(step, &samples));
                if let Err(err) = result {
                    self.logger
                        .log_warning(&format!("sample grid at step {} failed: {}", step, err));
                }
            }
            Err(err) => {
                self.logger
                    .log_warning(&format!("prior sampling at step {} failed: {}", step, err));
            }
        }
    }

    /// Posterior means for the fixed evaluation subset. Means rather than
    /// samples, so snapshots taken at different steps are comparable.
    fn eval_latents(&self) -> Result<Tensor, TrainingError> {
        let (mu, _log_var) = self
            .model
            .encode(&self.eval_images, false)
            .map_err(to_runtime_error)?;
        Ok(mu)
    }

    fn reconstruction_pair(&self) -> Result<(Tensor, Tensor), TrainingError> {
        let count = GRID_IMAGE_COUNT.min(self.eval_images.dims()[0]);
        let originals = self
            .eval_images
            .narrow(0, 0, count)
            .map_err(to_runtime_error)?;
        let output = self
            .model
            .forward(&originals, false)
            .map_err(to_runtime_error)?;
        Ok((originals, output.reconstruction))
    }

    fn maybe_checkpoint(&mut self) {
        let settings = &self.config.runtime.checkpoint;
        if self.epochs_completed % settings.every_n_epochs != 0 {
            return;
        }

        let result = with_one_retry(|| {
            checkpoint::save_checkpoint(SaveRequest {
                base_dir: &settings.directory,
                config: &self.config,
                model: &self.model,
                epoch: self.epochs_completed,
                global_step: self.global_step,
                max_keep: settings.max_keep,
            })
        });

        match result {
            Ok(descriptor) => {
                self.logger.log_message(&format!(
                    "checkpoint saved after epoch {} -> {}",
                    self.epochs_completed,
                    descriptor.directory.display()
                ));
            }
            Err(err) => {
                self.logger.log_warning(&format!(
                    "checkpoint after epoch {} failed: {}",
                    self.epochs_completed, err
                ));
            }
        }
    }
}

fn select_device() -> Device {
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => return device,
            Err(err) => {
                eprintln!(
                    "failed to initialize metal device, falling back to CPU: {}",
                    err
                );
            }
        }
    } else if cuda_is_available() {
        match Device::cuda_if_available(0) {
            Ok(device) => return device,
            Err(err) => {
                eprintln!("cuda reported available but initialization failed: {err}");
            }
        }
    }
    Device::Cpu
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
