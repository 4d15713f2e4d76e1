use candle_core::{DType, Device};
use model::{default_hidden_dims, VaeConfig};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSection,
    pub data: DataSection,
    #[serde(default)]
    pub optimizer: OptimizerSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.in_channels == 0 {
            errors.push("model.in_channels must be greater than 0".to_string());
        }

        if self.model.latent_dim == 0 {
            errors.push("model.latent_dim must be greater than 0".to_string());
        }

        if self.model.hidden_dims.is_empty() {
            errors.push("model.hidden_dims must not be empty".to_string());
        } else {
            let downsample = 1usize << self.model.hidden_dims.len();
            if self.model.image_size == 0 || self.model.image_size % downsample != 0 {
                errors.push(format!(
                    "model.image_size ({}) must be a non-zero multiple of 2^{}",
                    self.model.image_size,
                    self.model.hidden_dims.len()
                ));
            }
        }

        if self.data.root.as_os_str().is_empty() {
            errors.push("data.root must not be empty".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if !(0.0 < self.data.val_ratio && self.data.val_ratio < 1.0) {
            errors.push("data.val_ratio must be in (0, 1)".to_string());
        }

        if self.data.eval_subset_size == 0 {
            errors.push("data.eval_subset_size must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.lr_decay && self.optimizer.lr_decay <= 1.0) {
            errors.push("optimizer.lr_decay must be in (0, 1]".to_string());
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }

        if self.runtime.kld_weight < 0.0 {
            errors.push("runtime.kld_weight must be >= 0".to_string());
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if self.runtime.checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }

        if self.runtime.checkpoint.every_n_epochs == 0 {
            errors.push("runtime.checkpoint.every_n_epochs must be greater than 0".to_string());
        }

        if let Some(0) = self.runtime.checkpoint.max_keep {
            errors.push("runtime.checkpoint.max_keep must be greater than 0".to_string());
        }

        if self.runtime.snapshot.directory.as_os_str().is_empty() {
            errors.push("runtime.snapshot.directory must not be empty".to_string());
        }

        if self.runtime.snapshot.every_n_steps == 0 {
            errors.push("runtime.snapshot.every_n_steps must be greater than 0".to_string());
        }

        if self.runtime.snapshot.sample_count == 0 {
            errors.push("runtime.snapshot.sample_count must be greater than 0".to_string());
        }

        if self.runtime.logging.flush_every_n_steps == 0 {
            errors.push("runtime.logging.flush_every_n_steps must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }

    pub fn vae_config(&self, device: Device) -> VaeConfig {
        VaeConfig {
            in_channels: self.model.in_channels,
            latent_dim: self.model.latent_dim,
            hidden_dims: self.model.hidden_dims.clone(),
            image_size: self.model.image_size,
            dtype: DType::F32,
            device,
        }
    }

    /// Stable digest of the configuration, stored in checkpoint manifests so
    /// a resumed run can detect that it was launched with different settings.
    pub fn fingerprint(&self) -> Result<String, TrainingError> {
        use sha2::{Digest, Sha256};
        let encoded = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,
    #[serde(default = "default_hidden_dims")]
    pub hidden_dims: Vec<usize>,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            in_channels: default_in_channels(),
            latent_dim: default_latent_dim(),
            hidden_dims: default_hidden_dims(),
            image_size: default_image_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSection {
    pub root: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_val_ratio")]
    pub val_ratio: f64,
    #[serde(default = "default_eval_subset_size")]
    pub eval_subset_size: usize,
}

impl DataSection {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.root, base);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OptimizerSection {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_lr_decay")]
    pub lr_decay: f64,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            lr_decay: default_lr_decay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_kld_weight")]
    pub kld_weight: f64,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub snapshot: SnapshotSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            epochs: default_epochs(),
            kld_weight: default_kld_weight(),
            log_every_n_steps: default_log_every_n_steps(),
            checkpoint: CheckpointSection::default(),
            snapshot: SnapshotSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl RuntimeSection {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.checkpoint.directory, base);
        absolutize_in_place(&mut self.snapshot.directory, base);
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSection {
    #[serde(default = "default_checkpoint_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_checkpoint_every_n_epochs")]
    pub every_n_epochs: usize,
    #[serde(default)]
    pub max_keep: Option<usize>,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_directory(),
            every_n_epochs: default_checkpoint_every_n_epochs(),
            max_keep: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSection {
    #[serde(default = "default_snapshot_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_snapshot_every_n_steps")]
    pub every_n_steps: usize,
    #[serde(default = "default_sample_count")]
    pub sample_count: usize,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            directory: default_snapshot_directory(),
            every_n_steps: default_snapshot_every_n_steps(),
            sample_count: default_sample_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default = "default_tensorboard_directory")]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_flush_every_n_steps")]
    pub flush_every_n_steps: usize,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            enable_stdout: default_enable_stdout(),
            tensorboard: default_tensorboard_directory(),
            flush_every_n_steps: default_flush_every_n_steps(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_in_channels() -> usize {
    3
}

fn default_latent_dim() -> usize {
    128
}

fn default_image_size() -> usize {
    64
}

fn default_batch_size() -> usize {
    64
}

fn default_val_ratio() -> f64 {
    0.1
}

fn default_eval_subset_size() -> usize {
    512
}

fn default_learning_rate() -> f64 {
    5e-3
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_lr_decay() -> f64 {
    0.95
}

fn default_seed() -> u64 {
    42
}

fn default_epochs() -> usize {
    100
}

fn default_kld_weight() -> f64 {
    0.00025
}

fn default_log_every_n_steps() -> usize {
    100
}

fn default_checkpoint_directory() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_checkpoint_every_n_epochs() -> usize {
    10
}

fn default_snapshot_directory() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_snapshot_every_n_steps() -> usize {
    500
}

fn default_sample_count() -> usize {
    64
}

fn default_enable_stdout() -> bool {
    true
}

// Scalar metric logging is on by default; the directory sits next to the
// snapshot directory and is absolutized against the config file like it.
fn default_tensorboard_directory() -> Option<PathBuf> {
    Some(PathBuf::from("tensorboard"))
}

fn default_flush_every_n_steps() -> usize {
    50
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    Divergence(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn divergence(message: impl Into<String>) -> Self {
        Self::Divergence(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "I/O error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::Divergence(msg) => write!(f, "training diverged: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> TrainingConfig {
        TrainingConfig {
            model: ModelSection::default(),
            data: DataSection {
                root: PathBuf::from("/data/faces"),
                batch_size: default_batch_size(),
                val_ratio: default_val_ratio(),
                eval_subset_size: default_eval_subset_size(),
            },
            optimizer: OptimizerSection::default(),
            runtime: RuntimeSection::default(),
        }
    }

    #[test]
    fn defaults_pass_validation() {
        minimal().validate().unwrap();
    }

    #[test]
    fn validation_collects_every_error() {
        let mut config = minimal();
        config.data.batch_size = 0;
        config.optimizer.learning_rate = 0.0;
        config.optimizer.lr_decay = 1.5;
        config.runtime.epochs = 0;

        match config.validate() {
            Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 4),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn image_size_must_survive_every_halving() {
        let mut config = minimal();
        config.model.image_size = 48;
        assert!(config.validate().is_err());

        config.model.image_size = 64;
        config.validate().unwrap();
    }

    #[test]
    fn toml_overrides_defaults() {
        let parsed: TrainingConfig = toml::from_str(
            r#"
            [data]
            root = "images"
            batch_size = 16

            [optimizer]
            learning_rate = 0.001

            [runtime.checkpoint]
            every_n_epochs = 5
            "#,
        )
        .unwrap();

        assert_eq!(parsed.data.batch_size, 16);
        assert_eq!(parsed.optimizer.learning_rate, 0.001);
        assert_eq!(parsed.runtime.checkpoint.every_n_epochs, 5);
        assert_eq!(parsed.model.latent_dim, 128);
        assert_eq!(parsed.runtime.kld_weight, 0.00025);
    }

    #[test]
    fn tensorboard_logging_is_on_by_default() {
        let parsed: TrainingConfig = toml::from_str(
            r#"
            [data]
            root = "images"
            "#,
        )
        .unwrap();

        // The scalar metric feed is part of the produced artifacts; a config
        // that never mentions logging still gets an event-file directory.
        assert_eq!(
            parsed.runtime.logging.tensorboard,
            Some(PathBuf::from("tensorboard"))
        );
        assert_eq!(
            LoggingSection::default().tensorboard,
            Some(PathBuf::from("tensorboard"))
        );
    }

    #[test]
    fn io_errors_render_neutrally() {
        // The Io variant is also reached from dataset scanning, so its
        // message must not claim the config file was at fault.
        let err = TrainingError::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing directory",
        ));
        let text = err.to_string();
        assert!(text.starts_with("I/O error"), "got '{text}'");
        assert!(!text.contains("config"), "got '{text}'");
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = minimal();
        let mut b = minimal();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());

        b.optimizer.learning_rate = 0.001;
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }
}
