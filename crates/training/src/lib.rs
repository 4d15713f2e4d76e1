pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod trainer;

pub use artifacts::ArtifactWriter;
pub use checkpoint::{CheckpointDescriptor, CheckpointManifest};
pub use config::{TrainingConfig, TrainingError};
pub use data::ImageFolderDataset;
pub use metrics::{EpochSummary, StepSnapshot};
pub use optimizer::{AdamConfig, AdamOptimizer};
pub use trainer::Trainer;
