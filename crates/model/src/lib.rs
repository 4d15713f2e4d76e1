pub mod blocks;
pub mod config;
pub mod vae;

pub use config::{default_hidden_dims, VaeConfig};
pub use vae::{GenerativeModel, LossOutput, LossRecord, VaeOutput, VanillaVae};
