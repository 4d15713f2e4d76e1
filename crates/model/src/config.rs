use candle_core::{DType, Device, Error, Result};

/// High-level configuration for assembling the convolutional autoencoder.
#[derive(Debug, Clone)]
pub struct VaeConfig {
    pub in_channels: usize,
    pub latent_dim: usize,
    pub hidden_dims: Vec<usize>,
    pub image_size: usize,
    pub dtype: DType,
    pub device: Device,
}

impl VaeConfig {
    pub fn new(in_channels: usize, latent_dim: usize, device: Device) -> Self {
        Self {
            in_channels,
            latent_dim,
            hidden_dims: default_hidden_dims(),
            image_size: 64,
            dtype: DType::F32,
            device,
        }
    }

    /// Validate structural invariants before any tensor is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 {
            return Err(Error::Msg("in_channels must be greater than zero".into()));
        }
        if self.latent_dim == 0 {
            return Err(Error::Msg("latent_dim must be greater than zero".into()));
        }
        if self.hidden_dims.is_empty() {
            return Err(Error::Msg("hidden_dims must not be empty".into()));
        }
        if self.hidden_dims.iter().any(|&width| width == 0) {
            return Err(Error::Msg("hidden_dims entries must be non-zero".into()));
        }
        let stages = self.hidden_dims.len();
        let downsample = 1usize << stages;
        if self.image_size == 0 || self.image_size % downsample != 0 {
            return Err(Error::Msg(format!(
                "image_size ({}) must be a non-zero multiple of 2^{} (one halving per encoder stage)",
                self.image_size, stages
            )));
        }
        Ok(())
    }

    /// Spatial side length at the bottleneck, after every encoder stage has
    /// halved the resolution.
    pub fn bottleneck_size(&self) -> usize {
        self.image_size >> self.hidden_dims.len()
    }

    /// Flattened feature count feeding the mean/log-variance heads.
    pub fn flattened_dim(&self) -> usize {
        let side = self.bottleneck_size();
        self.hidden_dims.last().copied().unwrap_or(0) * side * side
    }
}

pub fn default_hidden_dims() -> Vec<usize> {
    vec![32, 64, 128, 256, 512]
}
