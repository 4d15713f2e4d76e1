use candle_core::{Error, Result, Tensor, Var};
use candle_nn::{linear, loss, Linear, Module, VarBuilder, VarMap};

use crate::{
    blocks::{DownBlock, OutputBlock, UpBlock},
    config::VaeConfig,
};

/// Everything the loss needs from one pass through the autoencoder.
#[derive(Debug)]
pub struct VaeOutput {
    pub reconstruction: Tensor,
    pub input: Tensor,
    pub mu: Tensor,
    pub log_var: Tensor,
}

/// Scalar view of one batch's loss, read-only after computation.
#[derive(Debug, Clone, Copy)]
pub struct LossRecord {
    pub total: f32,
    pub reconstruction: f32,
    pub kld: f32,
}

impl LossRecord {
    pub fn is_finite(&self) -> bool {
        self.total.is_finite() && self.reconstruction.is_finite() && self.kld.is_finite()
    }
}

/// Differentiable total loss paired with its scalar decomposition.
#[derive(Debug)]
pub struct LossOutput {
    pub total: Tensor,
    pub record: LossRecord,
}

/// Contract shared by generative autoencoders so alternative regularization
/// schemes can be substituted behind the same seam.
pub trait GenerativeModel {
    fn encode(&self, images: &Tensor, train: bool) -> Result<(Tensor, Tensor)>;
    fn decode(&self, z: &Tensor, train: bool) -> Result<Tensor>;
    fn forward(&self, images: &Tensor, train: bool) -> Result<VaeOutput>;
    fn loss(&self, output: &VaeOutput, kld_weight: f64) -> Result<LossOutput>;
    fn sample_prior(&self, count: usize) -> Result<Tensor>;
}

/// Convolutional variational autoencoder with a diagonal-Gaussian bottleneck.
pub struct VanillaVae {
    config: VaeConfig,
    varmap: VarMap,
    encoder: Vec<DownBlock>,
    fc_mu: Linear,
    fc_var: Linear,
    decoder_input: Linear,
    decoder: Vec<UpBlock>,
    output: OutputBlock,
}

impl VanillaVae {
    pub fn new(config: VaeConfig) -> Result<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);

        let mut encoder = Vec::with_capacity(config.hidden_dims.len());
        let mut channels = config.in_channels;
        for (idx, &width) in config.hidden_dims.iter().enumerate() {
            let block = DownBlock::new(channels, width, vb.pp("encoder").pp(format!("stage{idx}")))?;
            encoder.push(block);
            channels = width;
        }

        let flattened = config.flattened_dim();
        let fc_mu = linear(flattened, config.latent_dim, vb.pp("fc_mu"))?;
        let fc_var = linear(flattened, config.latent_dim, vb.pp("fc_var"))?;
        let decoder_input = linear(config.latent_dim, flattened, vb.pp("decoder_input"))?;

        let reversed: Vec<usize> = config.hidden_dims.iter().rev().copied().collect();
        let mut decoder = Vec::with_capacity(reversed.len().saturating_sub(1));
        for idx in 0..reversed.len() - 1 {
            let block = UpBlock::new(
                reversed[idx],
                reversed[idx + 1],
                vb.pp("decoder").pp(format!("stage{idx}")),
            )?;
            decoder.push(block);
        }

        let narrowest = *reversed.last().expect("hidden_dims validated non-empty");
        let output = OutputBlock::new(narrowest, config.in_channels, vb.pp("output"))?;

        Ok(Self {
            config,
            varmap,
            encoder,
            fc_mu,
            fc_var,
            decoder_input,
            decoder,
            output,
        })
    }

    pub fn config(&self) -> &VaeConfig {
        &self.config
    }

    /// All learnable tensors plus batch-norm running statistics, sorted by
    /// name so optimizer and checkpoint orderings are deterministic.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().expect("varmap lock poisoned");
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    fn check_input(&self, images: &Tensor) -> Result<()> {
        let dims = images.dims();
        if dims.len() != 4 {
            return Err(Error::Msg(format!(
                "expected images shaped [batch, channels, height, width], got {dims:?}"
            )));
        }
        let expected = [
            self.config.in_channels,
            self.config.image_size,
            self.config.image_size,
        ];
        if dims[1..] != expected {
            return Err(Error::Msg(format!(
                "image batch shape {:?} does not match configured [{}, {}, {}]; no implicit resizing",
                dims, expected[0], expected[1], expected[2]
            )));
        }
        Ok(())
    }

    /// `z = mu + exp(0.5 * log_var) * eps` for caller-supplied noise. The
    /// algebraic form is load-bearing: it keeps the sample differentiable
    /// with respect to `mu` and `log_var`.
    pub fn reparameterize_with(mu: &Tensor, log_var: &Tensor, eps: &Tensor) -> Result<Tensor> {
        let std = log_var.affine(0.5, 0.0)?.exp()?;
        let scaled = (eps * &std)?;
        scaled + mu
    }

    /// Draws fresh standard-Gaussian noise and reparameterizes.
    pub fn reparameterize(&self, mu: &Tensor, log_var: &Tensor) -> Result<Tensor> {
        let eps = mu.randn_like(0.0, 1.0)?;
        Self::reparameterize_with(mu, log_var, &eps)
    }
}

impl GenerativeModel for VanillaVae {
    fn encode(&self, images: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        self.check_input(images)?;
        let mut xs = images.clone();
        for block in &self.encoder {
            xs = block.forward(&xs, train)?;
        }
        let flat = xs.flatten_from(1)?;
        let mu = self.fc_mu.forward(&flat)?;
        let log_var = self.fc_var.forward(&flat)?;
        Ok((mu, log_var))
    }

    fn decode(&self, z: &Tensor, train: bool) -> Result<Tensor> {
        let dims = z.dims();
        if dims.len() != 2 || dims[1] != self.config.latent_dim {
            return Err(Error::Msg(format!(
                "expected latents shaped [batch, {}], got {dims:?}",
                self.config.latent_dim
            )));
        }
        let batch = dims[0];
        let side = self.config.bottleneck_size();
        let channels = *self
            .config
            .hidden_dims
            .last()
            .expect("hidden_dims validated non-empty");

        let mut xs = self
            .decoder_input
            .forward(z)?
            .reshape((batch, channels, side, side))?;
        for block in &self.decoder {
            xs = block.forward(&xs, train)?;
        }
        self.output.forward(&xs, train)
    }

    fn forward(&self, images: &Tensor, train: bool) -> Result<VaeOutput> {
        let (mu, log_var) = self.encode(images, train)?;
        let z = self.reparameterize(&mu, &log_var)?;
        let reconstruction = self.decode(&z, train)?;
        Ok(VaeOutput {
            reconstruction,
            input: images.clone(),
            mu,
            log_var,
        })
    }

    fn loss(&self, output: &VaeOutput, kld_weight: f64) -> Result<LossOutput> {
        let reconstruction = loss::mse(&output.reconstruction, &output.input)?;

        // Exact KL(N(mu, exp(log_var)) || N(0, I)) for diagonal Gaussians:
        // sum over latent dims first, then mean over the batch. kld_weight
        // is calibrated against this scale, so the order is not negotiable.
        let inner = ((output.log_var.affine(1.0, 1.0)? - output.mu.sqr()?)?
            - output.log_var.exp()?)?;
        let kld = inner.sum(1)?.affine(-0.5, 0.0)?.mean_all()?;

        let total = (&reconstruction + kld.affine(kld_weight, 0.0)?)?;
        let record = LossRecord {
            total: total.to_vec0::<f32>()?,
            reconstruction: reconstruction.to_vec0::<f32>()?,
            kld: kld.to_vec0::<f32>()?,
        };
        Ok(LossOutput { total, record })
    }

    fn sample_prior(&self, count: usize) -> Result<Tensor> {
        if count == 0 {
            return Err(Error::Msg("sample_prior requires count > 0".into()));
        }
        let z = Tensor::randn(
            0f32,
            1f32,
            (count, self.config.latent_dim),
            &self.config.device,
        )?;
        self.decode(&z, false)
    }
}
