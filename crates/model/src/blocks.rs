use candle_core::{Result, Tensor};
use candle_nn::{
    batch_norm, conv2d, conv_transpose2d, ops, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig,
    ConvTranspose2d, ConvTranspose2dConfig, Module, ModuleT, VarBuilder,
};

const LEAKY_SLOPE: f64 = 0.01;

/// One encoder stage: a stride-2 3x3 convolution halving the spatial
/// resolution, batch normalization, and a leaky ReLU.
#[derive(Debug)]
pub struct DownBlock {
    conv: Conv2d,
    norm: BatchNorm,
}

impl DownBlock {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv = conv2d(in_channels, out_channels, 3, cfg, vb.pp("conv"))?;
        let norm = batch_norm(out_channels, BatchNormConfig::default(), vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = self.norm.forward_t(&xs, train)?;
        ops::leaky_relu(&xs, LEAKY_SLOPE)
    }
}

/// One decoder stage: a stride-2 3x3 transpose convolution doubling the
/// spatial resolution, batch normalization, and a leaky ReLU. Mirrors
/// [`DownBlock`].
#[derive(Debug)]
pub struct UpBlock {
    conv: ConvTranspose2d,
    norm: BatchNorm,
}

impl UpBlock {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = ConvTranspose2dConfig {
            padding: 1,
            output_padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv = conv_transpose2d(in_channels, out_channels, 3, cfg, vb.pp("conv"))?;
        let norm = batch_norm(out_channels, BatchNormConfig::default(), vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = self.norm.forward_t(&xs, train)?;
        ops::leaky_relu(&xs, LEAKY_SLOPE)
    }
}

/// Final decoder block: one more upsampling stage back to the input
/// resolution, then a 3x3 projection to the image channel count and a tanh
/// so pixel values land in [-1, 1].
#[derive(Debug)]
pub struct OutputBlock {
    upsample: UpBlock,
    proj: Conv2d,
}

impl OutputBlock {
    pub fn new(channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let upsample = UpBlock::new(channels, channels, vb.pp("upsample"))?;
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let proj = conv2d(channels, out_channels, 3, cfg, vb.pp("proj"))?;
        Ok(Self { upsample, proj })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.upsample.forward(xs, train)?;
        self.proj.forward(&xs)?.tanh()
    }
}
