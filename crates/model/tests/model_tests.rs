use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{GenerativeModel, VaeConfig, VaeOutput, VanillaVae};

fn build_config() -> VaeConfig {
    VaeConfig {
        in_channels: 3,
        latent_dim: 8,
        hidden_dims: vec![8, 16],
        image_size: 16,
        dtype: DType::F32,
        device: Device::Cpu,
    }
}

#[test]
fn forward_preserves_input_shape() -> Result<()> {
    let model = VanillaVae::new(build_config())?;
    let images = Tensor::zeros((2, 3, 16, 16), DType::F32, &Device::Cpu)?;

    let output = model.forward(&images, true)?;

    assert_eq!(output.reconstruction.dims(), images.dims());
    assert_eq!(output.mu.dims(), &[2, 8]);
    assert_eq!(output.log_var.dims(), &[2, 8]);
    Ok(())
}

#[test]
fn encode_sample_decode_round_trips_shape() -> Result<()> {
    let model = VanillaVae::new(build_config())?;
    let images = Tensor::randn(0f32, 1f32, (4, 3, 16, 16), &Device::Cpu)?;

    let (mu, log_var) = model.encode(&images, false)?;
    let z = model.reparameterize(&mu, &log_var)?;
    let decoded = model.decode(&z, false)?;

    assert_eq!(z.dims(), &[4, 8]);
    assert_eq!(decoded.dims(), images.dims());
    Ok(())
}

#[test]
fn reparameterization_is_deterministic_for_fixed_noise() -> Result<()> {
    let mu = Tensor::from_slice(&[0.5f32, -1.0, 2.0], (1, 3), &Device::Cpu)?;
    let log_var = Tensor::from_slice(&[0.0f32, 1.0, -2.0], (1, 3), &Device::Cpu)?;
    let eps = Tensor::from_slice(&[1.0f32, -0.5, 0.25], (1, 3), &Device::Cpu)?;

    let a = VanillaVae::reparameterize_with(&mu, &log_var, &eps)?.to_vec2::<f32>()?;
    let b = VanillaVae::reparameterize_with(&mu, &log_var, &eps)?.to_vec2::<f32>()?;
    assert_eq!(a, b);

    let expected: Vec<f32> = vec![
        0.5 + (0.5f32 * 0.0).exp() * 1.0,
        -1.0 + (0.5f32 * 1.0).exp() * -0.5,
        2.0 + (0.5f32 * -2.0).exp() * 0.25,
    ];
    for (got, want) in a[0].iter().zip(expected.iter()) {
        assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
    }
    Ok(())
}

fn loss_fixture(model: &VanillaVae, mu: Tensor, log_var: Tensor) -> Result<model::LossOutput> {
    let batch = mu.dims()[0];
    let reconstruction = Tensor::zeros((batch, 3, 16, 16), DType::F32, &Device::Cpu)?;
    let input = reconstruction.affine(1.0, 0.5)?;
    let output = VaeOutput {
        reconstruction,
        input,
        mu,
        log_var,
    };
    Ok(model.loss(&output, 1.0)?)
}

#[test]
fn kld_is_zero_exactly_at_the_standard_gaussian() -> Result<()> {
    let model = VanillaVae::new(build_config())?;
    let mu = Tensor::zeros((2, 8), DType::F32, &Device::Cpu)?;
    let log_var = Tensor::zeros((2, 8), DType::F32, &Device::Cpu)?;

    let loss = loss_fixture(&model, mu, log_var)?;
    assert_eq!(loss.record.kld, 0.0);

    let shifted = Tensor::ones((2, 8), DType::F32, &Device::Cpu)?;
    let log_var = Tensor::zeros((2, 8), DType::F32, &Device::Cpu)?;
    let loss = loss_fixture(&model, shifted, log_var)?;
    assert!(loss.record.kld > 0.0);
    Ok(())
}

#[test]
fn kld_is_non_negative() -> Result<()> {
    let model = VanillaVae::new(build_config())?;
    for seed in 0..4u64 {
        Device::Cpu.set_seed(seed)?;
        let mu = Tensor::randn(0f32, 3f32, (5, 8), &Device::Cpu)?;
        let log_var = Tensor::randn(0f32, 2f32, (5, 8), &Device::Cpu)?;
        let loss = loss_fixture(&model, mu, log_var)?;
        assert!(loss.record.kld >= 0.0, "kld {} at seed {seed}", loss.record.kld);
    }
    Ok(())
}

#[test]
fn kld_sums_latent_dims_then_averages_the_batch() -> Result<()> {
    let model = VanillaVae::new(build_config())?;
    // Sample A: mu = 1 in every dim contributes -0.5 * sum(1 - 1 - 1) = 0.5/dim.
    // Sample B: standard Gaussian contributes 0. Batch mean = dim * 0.5 / 2.
    let mut mu = vec![1.0f32; 8];
    mu.extend(std::iter::repeat(0.0f32).take(8));
    let mu = Tensor::from_vec(mu, (2, 8), &Device::Cpu)?;
    let log_var = Tensor::zeros((2, 8), DType::F32, &Device::Cpu)?;

    let loss = loss_fixture(&model, mu, log_var)?;
    let expected = 8.0 * 0.5 / 2.0;
    assert!(
        (loss.record.kld - expected).abs() < 1e-5,
        "kld {} expected {expected}",
        loss.record.kld
    );
    Ok(())
}

#[test]
fn total_is_reconstruction_plus_weighted_kld() -> Result<()> {
    let model = VanillaVae::new(build_config())?;
    let images = Tensor::randn(0f32, 0.5f32, (3, 3, 16, 16), &Device::Cpu)?;
    let output = model.forward(&images, true)?;

    for weight in [0.0f64, 0.25, 1.0, 4.0] {
        let loss = model.loss(&output, weight)?;
        let expected = loss.record.reconstruction + weight as f32 * loss.record.kld;
        assert!(
            (loss.record.total - expected).abs() < 1e-5,
            "weight {weight}: total {} expected {expected}",
            loss.record.total
        );
        assert!(loss.record.reconstruction >= 0.0);
        assert!(loss.record.kld >= 0.0);
    }
    Ok(())
}

#[test]
fn sample_prior_is_reproducible_under_a_fixed_seed() -> Result<()> {
    let model = VanillaVae::new(build_config())?;

    Device::Cpu.set_seed(7)?;
    let first = model.sample_prior(2)?;
    Device::Cpu.set_seed(7)?;
    let second = model.sample_prior(2)?;
    Device::Cpu.set_seed(8)?;
    let third = model.sample_prior(2)?;

    assert_eq!(first.dims(), &[2, 3, 16, 16]);
    assert_eq!(first.dims(), third.dims());

    let a = first.flatten_all()?.to_vec1::<f32>()?;
    let b = second.flatten_all()?.to_vec1::<f32>()?;
    let c = third.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(a, b);
    assert_ne!(a, c);
    Ok(())
}

#[test]
fn malformed_input_shape_is_a_structural_error() -> Result<()> {
    let model = VanillaVae::new(build_config())?;

    let wrong_spatial = Tensor::zeros((2, 3, 8, 8), DType::F32, &Device::Cpu)?;
    assert!(model.encode(&wrong_spatial, false).is_err());

    let wrong_channels = Tensor::zeros((2, 1, 16, 16), DType::F32, &Device::Cpu)?;
    assert!(model.encode(&wrong_channels, false).is_err());

    let wrong_rank = Tensor::zeros((3, 16, 16), DType::F32, &Device::Cpu)?;
    assert!(model.encode(&wrong_rank, false).is_err());

    let wrong_latent = Tensor::zeros((2, 9), DType::F32, &Device::Cpu)?;
    assert!(model.decode(&wrong_latent, false).is_err());
    Ok(())
}

#[test]
fn full_resolution_forward_matches_the_reference_scenario() -> Result<()> {
    let config = VaeConfig::new(3, 128, Device::Cpu);
    let model = VanillaVae::new(config)?;
    let images = Tensor::randn(0f32, 0.5f32, (8, 3, 64, 64), &Device::Cpu)?.clamp(-1.0, 1.0)?;

    let output = model.forward(&images, true)?;
    assert_eq!(output.reconstruction.dims(), &[8, 3, 64, 64]);

    let loss = model.loss(&output, 0.00025)?;
    assert!(loss.record.reconstruction >= 0.0);
    assert!(loss.record.kld >= 0.0);
    let expected = loss.record.reconstruction + 0.00025 * loss.record.kld;
    assert!((loss.record.total - expected).abs() < 1e-5);
    Ok(())
}
