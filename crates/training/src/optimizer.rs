use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{config::OptimizerSection, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    pub lr_decay: f64,
}

impl From<&OptimizerSection> for AdamConfig {
    fn from(value: &OptimizerSection) -> Self {
        Self {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
            lr_decay: value.lr_decay,
        }
    }
}

/// Bias-corrected Adam over a fixed parameter list, with a multiplicative
/// learning-rate decay applied once per epoch via [`AdamOptimizer::decay`].
/// Nothing else is allowed to touch the learning rate.
#[derive(Debug)]
pub struct AdamOptimizer {
    config: AdamConfig,
    learning_rate: f64,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl AdamOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            learning_rate: config.learning_rate,
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Multiply the learning rate by the configured decay factor. Called
    /// exactly once at the end of each training epoch.
    pub fn decay(&mut self) {
        self.learning_rate *= self.config.lr_decay;
    }

    /// Apply one Adam update from the gradients in `grads`. Parameters
    /// without a gradient (batch-norm running statistics live in the same
    /// parameter map but never receive one) are left untouched. Returns the
    /// global L2 norm of the applied gradients.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<f64, TrainingError> {
        let mut processed = Vec::new();
        let mut total_norm_sq = 0.0f64;

        for (idx, slot) in self.params.iter().enumerate() {
            let tensor = slot.param.as_tensor();
            let grad = match grads.remove(tensor) {
                Some(grad) => grad,
                None => continue,
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let norm = tensor_l2_norm(&grad)?;
            total_norm_sq += norm * norm;
            processed.push((idx, grad));
        }

        if processed.is_empty() {
            return Ok(0.0);
        }

        self.step += 1;
        let bias_correction1 = 1.0 - self.config.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - self.config.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;
        let lr = self.learning_rate;

        for (idx, grad) in processed {
            let slot = &mut self.params[idx];

            let prev_m = slot
                .first_moment
                .affine(beta1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = grad.affine(1.0 - beta1, 0.0).map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let grad_sq = grad.sqr().map_err(to_runtime_error)?;
            let prev_v = slot
                .second_moment
                .affine(beta2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad_sq.affine(1.0 - beta2, 0.0).map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, self.config.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(lr, 0.0)
                .map_err(to_runtime_error)?;

            let base = slot.param.as_tensor().clone();
            let decayed = if self.config.weight_decay != 0.0 {
                base.affine(1.0 - lr * self.config.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(total_norm_sq.sqrt())
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?;
    let value = squared.to_vec0::<f32>().map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
