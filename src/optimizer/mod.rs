use std::collections::HashMap;

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config::OptimizerSettings, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&OptimizerSettings> for AdamWConfig {
    fn from(value: &OptimizerSettings) -> Self {
        Self {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        }
    }
}

/// Decoupled-weight-decay Adam over named variables, with a serializable
/// state for checkpointing.
#[derive(Debug)]
pub struct RewardOptimizer {
    config: AdamWConfig,
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

impl RewardOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
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
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn parameter_tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.params.iter().map(|slot| slot.param.as_tensor())
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        self.step += 1;
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
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

        for slot in &mut self.params {
            let grad = match grads.remove(slot.param.as_tensor()) {
                Some(grad) => grad,
                None => continue,
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;

            let prev_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let grad_sq = grad.sqr().map_err(to_runtime_error)?;
            let prev_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad_sq
                .affine(1.0 - cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let dtype = slot.param.as_tensor().dtype();
            let base = slot
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            let decayed = if cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            let next = if dtype == DType::F32 {
                next
            } else {
                next.to_dtype(dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    /// Drops any pending gradients for the tracked parameters.
    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.step = state.step;
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            if slot.param.as_tensor().dims() != state.shape.as_slice() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let expected = numel(&state.shape);
            if expected != state.first_moment.len() || expected != state.second_moment.len() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device().clone();
            slot.first_moment = Tensor::from_vec(state.first_moment, expected, &device)
                .map_err(to_runtime_error)?
                .reshape(slot.param.as_tensor().dims())
                .map_err(to_runtime_error)?;
            slot.second_moment = Tensor::from_vec(state.second_moment, expected, &device)
                .map_err(to_runtime_error)?
                .reshape(slot.param.as_tensor().dims())
                .map_err(to_runtime_error)?;
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn single_param() -> Vec<(String, Var)> {
        let tensor = Tensor::from_slice(&[1.0f32, 2.0], (2,), &Device::Cpu).unwrap();
        vec![("weight".to_string(), Var::from_tensor(&tensor).unwrap())]
    }

    fn config() -> AdamWConfig {
        AdamWConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.95,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }

    #[test]
    fn rejects_empty_parameter_list() {
        assert!(RewardOptimizer::new(Vec::new(), config()).is_err());
    }

    #[test]
    fn step_moves_parameters_against_the_gradient() {
        let params = single_param();
        let var = params[0].1.clone();
        let mut optimizer = RewardOptimizer::new(params, config()).unwrap();

        let x = var.as_tensor().clone();
        let loss = x.sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        let updated = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!(updated[0] < 1.0);
        assert!(updated[1] < 2.0);
    }

    #[test]
    fn state_round_trips_through_json() {
        let params = single_param();
        let var = params[0].1.clone();
        let mut optimizer = RewardOptimizer::new(params, config()).unwrap();

        let loss = var.as_tensor().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();

        let state = optimizer.state().unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let restored: OptimizerState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.step, 1);
        assert_eq!(restored.parameters[0].first_moment, state.parameters[0].first_moment);

        let tensor = Tensor::from_slice(&[0.0f32, 0.0], (2,), &Device::Cpu).unwrap();
        let fresh_params = vec![("weight".to_string(), Var::from_tensor(&tensor).unwrap())];
        let mut fresh = RewardOptimizer::new(fresh_params, config()).unwrap();
        fresh.load_state(restored).unwrap();
        let reloaded = fresh.state().unwrap();
        assert_eq!(reloaded.step, state.step);
        assert_eq!(
            reloaded.parameters[0].second_moment,
            state.parameters[0].second_moment
        );
    }

    #[test]
    fn load_state_rejects_unknown_parameters() {
        let mut optimizer = RewardOptimizer::new(single_param(), config()).unwrap();
        let state = OptimizerState {
            step: 1,
            parameters: vec![ParameterState {
                name: "other".to_string(),
                shape: vec![2],
                first_moment: vec![0.0, 0.0],
                second_moment: vec![0.0, 0.0],
            }],
        };
        assert!(optimizer.load_state(state).is_err());
    }
}
