use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// Dynamic loss scaling: grow the scale after a stretch of stable steps,
/// back off when gradients overflow. This is the acceleration layer wrapped
/// around the standard optimizer.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    loss_scale: f32,
    stable_steps: usize,
    config: LossScaleConfig,
}

impl GradientScaler {
    pub fn new() -> Self {
        Self::with_config(LossScaleConfig::default())
    }

    pub fn with_config(config: LossScaleConfig) -> Self {
        let config = sanitize_config(config);
        Self {
            loss_scale: config.initial_scale,
            stable_steps: 0,
            config,
        }
    }

    pub fn loss_scale(&self) -> f32 {
        self.loss_scale
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        tensor
            .affine(self.loss_scale as f64, 0.0)
            .map_err(to_runtime_error)
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        let inv = 1.0 / self.loss_scale;
        tensor.affine(inv as f64, 0.0).map_err(to_runtime_error)
    }

    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.loss_scale =
                (self.loss_scale * self.config.backoff_factor).max(self.config.min_scale);
            self.stable_steps = 0;
        } else {
            self.stable_steps += 1;
            if self.stable_steps >= self.config.growth_interval {
                self.loss_scale =
                    (self.loss_scale * self.config.growth_factor).min(self.config.max_scale);
                self.stable_steps = 0;
            }
        }
    }

    pub fn state(&self) -> GradientScalerState {
        GradientScalerState {
            loss_scale: self.loss_scale,
            stable_steps: self.stable_steps,
        }
    }

    pub fn load_state(&mut self, state: GradientScalerState) {
        self.loss_scale = state
            .loss_scale
            .clamp(self.config.min_scale, self.config.max_scale);
        self.stable_steps = state.stable_steps;
    }
}

impl Default for GradientScaler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub loss_scale: f32,
    pub stable_steps: usize,
}

pub(crate) fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn tensor_from(data: &[f32]) -> Tensor {
        Tensor::from_slice(data, (data.len(),), &Device::Cpu).unwrap()
    }

    #[test]
    fn grows_after_interval() {
        let mut scaler = GradientScaler::with_config(LossScaleConfig {
            initial_scale: 512.0,
            growth_interval: 2,
            ..LossScaleConfig::default()
        });

        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 1024.0);
    }

    #[test]
    fn backs_off_on_infinite() {
        let mut scaler = GradientScaler::with_config(LossScaleConfig {
            initial_scale: 1024.0,
            backoff_factor: 0.25,
            ..LossScaleConfig::default()
        });

        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 256.0);
    }

    #[test]
    fn scale_then_unscale_is_identity() {
        let scaler = GradientScaler::new();
        let tensor = tensor_from(&[2.0, -4.0]);
        let roundtrip = scaler.unscale(&scaler.scale(&tensor).unwrap()).unwrap();
        let values = roundtrip.to_vec1::<f32>().unwrap();
        assert!((values[0] - 2.0).abs() < 1e-6);
        assert!((values[1] + 4.0).abs() < 1e-6);
    }

    #[test]
    fn detects_non_finite_gradients() {
        let finite = tensor_from(&[1.0, -3.0]);
        let overflow = tensor_from(&[f32::INFINITY]);
        assert!(!contains_non_finite(&finite).unwrap());
        assert!(contains_non_finite(&overflow).unwrap());
    }

    #[test]
    fn state_round_trips() {
        let mut scaler = GradientScaler::new();
        scaler.update(true);
        let state = scaler.state();

        let mut restored = GradientScaler::new();
        restored.load_state(state);
        assert_eq!(restored.loss_scale(), scaler.loss_scale());
    }
}
