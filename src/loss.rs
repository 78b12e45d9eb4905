use candle_core::{DType, Tensor};

use crate::TrainingError;

/// Mean squared error between predicted rewards and target scores.
#[derive(Debug, Clone, Default)]
pub struct MeanSquaredError;

impl MeanSquaredError {
    pub fn compute(
        &self,
        predictions: &Tensor,
        targets: &Tensor,
    ) -> Result<LossOutput, TrainingError> {
        if predictions.dims() != targets.dims() {
            return Err(TrainingError::runtime(format!(
                "prediction shape {:?} must match target shape {:?}",
                predictions.dims(),
                targets.dims()
            )));
        }
        if predictions.elem_count() == 0 {
            return Err(TrainingError::runtime(
                "no examples available for loss computation",
            ));
        }

        let targets = targets
            .to_dtype(predictions.dtype())
            .map_err(to_runtime_error)?;
        let loss = predictions
            .sub(&targets)
            .map_err(to_runtime_error)?
            .sqr()
            .map_err(to_runtime_error)?
            .mean_all()
            .map_err(to_runtime_error)?;

        let value = loss
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?;

        Ok(LossOutput { loss, value })
    }
}

/// The loss tensor (kept for backward) together with its scalar value.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub value: f32,
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn computes_mean_of_squared_differences() {
        let device = Device::Cpu;
        let predictions = Tensor::from_slice(&[1.0f32, 2.0], (2,), &device).unwrap();
        let targets = Tensor::from_slice(&[0.0f32, 4.0], (2,), &device).unwrap();

        let output = MeanSquaredError.compute(&predictions, &targets).unwrap();
        assert!((output.value - 2.5).abs() < 1e-6);
    }

    #[test]
    fn rejects_shape_mismatch() {
        let device = Device::Cpu;
        let predictions = Tensor::from_slice(&[1.0f32, 2.0], (2,), &device).unwrap();
        let targets = Tensor::from_slice(&[0.0f32], (1,), &device).unwrap();
        assert!(MeanSquaredError.compute(&predictions, &targets).is_err());
    }
}
