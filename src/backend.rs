use candle_core::{DType, Tensor};

use crate::{
    config::RewardConfig,
    loss::MeanSquaredError,
    model::RewardModel,
    optimizer::{
        scaler::contains_non_finite, AdamWConfig, GradientScaler, GradientScalerState,
        OptimizerState, RewardOptimizer,
    },
    scheduler::{CosineWarmRestarts, LRScheduler, SchedulerState},
    TrainingError,
};

/// Result of one training step: the scalar loss plus the predicted rewards
/// for progress reporting.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: f32,
    pub predictions: Vec<f32>,
}

/// Engine-owned execution path: forward/backward/step delegated entirely to
/// the engine, which runs its own optimizer and learning-rate handling and
/// reports its own micro-batch size.
pub struct FusedEngine {
    optimizer: RewardOptimizer,
    micro_batch_size: usize,
}

impl FusedEngine {
    pub fn new(
        named_parameters: Vec<(String, candle_core::Var)>,
        config: AdamWConfig,
        micro_batch_size: usize,
    ) -> Result<Self, TrainingError> {
        Ok(Self {
            optimizer: RewardOptimizer::new(named_parameters, config)?,
            micro_batch_size: micro_batch_size.max(1),
        })
    }

    pub fn micro_batch_size(&self) -> usize {
        self.micro_batch_size
    }

    fn train_step(&mut self, loss: &Tensor) -> Result<(), TrainingError> {
        // Each backward pass yields a fresh gradient tape; the engine owns
        // both the clearing and the update.
        let mut grads = loss.backward().map_err(to_runtime_error)?;
        self.optimizer.step(&mut grads)
    }
}

/// The three mutually exclusive execution strategies, fixed at construction.
/// The orchestrator never branches on the variant outside this module.
pub enum ExecutionBackend {
    Plain {
        optimizer: RewardOptimizer,
        scheduler: Box<dyn LRScheduler>,
    },
    Amp {
        optimizer: RewardOptimizer,
        scheduler: Box<dyn LRScheduler>,
        scaler: GradientScaler,
    },
    Fused {
        engine: FusedEngine,
    },
}

impl ExecutionBackend {
    /// Selects the variant from the configuration flags. Precedence when
    /// several are enabled: fused engine, then the loss-scaling layer, then
    /// the plain path.
    pub fn select(
        config: &RewardConfig,
        model: &RewardModel,
        steps_per_epoch: usize,
    ) -> Result<Self, TrainingError> {
        let adamw = AdamWConfig::from(&config.optimizer);
        let named_parameters = model.parameters();

        if config.backend.engine_enable {
            let engine = FusedEngine::new(named_parameters, adamw, config.data.batch_size)?;
            return Ok(Self::Fused { engine });
        }

        let optimizer = RewardOptimizer::new(named_parameters, adamw)?;
        let min_lr = adamw.learning_rate * config.scheduler.min_lr_ratio;
        let scheduler: Box<dyn LRScheduler> = Box::new(CosineWarmRestarts::new(
            adamw.learning_rate,
            min_lr,
            steps_per_epoch,
        )?);

        if config.backend.amp_enable {
            Ok(Self::Amp {
                optimizer,
                scheduler,
                scaler: GradientScaler::new(),
            })
        } else {
            Ok(Self::Plain {
                optimizer,
                scheduler,
            })
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain { .. } => "plain",
            Self::Amp { .. } => "amp",
            Self::Fused { .. } => "fused",
        }
    }

    /// The batch size actually used for grouping; the fused engine reports
    /// its own.
    pub fn effective_batch_size(&self, configured: usize) -> usize {
        match self {
            Self::Fused { engine } => engine.micro_batch_size(),
            _ => configured,
        }
    }

    /// One optimization step: predicted rewards, MSE against the targets,
    /// then the variant-specific backward/step path.
    pub fn train_step(
        &mut self,
        model: &RewardModel,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        targets: &Tensor,
    ) -> Result<StepOutput, TrainingError> {
        let predictions = model.get_reward(input_ids, attention_mask)?;
        let output = MeanSquaredError.compute(&predictions, targets)?;
        let predicted_values = predictions
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?
            .to_vec1::<f32>()
            .map_err(to_runtime_error)?;

        match self {
            Self::Plain {
                optimizer,
                scheduler,
            } => {
                let mut grads = output.loss.backward().map_err(to_runtime_error)?;
                optimizer.step(&mut grads)?;
                let lr = scheduler.step();
                optimizer.set_learning_rate(lr);
            }
            Self::Amp {
                optimizer,
                scheduler,
                scaler,
            } => {
                let scaled = scaler.scale(&output.loss)?;
                let mut grads = scaled.backward().map_err(to_runtime_error)?;

                let mut found_inf = false;
                for tensor in optimizer.parameter_tensors() {
                    if let Some(grad) = grads.remove(tensor) {
                        let unscaled = scaler.unscale(&grad)?;
                        if !found_inf && contains_non_finite(&unscaled)? {
                            found_inf = true;
                        }
                        grads.insert(tensor, unscaled);
                    }
                }

                scaler.update(found_inf);
                if found_inf {
                    // Overflowed step: drop the gradients and let the scaler
                    // back off.
                    optimizer.zero_grad(&mut grads);
                } else {
                    optimizer.step(&mut grads)?;
                }
                let lr = scheduler.step();
                optimizer.set_learning_rate(lr);
            }
            Self::Fused { engine } => {
                engine.train_step(&output.loss)?;
            }
        }

        Ok(StepOutput {
            loss: output.value,
            predictions: predicted_values,
        })
    }

    pub fn optimizer_state(&self) -> Result<OptimizerState, TrainingError> {
        match self {
            Self::Plain { optimizer, .. } | Self::Amp { optimizer, .. } => optimizer.state(),
            Self::Fused { engine } => engine.optimizer.state(),
        }
    }

    pub fn load_optimizer_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        match self {
            Self::Plain { optimizer, .. } | Self::Amp { optimizer, .. } => {
                optimizer.load_state(state)
            }
            Self::Fused { engine } => engine.optimizer.load_state(state),
        }
    }

    pub fn scheduler_snapshot(&self) -> Option<SchedulerState> {
        match self {
            Self::Plain { scheduler, .. } | Self::Amp { scheduler, .. } => {
                Some(scheduler.snapshot())
            }
            Self::Fused { .. } => None,
        }
    }

    pub fn load_scheduler_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        match self {
            Self::Plain {
                optimizer,
                scheduler,
            }
            | Self::Amp {
                optimizer,
                scheduler,
                ..
            } => {
                scheduler.load_snapshot(state)?;
                optimizer.set_learning_rate(scheduler.learning_rate());
                Ok(())
            }
            Self::Fused { .. } => Err(TrainingError::runtime(
                "checkpoint includes scheduler state but the fused engine manages its own",
            )),
        }
    }

    pub fn scaler_state(&self) -> Option<GradientScalerState> {
        match self {
            Self::Amp { scaler, .. } => Some(scaler.state()),
            _ => None,
        }
    }

    pub fn load_scaler_state(&mut self, state: GradientScalerState) -> Result<(), TrainingError> {
        match self {
            Self::Amp { scaler, .. } => {
                scaler.load_state(state);
                Ok(())
            }
            _ => Err(TrainingError::runtime(
                "checkpoint contains loss-scaler state but the selected backend has none",
            )),
        }
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
