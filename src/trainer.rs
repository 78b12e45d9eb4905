use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::{
    backend::{ExecutionBackend, StepOutput},
    checkpoint::{CheckpointStore, ProgressSnapshot},
    config::RewardConfig,
    data::{num_batches, BatchSource, PromptTokenizer, RewardBatch},
    dataset::RewardDataset,
    logging::{Logger, LoggingSettings},
    loss::MeanSquaredError,
    model::{RewardModel, SequenceEncoder},
    stats::TrainingStats,
    TrainingError,
};

/// Top-level training orchestrator: resumable epoch loop over the training
/// set with optional read-only validation passes, driving exactly one
/// execution backend selected at construction.
pub struct RewardTrainer {
    config: RewardConfig,
    device: Device,
    model: RewardModel,
    tokenizer: Box<dyn PromptTokenizer>,
    train_dataset: Arc<RewardDataset>,
    validation_dataset: Option<Arc<RewardDataset>>,
    backend: ExecutionBackend,
    checkpoints: CheckpointStore,
    stats: TrainingStats,
    logger: Logger,
}

impl RewardTrainer {
    pub fn new(
        config: RewardConfig,
        encoder: Box<dyn SequenceEncoder>,
        tokenizer: Box<dyn PromptTokenizer>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        let device = config.device()?;
        let model = RewardModel::new(
            encoder,
            config.model.max_sequence_length,
            config.runtime.seed,
            &device,
            config.runtime.debug,
        )?;

        let train_dataset = Arc::new(RewardDataset::from_path(&config.data.train_dataset_path)?);
        if train_dataset.is_empty() {
            return Err(TrainingError::initialization(format!(
                "training dataset {} contains no samples",
                config.data.train_dataset_path.display()
            )));
        }
        let validation_dataset = match config.data.validation_dataset_path.as_ref() {
            Some(path) => Some(Arc::new(RewardDataset::from_path(path)?)),
            None => None,
        };

        let steps_per_epoch = num_batches(train_dataset.len(), config.data.batch_size).max(1);
        let backend = ExecutionBackend::select(&config, &model, steps_per_epoch)?;

        let checkpoints =
            CheckpointStore::new(&config.runtime.checkpoint_dir, config.runtime.max_keep);
        let logger = Logger::new(LoggingSettings {
            enable_stdout: config.runtime.enable_stdout,
            stats_path: config.runtime.stats_path.clone(),
        })?;

        Ok(Self {
            config,
            device,
            model,
            tokenizer,
            train_dataset,
            validation_dataset,
            backend,
            checkpoints,
            stats: TrainingStats::default(),
            logger,
        })
    }

    pub fn config(&self) -> &RewardConfig {
        &self.config
    }

    pub fn model(&self) -> &RewardModel {
        &self.model
    }

    pub fn stats(&self) -> &TrainingStats {
        &self.stats
    }

    /// Runs training to completion, resuming from the latest checkpoint when
    /// one exists. Nothing inside the loop is retried: the first failure
    /// aborts the run.
    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.logger.info(&format!(
            "starting reward model training ({} backend)",
            self.backend.name()
        ));

        let epochs = self.config.runtime.epochs;
        let iteration_per_print = self.config.runtime.iteration_per_print;
        let checkpoint_steps = self.config.runtime.checkpoint_steps;
        let batch_size = self
            .backend
            .effective_batch_size(self.config.data.batch_size);
        let steps_per_epoch = num_batches(self.train_dataset.len(), batch_size);

        let (start_epoch, mut start_step) = self.resume()?;

        // Checkpoint cadence counter; spans epoch boundaries by design.
        let mut processed: usize = 0;

        for epoch in start_epoch..epochs {
            let dataset = Arc::clone(&self.train_dataset);
            for batch in BatchSource::new(&dataset, batch_size) {
                // Skip work already covered by the checkpoint we resumed from.
                if batch.index < start_step {
                    continue;
                }

                let output = self.train_batch(&batch)?;
                let record = self.stats.push_training(output.loss);
                self.logger.record(&record);

                if batch.index % iteration_per_print == 0 {
                    self.logger.log_training_step(
                        epoch,
                        epochs,
                        batch.index,
                        steps_per_epoch,
                        output.loss,
                        &output.predictions,
                        &batch.scores,
                    );
                }

                processed += 1;
                if processed % checkpoint_steps == 0 {
                    self.save_checkpoint(epoch, batch.index + 1, epochs, steps_per_epoch)?;
                }
            }

            if self.validation_dataset.is_some() {
                self.validate_epoch(epoch, epochs, batch_size)?;
            }

            start_step = 0;
        }

        self.save_checkpoint(epochs, 0, epochs, steps_per_epoch)?;
        self.logger.flush();
        self.logger.info("reward model training finished");
        Ok(())
    }

    /// Read-only pass over the validation set; returns the mean loss.
    pub fn validate(&mut self) -> Result<f64, TrainingError> {
        let epochs = self.config.runtime.epochs;
        let batch_size = self
            .backend
            .effective_batch_size(self.config.data.batch_size);
        self.validate_epoch(0, epochs, batch_size)
    }

    fn resume(&mut self) -> Result<(usize, usize), TrainingError> {
        match self.checkpoints.load_latest(&self.model, &mut self.backend)? {
            Some(point) => {
                self.stats.restore(point.stats);
                self.logger.info(&format!(
                    "resuming from checkpoint at epoch {} step {}",
                    point.epoch, point.step
                ));
                Ok((point.epoch, point.step))
            }
            None => Ok((0, 0)),
        }
    }

    fn train_batch(&mut self, batch: &RewardBatch) -> Result<StepOutput, TrainingError> {
        let encoded = self.tokenizer.tokenize(&batch.texts)?;
        let (input_ids, attention_mask) = encoded.to_device(&self.device)?;
        let targets = Tensor::from_slice(&batch.scores, batch.scores.len(), &self.device)
            .map_err(|err| {
                TrainingError::runtime(format!("failed to materialize target tensor: {}", err))
            })?;

        self.backend
            .train_step(&self.model, &input_ids, &attention_mask, &targets)
    }

    fn validate_epoch(
        &mut self,
        epoch: usize,
        total_epochs: usize,
        batch_size: usize,
    ) -> Result<f64, TrainingError> {
        let Some(dataset) = self.validation_dataset.as_ref().map(Arc::clone) else {
            return Err(TrainingError::initialization(
                "no validation dataset configured",
            ));
        };

        let iteration_per_print = self.config.runtime.iteration_per_print;
        let total_iterations = num_batches(dataset.len(), batch_size);
        let mut loss_sum = 0.0f64;
        let mut batches = 0usize;

        for batch in BatchSource::new(&dataset, batch_size) {
            let encoded = self.tokenizer.tokenize(&batch.texts)?;
            let (input_ids, attention_mask) = encoded.to_device(&self.device)?;
            let targets = Tensor::from_slice(&batch.scores, batch.scores.len(), &self.device)
                .map_err(|err| {
                    TrainingError::runtime(format!("failed to materialize target tensor: {}", err))
                })?;

            // Score and measure only; no backward pass, so weights and
            // optimizer state cannot drift.
            let predictions = self.model.get_reward(&input_ids, &attention_mask)?;
            let output = MeanSquaredError.compute(&predictions, &targets)?;

            let record = self.stats.push_validation(output.value);
            self.logger.record(&record);
            if batch.index % iteration_per_print == 0 {
                self.logger.log_validation_step(
                    epoch,
                    total_epochs,
                    batch.index,
                    total_iterations,
                    output.value,
                );
            }

            loss_sum += output.value as f64;
            batches += 1;
        }

        if batches == 0 {
            Ok(0.0)
        } else {
            Ok(loss_sum / batches as f64)
        }
    }

    fn save_checkpoint(
        &self,
        epoch: usize,
        step: usize,
        total_epochs: usize,
        steps_per_epoch: usize,
    ) -> Result<(), TrainingError> {
        let progress = ProgressSnapshot {
            epoch,
            step,
            total_epochs,
            steps_per_epoch,
        };
        let descriptor = self
            .checkpoints
            .save(&self.model, &self.backend, progress, &self.stats)?;
        self.logger.info(&format!(
            "checkpoint saved at {}",
            descriptor.directory.display()
        ));
        Ok(())
    }
}
