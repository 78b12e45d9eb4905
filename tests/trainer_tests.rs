use std::{fs, path::Path};

use candle_core::Device;
use reward_trainer::{
    BatchSource, CheckpointStore, EmbeddingEncoder, ExecutionBackend, ProgressSnapshot,
    PromptTokenizer, RewardConfig, RewardDataset, RewardModel, RewardTrainer, StatRecord,
    TokenizedBatch, TrainingError, TrainingStats,
};

const VOCAB: u32 = 64;

/// Deterministic stand-in for the external tokenizer: one token per byte,
/// padded to the widest text in the batch.
struct ByteTokenizer {
    vocab_size: u32,
}

impl PromptTokenizer for ByteTokenizer {
    fn tokenize(&self, texts: &[String]) -> Result<TokenizedBatch, TrainingError> {
        let width = texts.iter().map(String::len).max().unwrap_or(0).max(1);
        let mut input_ids = Vec::with_capacity(texts.len());
        let mut attention_mask = Vec::with_capacity(texts.len());
        for text in texts {
            let mut ids: Vec<u32> = text.bytes().map(|b| u32::from(b) % self.vocab_size).collect();
            let mut mask = vec![1u32; ids.len()];
            ids.resize(width, 0);
            mask.resize(width, 0);
            input_ids.push(ids);
            attention_mask.push(mask);
        }
        Ok(TokenizedBatch {
            input_ids,
            attention_mask,
        })
    }
}

fn write_dataset(path: &Path, n: usize) {
    let records: Vec<String> = (0..n)
        .map(|i| {
            format!(
                r#"{{"user_input": "Q: example {}?", "completion": "answer", "score": {}.0}}"#,
                i,
                i % 2
            )
        })
        .collect();
    fs::write(path, format!("[{}]", records.join(","))).unwrap();
}

fn base_config(train_path: &Path, checkpoint_dir: &Path) -> RewardConfig {
    let mut config = RewardConfig::default();
    config.model.hidden_size = 8;
    config.model.max_sequence_length = 32;
    config.data.train_dataset_path = train_path.to_path_buf();
    config.data.batch_size = 2;
    config.optimizer.learning_rate = 1e-2;
    config.runtime.epochs = 1;
    config.runtime.checkpoint_dir = checkpoint_dir.to_path_buf();
    config.runtime.enable_stdout = false;
    config
}

fn build_trainer(config: RewardConfig) -> RewardTrainer {
    let device = Device::Cpu;
    let encoder = EmbeddingEncoder::new(
        VOCAB as usize,
        config.model.hidden_size,
        config.runtime.seed,
        &device,
    )
    .unwrap();
    RewardTrainer::new(
        config,
        Box::new(encoder),
        Box::new(ByteTokenizer { vocab_size: VOCAB }),
    )
    .unwrap()
}

fn build_model(seed: u64) -> RewardModel {
    let device = Device::Cpu;
    let encoder = EmbeddingEncoder::new(VOCAB as usize, 8, seed, &device).unwrap();
    RewardModel::new(Box::new(encoder), 32, seed, &device, false).unwrap()
}

fn param_values(model: &RewardModel) -> Vec<(String, Vec<f32>)> {
    let mut values: Vec<(String, Vec<f32>)> = model
        .parameters()
        .into_iter()
        .map(|(name, var)| {
            let flat = var
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap();
            (name, flat)
        })
        .collect();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    values
}

#[test]
fn end_to_end_two_sample_run() {
    let tmp = tempfile::tempdir().unwrap();
    let train_path = tmp.path().join("train.json");
    fs::write(
        &train_path,
        r#"[
            {"user_input": "Q: 2+2?", "completion": "4", "score": 1.0},
            {"user_input": "Q: 2+2?", "completion": "five", "score": 0.0}
        ]"#,
    )
    .unwrap();
    let checkpoint_dir = tmp.path().join("checkpoints");

    let mut trainer = build_trainer(base_config(&train_path, &checkpoint_dir));
    trainer.train().unwrap();

    // Exactly one optimization step, so exactly one training-loss record.
    assert_eq!(trainer.stats().len(), 1);
    assert!(matches!(
        trainer.stats().records()[0],
        StatRecord::Training { .. }
    ));

    // Exactly one checkpoint: the final snapshot with the epoch counter
    // advanced and the step reset.
    let entries: Vec<_> = fs::read_dir(&checkpoint_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .collect();
    assert_eq!(entries.len(), 1);

    let descriptor = CheckpointStore::new(&checkpoint_dir, None)
        .latest_descriptor()
        .unwrap()
        .expect("final checkpoint");
    assert_eq!(descriptor.manifest.progress.epoch, 1);
    assert_eq!(descriptor.manifest.progress.step, 0);
    assert_eq!(descriptor.manifest.stats.len(), 1);
}

#[test]
fn checkpoint_round_trip_restores_exact_state() {
    let tmp = tempfile::tempdir().unwrap();
    let checkpoint_dir = tmp.path().join("checkpoints");
    let train_path = tmp.path().join("train.json");
    write_dataset(&train_path, 4);
    let config = base_config(&train_path, &checkpoint_dir);

    let model = build_model(11);
    let mut backend = ExecutionBackend::select(&config, &model, 2).unwrap();

    // Make optimizer and scheduler state nontrivial before saving.
    let tokenizer = ByteTokenizer { vocab_size: VOCAB };
    let encoded = tokenizer
        .tokenize(&["hello world".to_string(), "goodbye".to_string()])
        .unwrap();
    let (ids, mask) = encoded.to_device(&Device::Cpu).unwrap();
    let targets = candle_core::Tensor::from_slice(&[1.0f32, 0.0], (2,), &Device::Cpu).unwrap();
    backend.train_step(&model, &ids, &mask, &targets).unwrap();

    let mut stats = TrainingStats::default();
    stats.push_training(0.75);
    stats.push_validation(0.5);

    let store = CheckpointStore::new(&checkpoint_dir, None);
    let progress = ProgressSnapshot {
        epoch: 3,
        step: 7,
        total_epochs: 5,
        steps_per_epoch: 9,
    };
    store.save(&model, &backend, progress, &stats).unwrap();

    let saved_weights = param_values(&model);
    let saved_optimizer = serde_json::to_string(&backend.optimizer_state().unwrap()).unwrap();
    let saved_scheduler = backend.scheduler_snapshot().unwrap();

    // A differently seeded fresh model and backend must come back identical.
    let restored_model = build_model(99);
    let mut restored_backend = ExecutionBackend::select(&config, &restored_model, 2).unwrap();
    let point = store
        .load_latest(&restored_model, &mut restored_backend)
        .unwrap()
        .expect("checkpoint present");

    assert_eq!(point.epoch, 3);
    assert_eq!(point.step, 7);
    assert_eq!(point.stats, stats.records().to_vec());
    assert_eq!(param_values(&restored_model), saved_weights);
    assert_eq!(
        serde_json::to_string(&restored_backend.optimizer_state().unwrap()).unwrap(),
        saved_optimizer
    );
    assert_eq!(restored_backend.scheduler_snapshot().unwrap(), saved_scheduler);
}

#[test]
fn interrupted_training_resumes_to_the_same_result() {
    let tmp = tempfile::tempdir().unwrap();
    let train_path = tmp.path().join("train.json");
    write_dataset(&train_path, 4);

    // Uninterrupted: two epochs in one process.
    let dir_a = tmp.path().join("ckpt_a");
    let mut config_a = base_config(&train_path, &dir_a);
    config_a.runtime.epochs = 2;
    let mut uninterrupted = build_trainer(config_a);
    uninterrupted.train().unwrap();
    assert_eq!(uninterrupted.stats().len(), 4);

    // Interrupted: one epoch, then a fresh process resumes for the second.
    let dir_b = tmp.path().join("ckpt_b");
    let mut config_b = base_config(&train_path, &dir_b);
    config_b.runtime.epochs = 1;
    let mut first_half = build_trainer(config_b);
    first_half.train().unwrap();
    drop(first_half);

    let mut config_b2 = base_config(&train_path, &dir_b);
    config_b2.runtime.epochs = 2;
    let mut second_half = build_trainer(config_b2);
    second_half.train().unwrap();

    assert_eq!(second_half.stats().len(), 4);

    let final_a = param_values(uninterrupted.model());
    let final_b = param_values(second_half.model());
    for ((name_a, values_a), (name_b, values_b)) in final_a.iter().zip(final_b.iter()) {
        assert_eq!(name_a, name_b);
        for (a, b) in values_a.iter().zip(values_b.iter()) {
            assert!((a - b).abs() < 1e-6, "{name_a} diverged: {a} vs {b}");
        }
    }
}

#[test]
fn resume_skips_already_completed_steps() {
    let tmp = tempfile::tempdir().unwrap();
    let train_path = tmp.path().join("train.json");
    write_dataset(&train_path, 4);
    let checkpoint_dir = tmp.path().join("checkpoints");
    let config = base_config(&train_path, &checkpoint_dir);

    // Hand-build a mid-epoch checkpoint: batch 0 of epoch 0 already done.
    let model = build_model(config.runtime.seed);
    let backend = ExecutionBackend::select(&config, &model, 2).unwrap();
    let mut stats = TrainingStats::default();
    stats.push_training(0.9);
    let store = CheckpointStore::new(&checkpoint_dir, None);
    store
        .save(
            &model,
            &backend,
            ProgressSnapshot {
                epoch: 0,
                step: 1,
                total_epochs: 1,
                steps_per_epoch: 2,
            },
            &stats,
        )
        .unwrap();

    let mut trainer = build_trainer(config);
    trainer.train().unwrap();

    // One restored record plus exactly one new step (batch index 1).
    assert_eq!(trainer.stats().len(), 2);

    let descriptor = CheckpointStore::new(&checkpoint_dir, None)
        .latest_descriptor()
        .unwrap()
        .unwrap();
    assert_eq!(descriptor.manifest.progress.epoch, 1);
    assert_eq!(descriptor.manifest.progress.step, 0);
}

#[test]
fn validation_leaves_weights_byte_identical() {
    let tmp = tempfile::tempdir().unwrap();
    let train_path = tmp.path().join("train.json");
    let validation_path = tmp.path().join("validation.json");
    write_dataset(&train_path, 4);
    write_dataset(&validation_path, 3);
    let checkpoint_dir = tmp.path().join("checkpoints");

    let mut config = base_config(&train_path, &checkpoint_dir);
    config.data.validation_dataset_path = Some(validation_path);

    let mut trainer = build_trainer(config);
    let before = param_values(trainer.model());
    let loss = trainer.validate().unwrap();
    let after = param_values(trainer.model());

    assert!(loss.is_finite());
    assert_eq!(before, after);
    // Every validation batch leaves a record, none of them training records.
    assert_eq!(trainer.stats().len(), 2);
    assert!(trainer
        .stats()
        .records()
        .iter()
        .all(|record| matches!(record, StatRecord::Validation { .. })));
}

#[test]
fn training_with_validation_interleaves_records() {
    let tmp = tempfile::tempdir().unwrap();
    let train_path = tmp.path().join("train.json");
    let validation_path = tmp.path().join("validation.json");
    write_dataset(&train_path, 4);
    write_dataset(&validation_path, 2);
    let checkpoint_dir = tmp.path().join("checkpoints");

    let mut config = base_config(&train_path, &checkpoint_dir);
    config.data.validation_dataset_path = Some(validation_path);
    config.runtime.epochs = 2;

    let mut trainer = build_trainer(config);
    trainer.train().unwrap();

    // Per epoch: 2 training batches then 1 validation batch.
    let records = trainer.stats().records();
    assert_eq!(records.len(), 6);
    assert!(matches!(records[0], StatRecord::Training { .. }));
    assert!(matches!(records[1], StatRecord::Training { .. }));
    assert!(matches!(records[2], StatRecord::Validation { .. }));
    assert!(matches!(records[5], StatRecord::Validation { .. }));
}

#[test]
fn periodic_checkpoints_follow_the_processed_counter() {
    let tmp = tempfile::tempdir().unwrap();
    let train_path = tmp.path().join("train.json");
    write_dataset(&train_path, 6);
    let checkpoint_dir = tmp.path().join("checkpoints");

    let mut config = base_config(&train_path, &checkpoint_dir);
    config.runtime.checkpoint_steps = 2;

    let mut trainer = build_trainer(config);
    trainer.train().unwrap();

    // 3 batches: cadence saves after batches 0 and 1 (counter 2), then the
    // final snapshot. The save at (0, 2) records the next unprocessed index.
    let mut names: Vec<String> = fs::read_dir(&checkpoint_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["epoch_0000_step_00000002", "epoch_0001_step_00000000"]);
}

#[test]
fn fused_backend_trains_without_scheduler_state() {
    let tmp = tempfile::tempdir().unwrap();
    let train_path = tmp.path().join("train.json");
    write_dataset(&train_path, 4);
    let checkpoint_dir = tmp.path().join("checkpoints");

    let mut config = base_config(&train_path, &checkpoint_dir);
    config.backend.engine_enable = true;
    config.backend.amp_enable = true;

    let mut trainer = build_trainer(config);
    trainer.train().unwrap();
    assert_eq!(trainer.stats().len(), 2);

    let descriptor = CheckpointStore::new(&checkpoint_dir, None)
        .latest_descriptor()
        .unwrap()
        .unwrap();
    assert!(descriptor.manifest.scheduler.is_none());
    assert!(descriptor.manifest.scaler.is_none());
}

#[test]
fn overlong_sample_aborts_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    let train_path = tmp.path().join("train.json");
    write_dataset(&train_path, 2);
    let checkpoint_dir = tmp.path().join("checkpoints");

    let mut config = base_config(&train_path, &checkpoint_dir);
    config.model.max_sequence_length = 4;

    let mut trainer = build_trainer(config);
    let err = trainer.train().unwrap_err();
    assert!(matches!(err, TrainingError::SequenceTooLong { .. }));
    // Aborted before anything was persisted.
    assert!(!checkpoint_dir.exists());
}

#[test]
fn batch_source_covers_a_real_dataset() {
    let tmp = tempfile::tempdir().unwrap();
    let train_path = tmp.path().join("train.json");
    write_dataset(&train_path, 7);

    let dataset = RewardDataset::from_path(&train_path).unwrap();
    let source = BatchSource::new(&dataset, 3);
    assert_eq!(source.num_batches(), 3);
    let sizes: Vec<usize> = source.map(|batch| batch.texts.len()).collect();
    assert_eq!(sizes, vec![3, 3, 1]);
}
