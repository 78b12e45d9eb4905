use std::{
    collections::HashMap,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::{load as load_safetensors, save as save_safetensors};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    backend::ExecutionBackend,
    model::RewardModel,
    stats::{StatRecord, TrainingStats},
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Where the run stands: the position to resume from and the epoch geometry
/// it was recorded under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub epoch: usize,
    pub step: usize,
    pub total_epochs: usize,
    pub steps_per_epoch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub scheduler: Option<FileRecord>,
    pub scaler: Option<FileRecord>,
    pub progress: ProgressSnapshot,
    pub stats: Vec<StatRecord>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// What a restarted run continues from.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub epoch: usize,
    pub step: usize,
    pub stats: Vec<StatRecord>,
}

/// Exclusive owner of persisted checkpoints: serializes model weights,
/// optimizer/scheduler/scaler state, progress and statistics, and decides
/// the resume point.
pub struct CheckpointStore {
    directory: PathBuf,
    max_keep: Option<usize>,
}

impl CheckpointStore {
    pub fn new(directory: impl Into<PathBuf>, max_keep: Option<usize>) -> Self {
        Self {
            directory: directory.into(),
            max_keep,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn save(
        &self,
        model: &RewardModel,
        backend: &ExecutionBackend,
        progress: ProgressSnapshot,
        stats: &TrainingStats,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        fs::create_dir_all(&self.directory).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                self.directory.display()
            ))
        })?;

        let dir_name = format!("epoch_{:04}_step_{:08}", progress.epoch, progress.step);
        let checkpoint_dir = self.directory.join(dir_name);
        if checkpoint_dir.exists() {
            fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to remove existing checkpoint directory {}: {err}",
                    checkpoint_dir.display()
                ))
            })?;
        }
        fs::create_dir(&checkpoint_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;

        let model_path = checkpoint_dir.join(MODEL_FILENAME);
        save_model_weights(model, &model_path)?;
        let model_record = file_record(&model_path)?;

        let optimizer_state = backend.optimizer_state()?;
        let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILENAME);
        write_json(&optimizer_path, &optimizer_state)?;
        let optimizer_record = file_record(&optimizer_path)?;

        let scheduler_record = if let Some(state) = backend.scheduler_snapshot() {
            let scheduler_path = checkpoint_dir.join(SCHEDULER_FILENAME);
            write_json(&scheduler_path, &state)?;
            Some(file_record(&scheduler_path)?)
        } else {
            None
        };

        let scaler_record = if let Some(state) = backend.scaler_state() {
            let scaler_path = checkpoint_dir.join(SCALER_FILENAME);
            write_json(&scaler_path, &state)?;
            Some(file_record(&scaler_path)?)
        } else {
            None
        };

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            model: model_record,
            optimizer: optimizer_record,
            scheduler: scheduler_record,
            scaler: scaler_record,
            progress,
            stats: stats.records().to_vec(),
        };

        let manifest_path = checkpoint_dir.join(MANIFEST_FILENAME);
        write_json(&manifest_path, &manifest)?;

        self.prune()?;

        Ok(CheckpointDescriptor {
            directory: checkpoint_dir,
            manifest,
        })
    }

    /// Restores the most recent checkpoint into the live model and backend.
    /// `None` means no checkpoint exists and the caller starts fresh.
    pub fn load_latest(
        &self,
        model: &RewardModel,
        backend: &mut ExecutionBackend,
    ) -> Result<Option<ResumePoint>, TrainingError> {
        let Some(directory) = self.latest_directory()? else {
            return Ok(None);
        };
        let manifest = load_manifest(&directory)?;
        ensure_version_supported(manifest.version)?;

        let model_path = directory.join(&manifest.model.filename);
        validate_file(&model_path, &manifest.model.sha256)?;
        apply_model_weights(model, &model_path)?;

        let optimizer_path = directory.join(&manifest.optimizer.filename);
        validate_file(&optimizer_path, &manifest.optimizer.sha256)?;
        backend.load_optimizer_state(read_json(&optimizer_path)?)?;

        if let Some(record) = manifest.scheduler.as_ref() {
            let path = directory.join(&record.filename);
            validate_file(&path, &record.sha256)?;
            let state = read_json(&path)?;
            backend.load_scheduler_snapshot(&state)?;
        }

        if let Some(record) = manifest.scaler.as_ref() {
            let path = directory.join(&record.filename);
            validate_file(&path, &record.sha256)?;
            backend.load_scaler_state(read_json(&path)?)?;
        }

        Ok(Some(ResumePoint {
            epoch: manifest.progress.epoch,
            step: manifest.progress.step,
            stats: manifest.stats,
        }))
    }

    pub fn latest_descriptor(&self) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        let Some(directory) = self.latest_directory()? else {
            return Ok(None);
        };
        let manifest = load_manifest(&directory)?;
        Ok(Some(CheckpointDescriptor {
            directory,
            manifest,
        }))
    }

    fn latest_directory(&self) -> Result<Option<PathBuf>, TrainingError> {
        let dirs = self.checkpoint_directories()?;
        Ok(dirs.into_iter().max())
    }

    fn checkpoint_directories(&self) -> Result<Vec<PathBuf>, TrainingError> {
        let mut dirs = Vec::new();
        if !self.directory.exists() {
            return Ok(dirs);
        }
        for entry in fs::read_dir(&self.directory).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to read checkpoint directory {}: {err}",
                self.directory.display()
            ))
        })? {
            let entry = entry.map_err(|err| {
                TrainingError::runtime(format!("failed to read checkpoint entry: {err}"))
            })?;
            let file_type = entry.file_type().map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to inspect checkpoint entry {}: {err}",
                    entry.path().display()
                ))
            })?;
            if !file_type.is_dir() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with("epoch_") {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    fn prune(&self) -> Result<(), TrainingError> {
        let Some(limit) = self.max_keep else {
            return Ok(());
        };
        if limit == 0 {
            return Ok(());
        }
        let mut dirs = self.checkpoint_directories()?;
        dirs.sort();
        while dirs.len() > limit {
            let victim = dirs.remove(0);
            fs::remove_dir_all(&victim).map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to prune checkpoint {}: {err}",
                    victim.display()
                ))
            })?;
        }
        Ok(())
    }
}

fn save_model_weights(model: &RewardModel, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = model.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let mut tensors = HashMap::with_capacity(named_parameters.len());
    for (name, var) in named_parameters {
        tensors.insert(name, var.as_tensor().clone());
    }
    save_safetensors(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn apply_model_weights(model: &RewardModel, weights_path: &Path) -> Result<(), TrainingError> {
    let tensors =
        load_safetensors(weights_path, model.device()).map_err(candle_to_training_error)?;
    let mut params_by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in model.parameters() {
        let tensor = params_by_name.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor
                .to_dtype(desired_dtype)
                .map_err(candle_to_training_error)?
        };
        var.set(&tensor).map_err(candle_to_training_error)?;
    }

    if !params_by_name.is_empty() {
        let extra = params_by_name
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {extra}"
        )));
    }

    Ok(())
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    fs::write(path, data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn candle_to_training_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
