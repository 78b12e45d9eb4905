use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use candle_core::Device;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewardConfig {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub tokenizer: TokenizerSettings,
    #[serde(default)]
    pub data: DataSettings,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

impl RewardConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: RewardConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }

        if self.model.max_sequence_length == 0 {
            errors.push("model.max_sequence_length must be greater than 0".to_string());
        }

        if self.data.train_dataset_path.as_os_str().is_empty() {
            errors.push("data.train_dataset_path must not be empty".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.scheduler.min_lr_ratio) {
            errors.push("scheduler.min_lr_ratio must be in [0, 1]".to_string());
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }

        if self.runtime.iteration_per_print == 0 {
            errors.push("runtime.iteration_per_print must be greater than 0".to_string());
        }

        if self.runtime.checkpoint_steps == 0 {
            errors.push("runtime.checkpoint_steps must be greater than 0".to_string());
        }

        if self.runtime.checkpoint_dir.as_os_str().is_empty() {
            errors.push("runtime.checkpoint_dir must not be empty".to_string());
        }

        if let Some(0) = self.runtime.max_keep {
            errors.push("runtime.max_keep must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Resolves `runtime.device` into a candle device.
    pub fn device(&self) -> Result<Device, TrainingError> {
        parse_device(&self.runtime.device)
    }

    fn apply_base_path(&mut self, base: &Path) {
        if let Some(path) = self.tokenizer.tokenizer_json.as_mut() {
            absolutize_in_place(path, base);
        }
        absolutize_in_place(&mut self.data.train_dataset_path, base);
        if let Some(path) = self.data.validation_dataset_path.as_mut() {
            absolutize_in_place(path, base);
        }
        absolutize_in_place(&mut self.runtime.checkpoint_dir, base);
        if let Some(path) = self.runtime.stats_path.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            max_sequence_length: default_max_sequence_length(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenizerSettings {
    #[serde(default)]
    pub tokenizer_json: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    #[serde(default)]
    pub train_dataset_path: PathBuf,
    #[serde(default)]
    pub validation_dataset_path: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            train_dataset_path: PathBuf::new(),
            validation_dataset_path: None,
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_min_lr_ratio")]
    pub min_lr_ratio: f64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_lr_ratio: default_min_lr_ratio(),
        }
    }
}

/// Execution backend selection. When several flags are enabled the fused
/// engine wins over the loss-scaling layer, which wins over the plain path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default)]
    pub engine_enable: bool,
    #[serde(default)]
    pub amp_enable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_iteration_per_print")]
    pub iteration_per_print: usize,
    #[serde(default = "default_checkpoint_steps")]
    pub checkpoint_steps: usize,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default)]
    pub max_keep: Option<usize>,
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub stats_path: Option<PathBuf>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            device: default_device(),
            seed: default_seed(),
            debug: false,
            iteration_per_print: default_iteration_per_print(),
            checkpoint_steps: default_checkpoint_steps(),
            checkpoint_dir: default_checkpoint_dir(),
            max_keep: None,
            enable_stdout: default_enable_stdout(),
            stats_path: None,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if !path.as_os_str().is_empty() && path.is_relative() {
        *path = base.join(&*path);
    }
}

fn parse_device(spec: &str) -> Result<Device, TrainingError> {
    let normalized = spec.trim().to_ascii_lowercase();
    if normalized == "cpu" {
        return Ok(Device::Cpu);
    }

    let (kind, ordinal) = match normalized.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal = ordinal.parse::<usize>().map_err(|_| {
                TrainingError::initialization(format!("invalid device ordinal in '{}'", spec))
            })?;
            (kind, ordinal)
        }
        None => (normalized.as_str(), 0),
    };

    match kind {
        "cuda" => Device::new_cuda(ordinal).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize cuda device: {err}"))
        }),
        "metal" => Device::new_metal(ordinal).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize metal device: {err}"))
        }),
        other => Err(TrainingError::initialization(format!(
            "unsupported device '{}'",
            other
        ))),
    }
}

fn default_hidden_size() -> usize {
    128
}

fn default_max_sequence_length() -> usize {
    512
}

fn default_batch_size() -> usize {
    8
}

fn default_learning_rate() -> f64 {
    9e-5
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.95
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_min_lr_ratio() -> f64 {
    0.1
}

fn default_epochs() -> usize {
    1
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_iteration_per_print() -> usize {
    10
}

fn default_checkpoint_steps() -> usize {
    100
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_enable_stdout() -> bool {
    true
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    SequenceTooLong { length: usize, limit: usize },
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o failure: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::SequenceTooLong { length, limit } => write!(
                f,
                "sequence length {} exceeds configured maximum {}",
                length, limit
            ),
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
