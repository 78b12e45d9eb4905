pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod dataset;
pub mod logging;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod stats;
pub mod trainer;

pub use backend::{ExecutionBackend, FusedEngine, StepOutput};
pub use checkpoint::{CheckpointStore, ProgressSnapshot, ResumePoint};
pub use config::{RewardConfig, TrainingError};
pub use data::{BatchSource, HfPromptTokenizer, PromptTokenizer, RewardBatch, TokenizedBatch};
pub use dataset::{RewardDataset, RewardSample};
pub use model::{EmbeddingEncoder, RewardModel, SequenceEncoder};
pub use stats::{StatRecord, TrainingStats};
pub use trainer::RewardTrainer;
