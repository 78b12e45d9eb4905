use serde::{Deserialize, Serialize};

/// One entry of the append-only statistics log, serialized as
/// `{"training_loss": x}` or `{"validation_loss": x}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatRecord {
    Training { training_loss: f32 },
    Validation { validation_loss: f32 },
}

/// Ordered per-step statistics, carried across restarts via the checkpoint
/// manifest.
#[derive(Debug, Clone, Default)]
pub struct TrainingStats {
    records: Vec<StatRecord>,
}

impl TrainingStats {
    pub fn push_training(&mut self, loss: f32) -> StatRecord {
        let record = StatRecord::Training {
            training_loss: loss,
        };
        self.records.push(record);
        record
    }

    pub fn push_validation(&mut self, loss: f32) -> StatRecord {
        let record = StatRecord::Validation {
            validation_loss: loss,
        };
        self.records.push(record);
        record
    }

    pub fn records(&self) -> &[StatRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replaces the log with the list restored from a checkpoint.
    pub fn restore(&mut self, records: Vec<StatRecord>) {
        self.records = records;
    }
}
