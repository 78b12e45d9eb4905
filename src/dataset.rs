use std::{fs, path::Path};

use serde::Deserialize;

use crate::TrainingError;

/// One labeled example: the concatenated prompt+completion text and the
/// quality score assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardSample {
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Deserialize)]
struct RewardRecord {
    user_input: String,
    completion: String,
    score: f64,
}

/// In-memory store of scored samples loaded from a single JSON file shaped as
/// `[{"user_input": ..., "completion": ..., "score": ...}, ...]`.
#[derive(Debug)]
pub struct RewardDataset {
    samples: Vec<RewardSample>,
}

impl RewardDataset {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let records: Vec<RewardRecord> = serde_json::from_str(&contents).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to parse dataset {}: {}",
                path.display(),
                err
            ))
        })?;

        let samples = records
            .into_iter()
            .map(|record| RewardSample {
                text: format!("{}{}", record.user_input, record.completion),
                score: record.score as f32,
            })
            .collect();

        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Indexed access; an out-of-range index is a caller bug and panics.
    pub fn get(&self, index: usize) -> &RewardSample {
        &self.samples[index]
    }

    pub fn samples(&self) -> &[RewardSample] {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_dataset(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn concatenates_without_separator_and_coerces_scores() {
        let (_dir, path) = write_dataset(
            r#"[
                {"user_input": "Q: 2+2?", "completion": "4", "score": 1},
                {"user_input": "Q: 2+2?", "completion": "five", "score": 0.25}
            ]"#,
        );

        let dataset = RewardDataset::from_path(&path).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.get(0).text, "Q: 2+2?4");
        assert_eq!(dataset.get(0).score, 1.0);
        assert_eq!(dataset.get(1).text, "Q: 2+2?five");
        assert_eq!(dataset.get(1).score, 0.25);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            RewardDataset::from_path("/nonexistent/data.json"),
            Err(TrainingError::Io(_))
        ));
    }

    #[test]
    fn malformed_records_are_fatal() {
        let (_dir, path) = write_dataset(r#"[{"prompt": "missing fields"}]"#);
        assert!(matches!(
            RewardDataset::from_path(&path),
            Err(TrainingError::Initialization(_))
        ));
    }

    #[test]
    #[should_panic]
    fn out_of_range_index_panics() {
        let (_dir, path) = write_dataset("[]");
        let dataset = RewardDataset::from_path(&path).unwrap();
        let _ = dataset.get(0);
    }
}
