use std::path::Path;

use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

use crate::{dataset::RewardDataset, TrainingError};

/// One group of samples handed to the training step. `index` is the batch's
/// position within the epoch traversal.
#[derive(Debug, Clone)]
pub struct RewardBatch {
    pub index: usize,
    pub texts: Vec<String>,
    pub scores: Vec<f32>,
}

/// Restartable traversal of a dataset in store order: fixed-size groups with
/// a final short group when the size does not divide evenly.
pub struct BatchSource<'a> {
    dataset: &'a RewardDataset,
    batch_size: usize,
    cursor: usize,
    next_index: usize,
}

impl<'a> BatchSource<'a> {
    pub fn new(dataset: &'a RewardDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            cursor: 0,
            next_index: 0,
        }
    }

    /// The effective batch size used for grouping.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        num_batches(self.dataset.len(), self.batch_size)
    }
}

impl Iterator for BatchSource<'_> {
    type Item = RewardBatch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.dataset.len() {
            return None;
        }

        let end = (self.cursor + self.batch_size).min(self.dataset.len());
        let chunk = &self.dataset.samples()[self.cursor..end];
        let batch = RewardBatch {
            index: self.next_index,
            texts: chunk.iter().map(|sample| sample.text.clone()).collect(),
            scores: chunk.iter().map(|sample| sample.score).collect(),
        };

        self.cursor = end;
        self.next_index += 1;
        Some(batch)
    }
}

pub fn num_batches(samples: usize, batch_size: usize) -> usize {
    if samples == 0 {
        0
    } else {
        (samples + batch_size - 1) / batch_size.max(1)
    }
}

/// Token ids and 0/1 attention mask for a batch, padded to a shared width.
#[derive(Debug, Clone)]
pub struct TokenizedBatch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
}

impl TokenizedBatch {
    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map_or(0, Vec::len)
    }

    /// Materializes the `[batch, seq]` id and mask tensors on `device`.
    pub fn to_device(&self, device: &Device) -> Result<(Tensor, Tensor), TrainingError> {
        let rows = self.input_ids.len();
        let width = self.seq_len();
        if rows == 0 || width == 0 {
            return Err(TrainingError::runtime(
                "tokenized batch contains no tokens",
            ));
        }

        let mut ids = Vec::with_capacity(rows * width);
        let mut mask = Vec::with_capacity(rows * width);
        for (row_ids, row_mask) in self.input_ids.iter().zip(&self.attention_mask) {
            if row_ids.len() != width || row_mask.len() != width {
                return Err(TrainingError::runtime(
                    "tokenized batch rows have inconsistent widths",
                ));
            }
            ids.extend_from_slice(row_ids);
            mask.extend(row_mask.iter().map(|&m| m as f32));
        }

        let input_ids = Tensor::from_vec(ids, (rows, width), device).map_err(|err| {
            TrainingError::runtime(format!("failed to materialize token tensor: {}", err))
        })?;
        let attention_mask = Tensor::from_vec(mask, (rows, width), device).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to materialize attention mask tensor: {}",
                err
            ))
        })?;

        Ok((input_ids, attention_mask))
    }
}

/// Capability seam over the external tokenizer so tests can substitute a
/// deterministic stub.
pub trait PromptTokenizer: Send {
    fn tokenize(&self, texts: &[String]) -> Result<TokenizedBatch, TrainingError>;
}

/// Production tokenizer backed by a Hugging Face `tokenizer.json`, padding
/// every batch to its longest sequence.
pub struct HfPromptTokenizer {
    inner: Tokenizer,
    pad_token_id: u32,
}

impl HfPromptTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let inner = Tokenizer::from_file(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to load tokenizer json {}: {}",
                path.display(),
                err
            ))
        })?;
        let pad_token_id = inner.get_padding().map(|params| params.pad_id).unwrap_or(0);
        Ok(Self {
            inner,
            pad_token_id,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl PromptTokenizer for HfPromptTokenizer {
    fn tokenize(&self, texts: &[String]) -> Result<TokenizedBatch, TrainingError> {
        if texts.is_empty() {
            return Err(TrainingError::runtime("cannot tokenize an empty batch"));
        }

        let encodings = self
            .inner
            .encode_batch(texts.to_vec(), true)
            .map_err(|err| TrainingError::runtime(format!("tokenization failed: {}", err)))?;

        let width = encodings
            .iter()
            .map(|encoding| encoding.get_ids().len())
            .max()
            .unwrap_or(0)
            .max(1);

        let mut input_ids = Vec::with_capacity(encodings.len());
        let mut attention_mask = Vec::with_capacity(encodings.len());
        for encoding in &encodings {
            let ids = encoding.get_ids();
            let mut row_ids = Vec::with_capacity(width);
            let mut row_mask = Vec::with_capacity(width);
            row_ids.extend_from_slice(ids);
            row_mask.extend(std::iter::repeat(1u32).take(ids.len()));
            row_ids.resize(width, self.pad_token_id);
            row_mask.resize(width, 0);
            input_ids.push(row_ids);
            attention_mask.push(row_mask);
        }

        Ok(TokenizedBatch {
            input_ids,
            attention_mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::RewardDataset;

    fn dataset_of(n: usize) -> RewardDataset {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let records: Vec<String> = (0..n)
            .map(|i| format!(r#"{{"user_input": "q{}", "completion": "a", "score": {}}}"#, i, i))
            .collect();
        std::fs::write(&path, format!("[{}]", records.join(","))).unwrap();
        RewardDataset::from_path(&path).unwrap()
    }

    #[test]
    fn partitions_the_whole_store_exactly_once() {
        let dataset = dataset_of(10);
        let source = BatchSource::new(&dataset, 3);
        assert_eq!(source.batch_size(), 3);
        let batches: Vec<RewardBatch> = source.collect();

        assert_eq!(batches.len(), 4);
        let sizes: Vec<usize> = batches.iter().map(|b| b.texts.len()).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
        assert_eq!(sizes.iter().sum::<usize>(), 10);
        let indices: Vec<usize> = batches.iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn even_partition_has_no_short_tail() {
        let dataset = dataset_of(4);
        let batches: Vec<RewardBatch> = BatchSource::new(&dataset, 2).collect();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.texts.len() == 2));
    }

    #[test]
    fn preserves_store_order() {
        let dataset = dataset_of(5);
        let batches: Vec<RewardBatch> = BatchSource::new(&dataset, 2).collect();
        let flattened: Vec<String> = batches.into_iter().flat_map(|b| b.texts).collect();
        let expected: Vec<String> = (0..5).map(|i| format!("q{}a", i)).collect();
        assert_eq!(flattened, expected);
    }

    #[test]
    fn traversal_is_restartable() {
        let dataset = dataset_of(3);
        let first: usize = BatchSource::new(&dataset, 2).count();
        let second: usize = BatchSource::new(&dataset, 2).count();
        assert_eq!(first, second);
    }

    #[test]
    fn num_batches_rounds_up() {
        assert_eq!(num_batches(0, 4), 0);
        assert_eq!(num_batches(8, 4), 2);
        assert_eq!(num_batches(9, 4), 3);
    }

    #[test]
    fn tokenized_batch_materializes_mask() {
        let batch = TokenizedBatch {
            input_ids: vec![vec![5, 6, 0], vec![7, 8, 9]],
            attention_mask: vec![vec![1, 1, 0], vec![1, 1, 1]],
        };
        let (ids, mask) = batch.to_device(&Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[2, 3]);
        assert_eq!(
            mask.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0, 0.0], vec![1.0, 1.0, 1.0]]
        );
    }
}
