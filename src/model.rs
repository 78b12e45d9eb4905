use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{Embedding, Linear, Module};
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
    SeedableRng,
};

use crate::TrainingError;

/// The opaque pretrained base model: token ids and attention mask in,
/// `[batch, seq, hidden]` hidden states out.
pub trait SequenceEncoder: Send {
    fn hidden_size(&self) -> usize;

    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor>;

    /// Trainable parameters as named variables, for the optimizer and the
    /// checkpoint store.
    fn parameters(&self) -> Vec<(String, Var)>;
}

/// Scalar reward head on top of a sequence encoder. `forward` scores every
/// position; `get_reward` returns the terminal scalar per example.
pub struct RewardModel {
    encoder: Box<dyn SequenceEncoder>,
    head: Linear,
    head_weight: Var,
    head_bias: Var,
    max_sequence_length: usize,
    device: Device,
    debug: bool,
}

impl RewardModel {
    pub fn new(
        encoder: Box<dyn SequenceEncoder>,
        max_sequence_length: usize,
        seed: u64,
        device: &Device,
        debug: bool,
    ) -> Result<Self, TrainingError> {
        let hidden = encoder.hidden_size();
        if hidden == 0 {
            return Err(TrainingError::initialization(
                "sequence encoder reports a zero hidden size",
            ));
        }
        if max_sequence_length == 0 {
            return Err(TrainingError::initialization(
                "max_sequence_length must be greater than zero",
            ));
        }

        let bound = 1.0 / (hidden as f32).sqrt();
        let weight = seeded_uniform(seed, bound, (1, hidden), device)?;
        let head_weight = Var::from_tensor(&weight).map_err(to_runtime_error)?;
        let bias = Tensor::zeros((1,), DType::F32, device).map_err(to_runtime_error)?;
        let head_bias = Var::from_tensor(&bias).map_err(to_runtime_error)?;
        let head = Linear::new(
            head_weight.as_tensor().clone(),
            Some(head_bias.as_tensor().clone()),
        );

        Ok(Self {
            encoder,
            head,
            head_weight,
            head_bias,
            max_sequence_length,
            device: device.clone(),
            debug,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn max_sequence_length(&self) -> usize {
        self.max_sequence_length
    }

    /// Per-position rewards, shaped `[batch, seq]`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let hidden = self
            .encoder
            .encode(input_ids, attention_mask)
            .map_err(to_runtime_error)?;
        if hidden.dims().len() != 3 {
            return Err(TrainingError::runtime(format!(
                "encoder must produce [batch, seq, hidden] states, got {:?}",
                hidden.dims()
            )));
        }

        let rewards = self
            .head
            .forward(&hidden)
            .map_err(to_runtime_error)?
            .squeeze(D::Minus1)
            .map_err(to_runtime_error)?;

        if self.debug {
            println!(
                "RewardModel::forward input {:?} rewards {:?}",
                input_ids.dims(),
                rewards.dims()
            );
        }

        Ok(rewards)
    }

    /// Reward at the last position of every example, shaped `[batch]`. The
    /// length guard runs before any encoder work.
    pub fn get_reward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let seq_len = input_ids.dim(1).map_err(to_runtime_error)?;
        if seq_len == 0 {
            return Err(TrainingError::runtime(
                "cannot score an empty token sequence",
            ));
        }
        if seq_len > self.max_sequence_length {
            return Err(TrainingError::SequenceTooLong {
                length: seq_len,
                limit: self.max_sequence_length,
            });
        }

        let rewards = self.forward(input_ids, attention_mask)?;
        rewards
            .narrow(1, seq_len - 1, 1)
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)
    }

    /// Encoder parameters (prefixed `encoder.`) plus the projection head.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        let mut params: Vec<(String, Var)> = self
            .encoder
            .parameters()
            .into_iter()
            .map(|(name, var)| (format!("encoder.{}", name), var))
            .collect();
        params.push(("head.weight".to_string(), self.head_weight.clone()));
        params.push(("head.bias".to_string(), self.head_bias.clone()));
        params
    }
}

/// Lightweight concrete encoder (embedding table + tanh projection) used when
/// no pretrained backbone is wired in, and by the tests. Deterministic for a
/// given seed.
pub struct EmbeddingEncoder {
    embedding: Embedding,
    proj: Linear,
    embedding_weight: Var,
    proj_weight: Var,
    proj_bias: Var,
    hidden_size: usize,
}

impl EmbeddingEncoder {
    pub fn new(
        vocab_size: usize,
        hidden_size: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self, TrainingError> {
        if vocab_size == 0 || hidden_size == 0 {
            return Err(TrainingError::initialization(
                "encoder requires non-zero vocab and hidden sizes",
            ));
        }

        let bound = 1.0 / (hidden_size as f32).sqrt();
        let embedding_tensor = seeded_uniform(seed, bound, (vocab_size, hidden_size), device)?;
        let embedding_weight = Var::from_tensor(&embedding_tensor).map_err(to_runtime_error)?;
        let embedding = Embedding::new(embedding_weight.as_tensor().clone(), hidden_size);

        let proj_tensor = seeded_uniform(
            seed.wrapping_add(1),
            bound,
            (hidden_size, hidden_size),
            device,
        )?;
        let proj_weight = Var::from_tensor(&proj_tensor).map_err(to_runtime_error)?;
        let bias = Tensor::zeros((hidden_size,), DType::F32, device).map_err(to_runtime_error)?;
        let proj_bias = Var::from_tensor(&bias).map_err(to_runtime_error)?;
        let proj = Linear::new(
            proj_weight.as_tensor().clone(),
            Some(proj_bias.as_tensor().clone()),
        );

        Ok(Self {
            embedding,
            proj,
            embedding_weight,
            proj_weight,
            proj_bias,
            hidden_size,
        })
    }
}

impl SequenceEncoder for EmbeddingEncoder {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        let embedded = self.embedding.forward(input_ids)?;
        let activated = self.proj.forward(&embedded)?.tanh()?;
        let mask = attention_mask
            .to_dtype(activated.dtype())?
            .unsqueeze(D::Minus1)?;
        activated.broadcast_mul(&mask)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("embedding.weight".to_string(), self.embedding_weight.clone()),
            ("proj.weight".to_string(), self.proj_weight.clone()),
            ("proj.bias".to_string(), self.proj_bias.clone()),
        ]
    }
}

fn seeded_uniform(
    seed: u64,
    bound: f32,
    shape: (usize, usize),
    device: &Device,
) -> Result<Tensor, TrainingError> {
    let (rows, cols) = shape;
    let mut rng = StdRng::seed_from_u64(seed);
    let distribution = Uniform::new(-bound, bound);
    let values: Vec<f32> = (0..rows * cols)
        .map(|_| distribution.sample(&mut rng))
        .collect();
    Tensor::from_vec(values, (rows, cols), device).map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
