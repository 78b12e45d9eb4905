use std::path::PathBuf;

use clap::Parser;
use reward_trainer::{
    EmbeddingEncoder, HfPromptTokenizer, RewardConfig, RewardTrainer, TrainingError,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Reward model training CLI", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
    config: PathBuf,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    let config = RewardConfig::from_path(&args.config)?;

    let tokenizer_path = config.tokenizer.tokenizer_json.clone().ok_or_else(|| {
        TrainingError::initialization(
            "tokenizer.tokenizer_json must be set to run the training binary",
        )
    })?;
    let tokenizer = HfPromptTokenizer::from_file(&tokenizer_path)?;

    let device = config.device()?;
    let encoder = EmbeddingEncoder::new(
        tokenizer.vocab_size(),
        config.model.hidden_size,
        config.runtime.seed,
        &device,
    )?;

    let mut trainer = RewardTrainer::new(config, Box::new(encoder), Box::new(tokenizer))?;
    trainer.train()
}
