use std::{
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

use crate::{stats::StatRecord, TrainingError};

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub stats_path: Option<PathBuf>,
}

/// Progress reporting and the machine-readable statistics feed. Injected
/// into the trainer; opened at construction, flushed at training end.
pub struct Logger {
    settings: LoggingSettings,
    sink: Option<BufWriter<fs::File>>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let sink = if let Some(path) = settings.stats_path.as_ref() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(|err| {
                        TrainingError::initialization(format!(
                            "failed to create stats directory {}: {err}",
                            parent.display()
                        ))
                    })?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| {
                    TrainingError::initialization(format!(
                        "failed to open stats file {}: {err}",
                        path.display()
                    ))
                })?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self { settings, sink })
    }

    pub fn info(&self, message: &str) {
        if self.settings.enable_stdout {
            println!("{}", message);
        }
    }

    /// Appends one JSON line to the statistics feed. Best effort: a failed
    /// write never aborts training.
    pub fn record(&mut self, record: &StatRecord) {
        if let Some(sink) = self.sink.as_mut() {
            if let Ok(line) = serde_json::to_string(record) {
                let _ = writeln!(sink, "{}", line);
            }
        }
    }

    pub fn log_training_step(
        &self,
        epoch: usize,
        total_epochs: usize,
        iteration: usize,
        total_iterations: usize,
        loss: f32,
        predictions: &[f32],
        targets: &[f32],
    ) {
        if !self.settings.enable_stdout {
            return;
        }
        println!(
            "Epoch: {}/{}, Iteration: {}/{}, Training Loss: {}",
            epoch + 1,
            total_epochs,
            iteration + 1,
            total_iterations,
            loss
        );
        let rounded: Vec<String> = predictions.iter().map(|p| format!("{:.1}", p)).collect();
        println!("prediction [{}] target {:?}", rounded.join(", "), targets);
    }

    pub fn log_validation_step(
        &self,
        epoch: usize,
        total_epochs: usize,
        iteration: usize,
        total_iterations: usize,
        loss: f32,
    ) {
        if !self.settings.enable_stdout {
            return;
        }
        println!(
            "Epoch: {}/{}, Iteration: {}/{}, Validation Loss: {}",
            epoch + 1,
            total_epochs,
            iteration + 1,
            total_iterations,
            loss
        );
    }

    pub fn flush(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            let _ = sink.flush();
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.flush();
    }
}
