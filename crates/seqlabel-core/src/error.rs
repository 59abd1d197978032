use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while running a sequence-labeling experiment.
#[derive(Debug, Error)]
pub enum TrainError {
    /// The resolved configuration could not be persisted.
    #[error("failed to write configuration log {path:?}: {source}")]
    ConfigWrite {
        /// Target log file.
        path: PathBuf,
        source: std::io::Error,
    },

    /// A required run directory could not be created.
    #[error("failed to create directory {path:?}: {source}")]
    Directory {
        /// Directory that could not be created.
        path: PathBuf,
        source: std::io::Error,
    },

    /// Words, gold tags and predicted tags disagree for one example.
    #[error("alignment error at example {index}: {reason}")]
    Alignment {
        /// Index of the offending example in the split.
        index: usize,
        reason: String,
    },

    /// Writing prediction output failed.
    #[error("failed to write predictions to {path:?}: {source}")]
    Write {
        /// Prediction file being written.
        path: PathBuf,
        source: std::io::Error,
    },

    /// The servable model could not be exported.
    #[error("export failed: {0}")]
    Export(String),

    /// A configuration value is missing or has the wrong shape.
    #[error("invalid configuration value `{key}`: {reason}")]
    InvalidConfig { key: String, reason: String },

    /// Checkpoint state is missing or unreadable.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// An input file contains a malformed line.
    #[error("malformed input {path:?} line {line}: {reason}")]
    Input {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// The model rejected a batch or its own state.
    #[error("model error: {0}")]
    Model(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Result type alias for training operations.
pub type Result<T> = std::result::Result<T, TrainError>;
