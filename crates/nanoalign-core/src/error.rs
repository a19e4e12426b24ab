//! Centralized error types for nanoalign.
//!
//! Uses thiserror for ergonomic error handling with context.

use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AlignError {
    /// Neither a checkpoint directory nor a known architecture preset.
    #[error("Model not found: '{0}' is not a checkpoint directory or a known preset")]
    ModelNotFound(String),

    /// Invalid configuration detected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Requested compute device is not compiled in or failed to initialize.
    #[error("Device '{device}' unavailable: {hint}")]
    DeviceUnavailable { device: String, hint: String },

    /// Checkpoint directory has no usable tokenizer files.
    #[error("Tokenizer unavailable at {path}: {reason}")]
    TokenizerUnavailable { path: String, reason: String },

    /// Encoding or decoding failure.
    #[error("Tokenization error: {0}")]
    Tokenization(String),

    /// Dataset columns of different lengths.
    #[error("Dataset column '{column}' has {actual} rows, expected {expected}")]
    DatasetMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    /// Dataset has no usable rows.
    #[error("Dataset is empty: {0}")]
    EmptyDataset(String),

    /// Checkpoint loading failed.
    #[error("Failed to load checkpoint from {path}: {reason}")]
    CheckpointLoadFailed { path: String, reason: String },

    /// Checkpoint saving failed.
    #[error("Failed to save checkpoint to {path}: {reason}")]
    CheckpointSaveFailed { path: String, reason: String },

    /// Training diverged (NaN or infinite loss).
    #[error("{stage} training diverged at step {step}: loss={loss}")]
    TrainingDiverged {
        stage: String,
        step: usize,
        loss: f64,
    },

    /// IO error with path context.
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },

    /// JSON serialization/deserialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Candle tensor library error.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AlignError>;

impl AlignError {
    /// Check if error is recoverable (can retry).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AlignError::Io { .. } | AlignError::CheckpointSaveFailed { .. }
        )
    }

    /// Check if error indicates training should stop.
    pub fn should_stop_training(&self) -> bool {
        matches!(self, AlignError::TrainingDiverged { .. })
    }

    /// Get the path associated with this error (if any).
    pub fn path(&self) -> Option<&str> {
        match self {
            AlignError::CheckpointLoadFailed { path, .. }
            | AlignError::CheckpointSaveFailed { path, .. }
            | AlignError::TokenizerUnavailable { path, .. }
            | AlignError::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AlignError {
    fn from(err: std::io::Error) -> Self {
        AlignError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

/// Helper trait for adding path context to IO operations.
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> Result<T> {
        self.map_err(|e| AlignError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Helper for creating checkpoint save errors.
pub fn save_error<P: AsRef<std::path::Path>>(reason: impl ToString, path: P) -> AlignError {
    AlignError::CheckpointSaveFailed {
        path: path.as_ref().display().to_string(),
        reason: reason.to_string(),
    }
}

/// Helper for creating checkpoint load errors.
pub fn load_error<P: AsRef<std::path::Path>>(reason: impl ToString, path: P) -> AlignError {
    AlignError::CheckpointLoadFailed {
        path: path.as_ref().display().to_string(),
        reason: reason.to_string(),
    }
}
