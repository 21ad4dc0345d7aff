//! Error types for the fusion engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FusionError {
    #[error("Cholesky factorization failed on {dim}x{dim} innovation covariance")]
    CholeskyFailed { dim: usize },

    #[error("Covariance diagonal entry {index} is invalid: {value}")]
    InvalidCovariance { index: usize, value: f64 },

    #[error("State size {size} exceeds capacity {capacity}")]
    StateOverflow { size: usize, capacity: usize },

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Calibration is missing key \"{0}\"")]
    MissingKey(String),

    #[error("Calibration key \"{key}\" expected {expected} values, got {actual}")]
    ArrayLength {
        key: String,
        expected: usize,
        actual: usize,
    },

    #[error("Truncated packet: need {required} bytes, have {available}")]
    TruncatedPacket { required: usize, available: usize },

    #[error("Malformed packet payload: {0}")]
    MalformedPacket(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl FusionError {
    /// Numeric failures invalidate the filter state and require reinitialization.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FusionError::CholeskyFailed { .. }
                | FusionError::InvalidCovariance { .. }
                | FusionError::StateOverflow { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FusionError>;
