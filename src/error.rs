use crate::config::DistanceType;
use crate::residency::Residency;
use thiserror::Error;

/// Error types for the balanced k-means library
#[derive(Error, Debug)]
pub enum BalancedKMeansError {
    /// The number of clusters k is invalid (must be > 0)
    #[error("Invalid k value: {0}")]
    InvalidK(String),

    /// Not enough data points for the requested number of clusters
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// Model has not been fitted yet
    #[error("Model has not been fitted. Call train() or fit() first.")]
    NotFitted,

    /// Dimension mismatch between inputs
    #[error("Dimension mismatch: {0}")]
    InvalidDimensions(String),

    /// The distance metric cannot be used for cluster assignment
    #[error("The chosen distance metric is not supported ({0:?})")]
    UnsupportedMetric(DistanceType),

    /// Parameters or element/label types that cannot express the requested run
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfig(String),

    /// Inputs of a single primitive call live in incompatible memory spaces
    #[error("Inputs of one call must share residency, found {found:?} and {other:?}")]
    ResidencyMismatch { found: Residency, other: Residency },

    /// An internal bookkeeping invariant did not hold
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Failure reported by the CUDA driver, cuBLAS or NVRTC
    #[error("Device error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, BalancedKMeansError>;
