// kestrel_core/src/error.rs

use crate::types::SensorHandle;
use thiserror::Error;

/// Hard failures and query errors surfaced by the estimator.
///
/// Per-measurement contingencies (stale, invalid, numerically unstable) are not
/// errors; they come back as a [`crate::estimation::Diagnostic`] so that one bad
/// measurement never aborts a run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimatorError {
    /// A state query was made before any resolved snapshot exists.
    #[error("the history buffer holds no resolved state yet")]
    EmptyBuffer,

    /// A per-sensor query for a sensor that never contributed a resolved entry.
    #[error("no resolved entry for {0} in the history buffer")]
    NoEntryForSensor(SensorHandle),

    /// The caller violated the controller's usage contract.
    #[error("invalid estimator transition: {0}")]
    InvalidTransition(String),

    #[error("{0} is not registered with this estimator")]
    UnknownSensor(SensorHandle),

    #[error("calibration for {sensor} has error dimension {found}, expected {expected}")]
    CalibrationDimension {
        sensor: SensorHandle,
        expected: usize,
        found: usize,
    },

    #[error("invalid estimator configuration: {0}")]
    InvalidConfig(String),
}

/// A sensor model refused a measurement payload.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    #[error("sensor '{sensor}' expects {expected} data, received {received}")]
    WrongMeasurementType {
        sensor: String,
        expected: &'static str,
        received: &'static str,
    },

    #[error("sensor '{0}' received a non-finite value")]
    NonFinite(String),

    #[error("sensor '{sensor}' received an out-of-range value: {reason}")]
    OutOfRange { sensor: String, reason: String },
}

/// Why an EKF correction could not be applied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NumericalIssue {
    #[error("residual contains non-finite values")]
    NonFiniteResidual,

    #[error("innovation covariance is singular")]
    SingularInnovation,

    #[error("updated covariance is not positive semi-definite")]
    InvalidCovariance,

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),
}

pub type Result<T> = std::result::Result<T, EstimatorError>;
