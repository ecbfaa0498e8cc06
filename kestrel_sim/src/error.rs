// kestrel_sim/src/error.rs

use kestrel_core::error::EstimatorError;
use std::path::PathBuf;
use thiserror::Error;

/// Everything that can stop a simulation run before it produces a report.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("failed to load scenario: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("scenario file not found: {}", .0.display())]
    MissingScenario(PathBuf),

    #[error("invalid scenario: {0}")]
    InvalidScenario(String),

    #[error("invalid noise parameter: {0}")]
    Noise(#[from] rand_distr::NormalError),

    #[error(transparent)]
    Estimator(#[from] EstimatorError),

    #[error("failed to print scenario: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl From<figment::Error> for SimError {
    fn from(err: figment::Error) -> Self {
        SimError::Config(Box::new(err))
    }
}
