// kestrel_core/src/estimation/mod.rs

pub mod core_logic;
pub mod ekf;

pub use core_logic::{Diagnostic, Diagnostics, Estimator, EstimatorStatus, ProcessOutcome};
