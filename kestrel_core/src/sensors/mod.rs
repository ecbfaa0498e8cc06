// kestrel_core/src/sensors/mod.rs

use crate::error::SensorError;
use crate::messages::{ImuMeasurement, MeasurementData};
use crate::states::{CalibrationState, CoreState, NavState};
use crate::time::Timestamp;
use crate::types::{Matrix, Vector};
use dyn_clone::DynClone;
use nalgebra::DVectorView;
use std::fmt::Debug;

pub mod imu;
pub mod pose;
pub mod position;
pub mod pressure;

pub use imu::{integrate_nav, ImuPropagation};
pub use pose::{pose_calibration, PoseSensor};
pub use position::PositionSensor;
pub use pressure::{height_to_pressure, pressure_to_height, PressureSensor};

// --- PROPAGATION SENSOR TRAIT ---
// Advances the core state in time. Exactly one per estimator.
pub trait PropagationSensor: DynClone + Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Extracts the propagation input from a raw payload, rejecting anything else.
    fn input(&self, data: &MeasurementData) -> Result<ImuMeasurement, SensorError>;

    /// Propagates `prev` (valid at `prev_timestamp`) to `new_timestamp` with the
    /// newly received `input`.
    ///
    /// The returned state carries the propagated covariance, the one-step
    /// error-state transition and `input` as its held input. Must be a pure
    /// function of its arguments so replays reproduce the original result.
    fn propagate(
        &self,
        prev: &CoreState,
        prev_timestamp: Timestamp,
        input: &ImuMeasurement,
        new_timestamp: Timestamp,
    ) -> CoreState;
}

dyn_clone::clone_trait_object!(PropagationSensor);

// --- UPDATE SENSOR TRAIT ---
// Represents the mathematical model of an aiding sensor. `z = h(x, c) + v`,
// where `c` is the sensor's own calibration state.
pub trait UpdateSensor: DynClone + Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Size of the calibration error state.
    fn calibration_dim(&self) -> usize;

    /// Calibration used when no prior was configured.
    fn default_calibration(&self) -> CalibrationState;

    /// Validates a raw payload and turns it into the measurement vector `z`.
    fn measurement(&self, data: &MeasurementData) -> Result<Vector, SensorError>;

    /// Predicts the ideal measurement `z_pred = h(x, c)`.
    fn predict(&self, nav: &NavState, calibration: &Vector) -> Vector;

    /// Difference between a measurement and a prediction, in error coordinates.
    fn residual(&self, measurement: &Vector, predicted: &Vector) -> Vector {
        measurement - predicted
    }

    /// Jacobian of the residual with respect to `[core error, calibration error]`,
    /// sized `m x (15 + calibration_dim)`.
    fn jacobian(&self, nav: &NavState, calibration: &Vector) -> Matrix;

    /// Returns the measurement noise covariance matrix `R`.
    fn measurement_noise(&self) -> &Matrix;

    /// Applies a calibration error-state correction to the nominal calibration values.
    fn apply_correction(&self, calibration: &Vector, delta: DVectorView<f64>) -> Vector;
}

dyn_clone::clone_trait_object!(UpdateSensor);

// --- Shared helpers for the bundled models ---

fn ensure_finite<'a>(
    name: &str,
    values: impl IntoIterator<Item = &'a f64>,
) -> Result<(), SensorError> {
    if values.into_iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(SensorError::NonFinite(name.to_string()))
    }
}

fn wrong_type(name: &str, expected: &'static str, data: &MeasurementData) -> SensorError {
    SensorError::WrongMeasurementType {
        sensor: name.to_string(),
        expected,
        received: data.kind(),
    }
}

/// A diagonal noise matrix from per-axis standard deviations.
fn diagonal_variance(std: &[f64]) -> Matrix {
    Matrix::from_diagonal(&Vector::from_iterator(std.len(), std.iter().map(|s| s * s)))
}
