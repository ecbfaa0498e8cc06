// kestrel_core/src/sensors/pressure.rs

use super::{diagonal_variance, ensure_finite, wrong_type, UpdateSensor};
use crate::error::SensorError;
use crate::estimation::ekf::skew;
use crate::messages::MeasurementData;
use crate::states::{CalibrationState, NavState, P_IDX, THETA_IDX};
use crate::types::{Matrix, Vector, CORE_ERROR_DIM, GRAVITY};
use nalgebra::{DVectorView, Vector3};

const CALIBRATION_DIM: usize = 3;

// --- Barometric constants ---
const GAS_CONSTANT: f64 = 8.314_462_618; // J/(mol K)
const MOLAR_MASS_AIR: f64 = 0.028_964_4; // kg/mol

/// Height above the reference level for a static `pressure` (Pa) at air
/// `temperature` (K), using the isothermal hypsometric equation.
pub fn pressure_to_height(pressure: f64, temperature: f64, reference_pressure: f64) -> f64 {
    GAS_CONSTANT * temperature / (MOLAR_MASS_AIR * GRAVITY) * (reference_pressure / pressure).ln()
}

/// Inverse of [`pressure_to_height`].
pub fn height_to_pressure(height: f64, temperature: f64, reference_pressure: f64) -> f64 {
    reference_pressure * (-height * MOLAR_MASS_AIR * GRAVITY / (GAS_CONSTANT * temperature)).exp()
}

/// A barometer observing the world-frame height of its own position.
///
/// The raw pressure is converted to a height relative to `reference_pressure`
/// (the pressure at world `z = 0`), so the estimator only ever sees a scalar
/// height measurement. Calibration is the sensor position `p_ip` in the body frame.
#[derive(Debug, Clone)]
pub struct PressureSensor {
    name: String,
    reference_pressure: f64,
    noise: Matrix,
    default_calibration: CalibrationState,
}

impl PressureSensor {
    /// `height_std` is the measurement noise in metres after conversion.
    pub fn new(name: impl Into<String>, reference_pressure: f64, height_std: f64) -> Self {
        Self {
            name: name.into(),
            reference_pressure,
            noise: diagonal_variance(&[height_std]),
            default_calibration: CalibrationState::new(
                Vector::zeros(CALIBRATION_DIM),
                diagonal_variance(&[0.1; 3]),
            ),
        }
    }

    pub fn with_default_calibration(mut self, calibration: CalibrationState) -> Self {
        self.default_calibration = calibration;
        self
    }

    pub fn reference_pressure(&self) -> f64 {
        self.reference_pressure
    }

    fn out_of_range(&self, reason: String) -> SensorError {
        SensorError::OutOfRange {
            sensor: self.name.clone(),
            reason,
        }
    }
}

fn sensor_position(calibration: &Vector) -> Vector3<f64> {
    Vector3::new(calibration[0], calibration[1], calibration[2])
}

impl UpdateSensor for PressureSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn calibration_dim(&self) -> usize {
        CALIBRATION_DIM
    }

    fn default_calibration(&self) -> CalibrationState {
        self.default_calibration.clone()
    }

    fn measurement(&self, data: &MeasurementData) -> Result<Vector, SensorError> {
        let MeasurementData::Pressure {
            pressure,
            temperature,
        } = data
        else {
            return Err(wrong_type(&self.name, "pressure", data));
        };
        ensure_finite(&self.name, [pressure, temperature])?;
        if *pressure <= 0.0 {
            return Err(self.out_of_range(format!("pressure {pressure} Pa is not positive")));
        }
        if *temperature <= 0.0 {
            return Err(self.out_of_range(format!("temperature {temperature} K is not positive")));
        }

        let height = pressure_to_height(*pressure, *temperature, self.reference_pressure);
        Ok(Vector::from_element(1, height))
    }

    fn predict(&self, nav: &NavState, calibration: &Vector) -> Vector {
        let p_wp = nav.p_wi + nav.q_wi * sensor_position(calibration);
        Vector::from_element(1, p_wp.z)
    }

    fn jacobian(&self, nav: &NavState, calibration: &Vector) -> Matrix {
        let r_wi = nav.q_wi.to_rotation_matrix().into_inner();
        let attitude = -r_wi * skew(&sensor_position(calibration));

        let mut h = Matrix::zeros(1, CORE_ERROR_DIM + CALIBRATION_DIM);
        h[(0, P_IDX + 2)] = 1.0;
        for col in 0..3 {
            h[(0, THETA_IDX + col)] = attitude[(2, col)];
            h[(0, CORE_ERROR_DIM + col)] = r_wi[(2, col)];
        }
        h
    }

    fn measurement_noise(&self) -> &Matrix {
        &self.noise
    }

    fn apply_correction(&self, calibration: &Vector, delta: DVectorView<f64>) -> Vector {
        calibration + delta
    }
}
