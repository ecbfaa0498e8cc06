// kestrel_core/src/sensors/position.rs

use super::{diagonal_variance, ensure_finite, wrong_type, UpdateSensor};
use crate::error::SensorError;
use crate::estimation::ekf::skew;
use crate::messages::MeasurementData;
use crate::states::{CalibrationState, NavState, P_IDX, THETA_IDX};
use crate::types::{Matrix, Vector, CORE_ERROR_DIM};
use nalgebra::{DVectorView, Matrix3, Vector3};

const CALIBRATION_DIM: usize = 3;

/// World-frame position of a lever-armed point on the body, e.g. a GNSS antenna
/// already converted to the local navigation frame.
///
/// Calibration is the lever arm `p_ip` in the body frame.
#[derive(Debug, Clone)]
pub struct PositionSensor {
    name: String,
    noise: Matrix,
    default_calibration: CalibrationState,
}

impl PositionSensor {
    pub fn new(name: impl Into<String>, position_std: [f64; 3]) -> Self {
        Self {
            name: name.into(),
            noise: diagonal_variance(&position_std),
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
}

fn lever_arm(calibration: &Vector) -> Vector3<f64> {
    Vector3::new(calibration[0], calibration[1], calibration[2])
}

impl UpdateSensor for PositionSensor {
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
        match data {
            MeasurementData::Position(position) => {
                ensure_finite(&self.name, position.iter())?;
                Ok(Vector::from_column_slice(position.as_slice()))
            }
            other => Err(wrong_type(&self.name, "position", other)),
        }
    }

    fn predict(&self, nav: &NavState, calibration: &Vector) -> Vector {
        let p_wp = nav.p_wi + nav.q_wi * lever_arm(calibration);
        Vector::from_column_slice(p_wp.as_slice())
    }

    fn jacobian(&self, nav: &NavState, calibration: &Vector) -> Matrix {
        let r_wi = nav.q_wi.to_rotation_matrix().into_inner();
        let mut h = Matrix::zeros(3, CORE_ERROR_DIM + CALIBRATION_DIM);
        h.fixed_view_mut::<3, 3>(0, P_IDX)
            .copy_from(&Matrix3::identity());
        h.fixed_view_mut::<3, 3>(0, THETA_IDX)
            .copy_from(&(-r_wi * skew(&lever_arm(calibration))));
        h.fixed_view_mut::<3, 3>(0, CORE_ERROR_DIM).copy_from(&r_wi);
        h
    }

    fn measurement_noise(&self) -> &Matrix {
        &self.noise
    }

    fn apply_correction(&self, calibration: &Vector, delta: DVectorView<f64>) -> Vector {
        calibration + delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{DVector, UnitQuaternion};

    #[test]
    fn lever_arm_rotates_with_the_body() {
        let sensor = PositionSensor::new("gnss", [0.5; 3]);
        let nav = NavState::new(
            Vector3::new(10.0, 0.0, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2),
        );
        let calibration = DVector::from_vec(vec![1.0, 0.0, 0.0]);
        let z = sensor.predict(&nav, &calibration);
        assert_relative_eq!(z, DVector::from_vec(vec![10.0, 1.0, 0.0]), epsilon = 1e-12);
    }

    #[test]
    fn jacobian_has_lever_arm_attitude_coupling() {
        let sensor = PositionSensor::new("gnss", [0.5; 3]);
        let nav = NavState::default();
        let calibration = DVector::from_vec(vec![0.0, 0.0, 1.0]);
        let h = sensor.jacobian(&nav, &calibration);

        assert_eq!(h.shape(), (3, CORE_ERROR_DIM + CALIBRATION_DIM));
        // A small roll about x moves a point on +z towards -y.
        assert_relative_eq!(h[(1, THETA_IDX)], -1.0, epsilon = 1e-12);
        assert_relative_eq!(h[(0, CORE_ERROR_DIM)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_non_finite_position() {
        let sensor = PositionSensor::new("gnss", [0.5; 3]);
        let data = MeasurementData::Position(Vector3::new(0.0, f64::INFINITY, 0.0));
        assert_eq!(
            sensor.measurement(&data),
            Err(SensorError::NonFinite("gnss".to_string()))
        );
    }
}
