// kestrel_core/src/sensors/pose.rs

use super::{diagonal_variance, ensure_finite, wrong_type, UpdateSensor};
use crate::error::SensorError;
use crate::estimation::ekf::skew;
use crate::messages::MeasurementData;
use crate::states::{normalized, quaternion_from_xyzw, CalibrationState, NavState, P_IDX, THETA_IDX};
use crate::types::{Matrix, Vector, CORE_ERROR_DIM};
use nalgebra::{DVectorView, Matrix3, UnitQuaternion, Vector3};

// Calibration layout: [p_ip (3), q_ip as x, y, z, w (4)], error state [δp_ip, δθ_ip].
const CALIBRATION_VALUES: usize = 7;
const CALIBRATION_DIM: usize = 6;

/// A sensor that observes the full 6-DoF pose of its own frame in the world frame
/// (motion capture, visual odometry).
///
/// The measurement vector is `[p_wp, q_wp.x, q_wp.y, q_wp.z, q_wp.w]`; the residual
/// is 6-dimensional, with the attitude part `2·vec(q_pred⁻¹ ⊗ q_meas)` expressed in
/// the sensor frame.
#[derive(Debug, Clone)]
pub struct PoseSensor {
    name: String,
    noise: Matrix,
    default_calibration: CalibrationState,
}

impl PoseSensor {
    /// `position_std` in metres and `orientation_std` in radians, per axis.
    pub fn new(name: impl Into<String>, position_std: [f64; 3], orientation_std: [f64; 3]) -> Self {
        let mut std = position_std.to_vec();
        std.extend_from_slice(&orientation_std);
        Self {
            name: name.into(),
            noise: diagonal_variance(&std),
            default_calibration: CalibrationState::new(
                pose_calibration(&Vector3::zeros(), &UnitQuaternion::identity()),
                diagonal_variance(&[0.1, 0.1, 0.1, 0.17, 0.17, 0.17]),
            ),
        }
    }

    /// Replaces the calibration used when no prior is configured.
    pub fn with_default_calibration(mut self, calibration: CalibrationState) -> Self {
        self.default_calibration = calibration;
        self
    }
}

/// Packs a sensor extrinsic into the pose calibration layout.
pub fn pose_calibration(p_ip: &Vector3<f64>, q_ip: &UnitQuaternion<f64>) -> Vector {
    let q = q_ip.coords;
    Vector::from_vec(vec![p_ip.x, p_ip.y, p_ip.z, q.x, q.y, q.z, q.w])
}

fn unpack(calibration: &Vector) -> (Vector3<f64>, UnitQuaternion<f64>) {
    (
        Vector3::new(calibration[0], calibration[1], calibration[2]),
        quaternion_from_xyzw(calibration[3], calibration[4], calibration[5], calibration[6]),
    )
}

impl UpdateSensor for PoseSensor {
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
            MeasurementData::Pose {
                position,
                orientation,
            } => {
                ensure_finite(
                    &self.name,
                    position.iter().chain(orientation.coords.iter()),
                )?;
                Ok(pose_calibration(position, orientation))
            }
            other => Err(wrong_type(&self.name, "pose", other)),
        }
    }

    fn predict(&self, nav: &NavState, calibration: &Vector) -> Vector {
        let (p_ip, q_ip) = unpack(calibration);
        let p_wp = nav.p_wi + nav.q_wi * p_ip;
        let q_wp = normalized(nav.q_wi * q_ip);
        pose_calibration(&p_wp, &q_wp)
    }

    fn residual(&self, measurement: &Vector, predicted: &Vector) -> Vector {
        let position = Vector3::new(
            measurement[0] - predicted[0],
            measurement[1] - predicted[1],
            measurement[2] - predicted[2],
        );
        let (_, q_meas) = unpack(measurement);
        let (_, q_pred) = unpack(predicted);
        let mut q_err = (q_pred.inverse() * q_meas).into_inner();
        if q_err.w < 0.0 {
            q_err = -q_err;
        }
        let attitude = q_err.vector() * 2.0;

        Vector::from_vec(vec![
            position.x, position.y, position.z, attitude[0], attitude[1], attitude[2],
        ])
    }

    fn jacobian(&self, nav: &NavState, calibration: &Vector) -> Matrix {
        let (p_ip, q_ip) = unpack(calibration);
        let r_wi = nav.q_wi.to_rotation_matrix().into_inner();
        let r_ip = q_ip.to_rotation_matrix().into_inner();

        let mut h = Matrix::zeros(6, CORE_ERROR_DIM + CALIBRATION_DIM);
        // Position rows
        h.fixed_view_mut::<3, 3>(0, P_IDX)
            .copy_from(&Matrix3::identity());
        h.fixed_view_mut::<3, 3>(0, THETA_IDX)
            .copy_from(&(-r_wi * skew(&p_ip)));
        h.fixed_view_mut::<3, 3>(0, CORE_ERROR_DIM).copy_from(&r_wi);
        // Attitude rows
        h.fixed_view_mut::<3, 3>(3, THETA_IDX)
            .copy_from(&r_ip.transpose());
        h.fixed_view_mut::<3, 3>(3, CORE_ERROR_DIM + 3)
            .copy_from(&Matrix3::identity());
        h
    }

    fn measurement_noise(&self) -> &Matrix {
        &self.noise
    }

    fn apply_correction(&self, calibration: &Vector, delta: DVectorView<f64>) -> Vector {
        debug_assert_eq!(calibration.nrows(), CALIBRATION_VALUES);
        let (p_ip, q_ip) = unpack(calibration);
        let p_ip = p_ip + Vector3::new(delta[0], delta[1], delta[2]);
        let q_ip = normalized(
            q_ip * UnitQuaternion::from_scaled_axis(Vector3::new(delta[3], delta[4], delta[5])),
        );
        pose_calibration(&p_ip, &q_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn sensor() -> PoseSensor {
        PoseSensor::new("pose", [0.02; 3], [2f64.to_radians(); 3])
    }

    fn nav() -> NavState {
        NavState::new(
            Vector3::new(1.0, -2.0, 3.0),
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.7),
        )
    }

    fn extrinsic() -> Vector {
        pose_calibration(
            &Vector3::new(0.2, 0.05, -0.1),
            &UnitQuaternion::from_euler_angles(0.0, 0.3, -0.1),
        )
    }

    #[test]
    fn prediction_applies_the_extrinsic() {
        let nav = nav();
        let z = sensor().predict(&nav, &extrinsic());
        let (p_ip, q_ip) = unpack(&extrinsic());
        let expected_p = nav.p_wi + nav.q_wi * p_ip;
        let (_, q_wp) = unpack(&z);

        assert_relative_eq!(Vector3::new(z[0], z[1], z[2]), expected_p, epsilon = 1e-12);
        assert_relative_eq!(q_wp.angle_to(&(nav.q_wi * q_ip)), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn residual_of_a_perfect_measurement_is_zero() {
        let s = sensor();
        let z = s.predict(&nav(), &extrinsic());
        assert_relative_eq!(s.residual(&z, &z), DVector::zeros(6), epsilon = 1e-12);
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let s = sensor();
        let nav = nav();
        let calibration = extrinsic();
        let z = s.predict(&nav, &calibration);
        let h = s.jacobian(&nav, &calibration);
        let step = 1e-6;

        for col in 0..(CORE_ERROR_DIM + CALIBRATION_DIM) {
            let mut delta = DVector::zeros(CORE_ERROR_DIM + CALIBRATION_DIM);
            delta[col] = step;
            let perturbed_nav = nav.boxplus(delta.rows(0, CORE_ERROR_DIM));
            let perturbed_cal =
                s.apply_correction(&calibration, delta.rows(CORE_ERROR_DIM, CALIBRATION_DIM));
            let z_pert = s.predict(&perturbed_nav, &perturbed_cal);
            // Residual of the perturbed prediction against the nominal one.
            let numeric = s.residual(&z_pert, &z) / step;
            for row in 0..6 {
                assert_relative_eq!(h[(row, col)], numeric[row], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn correction_moves_position_and_rotates_extrinsic() {
        let s = sensor();
        let calibration = pose_calibration(&Vector3::zeros(), &UnitQuaternion::identity());
        let delta = DVector::from_vec(vec![0.1, 0.0, 0.0, 0.0, 0.0, 0.2]);
        let corrected = s.apply_correction(&calibration, delta.rows(0, 6));
        let (p, q) = unpack(&corrected);
        assert_relative_eq!(p, Vector3::new(0.1, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(q.angle(), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn rejects_non_pose_payloads() {
        let result = sensor().measurement(&MeasurementData::Position(Vector3::zeros()));
        assert!(matches!(
            result,
            Err(SensorError::WrongMeasurementType {
                expected: "pose",
                received: "position",
                ..
            })
        ));
    }
}
