// kestrel_core/src/sensors/imu.rs

use super::{ensure_finite, wrong_type, PropagationSensor};
use crate::config::ImuNoise;
use crate::error::SensorError;
use crate::estimation::ekf::skew;
use crate::messages::{ImuMeasurement, MeasurementData};
use crate::states::{normalized, CoreState, NavState, BA_IDX, BW_IDX, P_IDX, THETA_IDX, V_IDX};
use crate::time::Timestamp;
use crate::types::{CoreMatrix, GRAVITY};
use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Strapdown inertial propagation of the core state.
///
/// Between two samples the input is the mean of the held and the new sample,
/// bias-compensated. Position and velocity are integrated with the world-frame
/// acceleration, attitude with the body rate over the whole step.
#[derive(Debug, Clone)]
pub struct ImuPropagation {
    name: String,
    noise: ImuNoise,
}

impl ImuPropagation {
    pub fn new(noise: ImuNoise) -> Self {
        Self {
            name: "imu".to_string(),
            noise,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn noise(&self) -> &ImuNoise {
        &self.noise
    }

    /// Discrete process noise `Qd` for a step of `dt` at attitude `r_wi`.
    fn process_noise(&self, r_wi: &Matrix3<f64>, dt: f64) -> CoreMatrix {
        let mut qd = CoreMatrix::zeros();
        let accel = Matrix3::from_diagonal(&self.noise.accel_variance());
        qd.fixed_view_mut::<3, 3>(V_IDX, V_IDX)
            .copy_from(&(r_wi * accel * r_wi.transpose() * dt));
        qd.fixed_view_mut::<3, 3>(THETA_IDX, THETA_IDX)
            .copy_from(&(Matrix3::from_diagonal(&self.noise.gyro_variance()) * dt));
        qd.fixed_view_mut::<3, 3>(BW_IDX, BW_IDX)
            .copy_from(&(Matrix3::from_diagonal(&self.noise.gyro_bias_variance()) * dt));
        qd.fixed_view_mut::<3, 3>(BA_IDX, BA_IDX)
            .copy_from(&(Matrix3::from_diagonal(&self.noise.accel_bias_variance()) * dt));
        qd
    }
}

/// One step of the discrete strapdown mechanization shared by the estimator and
/// anything that needs to generate consistent ground truth.
///
/// `held` is the input valid at the start of the step, `input` the one at its end.
pub fn integrate_nav(
    nav: &NavState,
    held: &ImuMeasurement,
    input: &ImuMeasurement,
    dt: f64,
) -> NavState {
    let mean = held.midpoint(input);
    let acc = mean.linear_acceleration - nav.b_a;
    let omega = mean.angular_velocity - nav.b_w;

    let a_world = nav.q_wi * acc + Vector3::new(0.0, 0.0, -GRAVITY);

    NavState {
        p_wi: nav.p_wi + nav.v_wi * dt + a_world * (0.5 * dt * dt),
        v_wi: nav.v_wi + a_world * dt,
        q_wi: normalized(nav.q_wi * UnitQuaternion::from_scaled_axis(omega * dt)),
        b_w: nav.b_w,
        b_a: nav.b_a,
    }
}

impl PropagationSensor for ImuPropagation {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self, data: &MeasurementData) -> Result<ImuMeasurement, SensorError> {
        match data {
            MeasurementData::Imu(imu) => {
                ensure_finite(
                    &self.name,
                    imu.linear_acceleration
                        .iter()
                        .chain(imu.angular_velocity.iter()),
                )?;
                Ok(*imu)
            }
            other => Err(wrong_type(&self.name, "imu", other)),
        }
    }

    fn propagate(
        &self,
        prev: &CoreState,
        prev_timestamp: Timestamp,
        input: &ImuMeasurement,
        new_timestamp: Timestamp,
    ) -> CoreState {
        let dt = new_timestamp - prev_timestamp;
        let nav = &prev.nav;

        let mean = prev.input.midpoint(input);
        let acc = mean.linear_acceleration - nav.b_a;
        let omega = mean.angular_velocity - nav.b_w;
        let r_wi = nav.q_wi.to_rotation_matrix().into_inner();

        // --- Continuous error-state dynamics F ---
        let mut f = CoreMatrix::zeros();
        f.fixed_view_mut::<3, 3>(P_IDX, V_IDX)
            .copy_from(&Matrix3::identity());
        f.fixed_view_mut::<3, 3>(V_IDX, THETA_IDX)
            .copy_from(&(-r_wi * skew(&acc)));
        f.fixed_view_mut::<3, 3>(V_IDX, BA_IDX).copy_from(&(-r_wi));
        f.fixed_view_mut::<3, 3>(THETA_IDX, THETA_IDX)
            .copy_from(&(-skew(&omega)));
        f.fixed_view_mut::<3, 3>(THETA_IDX, BW_IDX)
            .copy_from(&(-Matrix3::identity()));

        // Second-order discretization.
        let f_dt = f * dt;
        let phi = CoreMatrix::identity() + f_dt + f_dt * f_dt * 0.5;

        let covariance = phi * prev.covariance * phi.transpose() + self.process_noise(&r_wi, dt);
        let covariance = (covariance + covariance.transpose()) * 0.5;

        CoreState {
            nav: integrate_nav(nav, &prev.input, input, dt),
            covariance,
            transition: phi,
            input: *input,
        }
    }
}
