// kestrel_sim/src/synth.rs

//! Sensor models built from the scenario, and the measurements they would record.

use crate::config::{CalibrationPrior, SensorConfig};
use crate::error::SimError;
use crate::prng::SimulationRng;
use crate::trajectory::{TruthSample, Trajectory};
use kestrel_core::messages::{MeasurementData, MeasurementMessage};
use kestrel_core::sensors::{
    height_to_pressure, pose_calibration, PoseSensor, PositionSensor, PressureSensor, UpdateSensor,
};
use kestrel_core::states::CalibrationState;
use kestrel_core::types::{Matrix, SensorHandle, Vector};
use nalgebra::{UnitQuaternion, Vector3};
use rand_distr::{Distribution, Normal};
use tracing::debug;

// =========================================================================
// == Estimator-Side Models ==
// =========================================================================

impl SensorConfig {
    /// The update sensor the estimator uses for this configured sensor.
    pub fn build_model(&self) -> Box<dyn UpdateSensor> {
        match self {
            SensorConfig::Pose(c) => Box::new(PoseSensor::new(
                c.name.clone(),
                [c.position_std; 3],
                [c.orientation_std_deg.to_radians(); 3],
            )),
            SensorConfig::Position(c) => {
                Box::new(PositionSensor::new(c.name.clone(), [c.position_std; 3]))
            }
            SensorConfig::Pressure(c) => Box::new(PressureSensor::new(
                c.name.clone(),
                c.reference_pressure,
                c.height_std,
            )),
        }
    }

    /// The configured calibration prior in the layout of this sensor's model.
    pub fn calibration_prior(&self) -> Option<CalibrationState> {
        let prior = self.prior()?;
        Some(match self {
            SensorConfig::Pose(_) => pose_prior(prior),
            SensorConfig::Position(_) | SensorConfig::Pressure(_) => translation_prior(prior),
        })
    }
}

fn variance(std: f64, dim: usize) -> Vec<f64> {
    vec![std * std; dim]
}

fn pose_prior(prior: &CalibrationPrior) -> CalibrationState {
    let mut diagonal = variance(prior.translation_std, 3);
    diagonal.extend(variance(prior.rotation_std_deg.to_radians(), 3));
    CalibrationState::new(
        pose_calibration(&prior.extrinsic.translation(), &prior.extrinsic.rotation()),
        Matrix::from_diagonal(&Vector::from_vec(diagonal)),
    )
}

fn translation_prior(prior: &CalibrationPrior) -> CalibrationState {
    CalibrationState::new(
        Vector::from_iterator(3, prior.extrinsic.translation.iter().copied()),
        Matrix::from_diagonal(&Vector::from_vec(variance(prior.translation_std, 3))),
    )
}

// =========================================================================
// == Measurement Synthesis ==
// =========================================================================

/// Per-axis white noise of one sensor. `None` disables the noise.
#[derive(Debug, Clone)]
struct StreamNoise {
    position: Normal<f64>,
    /// Attitude noise (rad), applied as a body-side rotation.
    orientation: Normal<f64>,
}

/// Samples one configured sensor along the true trajectory.
#[derive(Debug, Clone)]
pub struct SensorStream {
    pub handle: SensorHandle,
    pub config: SensorConfig,
    noise: Option<StreamNoise>,
}

impl SensorStream {
    pub fn new(handle: SensorHandle, config: SensorConfig, with_noise: bool) -> Result<Self, SimError> {
        let noise = if with_noise {
            let (position, orientation) = match &config {
                SensorConfig::Pose(c) => (c.position_std, c.orientation_std_deg.to_radians()),
                SensorConfig::Position(c) => (c.position_std, 0.0),
                SensorConfig::Pressure(c) => (c.height_std, 0.0),
            };
            Some(StreamNoise {
                position: Normal::new(0.0, position)?,
                orientation: Normal::new(0.0, orientation)?,
            })
        } else {
            None
        };
        Ok(Self {
            handle,
            config,
            noise,
        })
    }

    /// Indices into the IMU grid at which this sensor samples.
    pub fn sample_indices(&self, imu_rate: f64, grid_len: usize) -> impl Iterator<Item = usize> {
        let stream = self.config.stream();
        let stride = ((imu_rate / stream.rate).round() as usize).max(1);
        let first = (stream.offset * imu_rate).round() as usize;
        (first..grid_len).step_by(stride)
    }

    /// Every measurement of this sensor over the trajectory, in time order.
    pub fn record(
        &self,
        trajectory: &Trajectory,
        imu_rate: f64,
        rng: &mut SimulationRng,
    ) -> Vec<MeasurementMessage> {
        let messages: Vec<_> = self
            .sample_indices(imu_rate, trajectory.len())
            .filter_map(|k| trajectory.samples().get(k))
            .map(|truth| {
                MeasurementMessage::new(self.handle, truth.timestamp, self.measure(truth, rng))
            })
            .collect();
        debug!(
            sensor = self.config.name(),
            count = messages.len(),
            "Synthesized measurements"
        );
        messages
    }

    /// What the sensor reads at `truth`.
    fn measure(&self, truth: &TruthSample, rng: &mut SimulationRng) -> MeasurementData {
        let extrinsic = self.config.extrinsic();
        let nav = &truth.nav;
        let mut position = nav.p_wi + nav.q_wi * extrinsic.translation();
        let mut orientation = nav.q_wi * extrinsic.rotation();

        if let Some(noise) = &self.noise {
            position += Vector3::from_fn(|_, _| noise.position.sample(&mut rng.0));
            if matches!(self.config, SensorConfig::Pose(_)) {
                let delta = Vector3::from_fn(|_, _| noise.orientation.sample(&mut rng.0));
                orientation *= UnitQuaternion::from_scaled_axis(delta);
            }
        }

        match &self.config {
            SensorConfig::Pose(_) => MeasurementData::Pose {
                position,
                orientation,
            },
            SensorConfig::Position(_) => MeasurementData::Position(position),
            SensorConfig::Pressure(c) => MeasurementData::Pressure {
                pressure: height_to_pressure(position.z, c.temperature, c.reference_pressure),
                temperature: c.temperature,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Extrinsic, MotionProfile, PoseConfig, PressureConfig, SimulationSection, StreamConfig,
    };
    use approx::assert_relative_eq;
    use kestrel_core::sensors::pressure_to_height;

    fn trajectory() -> Trajectory {
        let sim = SimulationSection {
            duration: 1.0,
            imu_rate: 100.0,
            ..Default::default()
        };
        Trajectory::generate(&sim, &MotionProfile::default())
    }

    fn pose_config() -> SensorConfig {
        SensorConfig::Pose(PoseConfig {
            name: "mocap".to_string(),
            stream: StreamConfig {
                rate: 20.0,
                offset: 0.02,
                ..Default::default()
            },
            extrinsic: Extrinsic {
                translation: [0.1, 0.0, -0.05],
                rotation_deg: [0.0, 0.0, 30.0],
            },
            position_std: 0.01,
            orientation_std_deg: 1.0,
            prior: None,
        })
    }

    #[test]
    fn samples_on_the_imu_grid_from_the_offset() {
        let stream = SensorStream::new(SensorHandle(1), pose_config(), false).expect("valid");
        let indices: Vec<_> = stream.sample_indices(100.0, 101).collect();
        assert_eq!(indices.first(), Some(&2));
        assert_eq!(indices[1], 7);
        assert_eq!(indices.len(), 20);
    }

    #[test]
    fn noise_free_pose_is_the_true_sensor_pose() {
        let trajectory = trajectory();
        let stream = SensorStream::new(SensorHandle(1), pose_config(), false).expect("valid");
        let mut rng = SimulationRng::from_seed(0);
        let messages = stream.record(&trajectory, 100.0, &mut rng);

        let message = &messages[3];
        let truth = trajectory.sample_at(message.timestamp).expect("in range");
        let extrinsic = stream.config.extrinsic();
        match &message.data {
            MeasurementData::Pose {
                position,
                orientation,
            } => {
                let expected = truth.nav.p_wi + truth.nav.q_wi * extrinsic.translation();
                assert_relative_eq!(*position, expected, epsilon = 1e-12);
                assert_relative_eq!(
                    orientation.angle_to(&(truth.nav.q_wi * extrinsic.rotation())),
                    0.0,
                    epsilon = 1e-9
                );
            }
            other => panic!("expected a pose, got {other:?}"),
        }
        assert_eq!(message.sensor_handle, SensorHandle(1));
    }

    #[test]
    fn pressure_encodes_the_sensor_height() {
        let config = SensorConfig::Pressure(PressureConfig {
            name: "baro".to_string(),
            stream: StreamConfig::default(),
            extrinsic: Extrinsic {
                translation: [0.0, 0.0, 0.2],
                rotation_deg: [0.0; 3],
            },
            height_std: 0.3,
            reference_pressure: 101_325.0,
            temperature: 288.15,
            prior: None,
        });
        let trajectory = trajectory();
        let stream = SensorStream::new(SensorHandle(2), config, false).expect("valid");
        let messages = stream.record(&trajectory, 100.0, &mut SimulationRng::from_seed(0));

        let first = &messages[0];
        let MeasurementData::Pressure {
            pressure,
            temperature,
        } = first.data
        else {
            panic!("expected a pressure reading");
        };
        // Level at t = 0, so the sensor sits 0.2 m above the body origin.
        assert_relative_eq!(
            pressure_to_height(pressure, temperature, 101_325.0),
            5.2,
            epsilon = 1e-9
        );
    }

    #[test]
    fn pose_prior_uses_the_pose_calibration_layout() {
        let mut config = pose_config();
        if let SensorConfig::Pose(c) = &mut config {
            c.prior = Some(CalibrationPrior {
                extrinsic: c.extrinsic,
                translation_std: 0.05,
                rotation_std_deg: 2.0,
            });
        }
        let prior = config.calibration_prior().expect("configured");
        let model = config.build_model();

        assert_eq!(prior.values.len(), 7);
        assert_eq!(prior.error_dim(), model.calibration_dim());
        assert_relative_eq!(prior.covariance[(0, 0)], 0.0025, epsilon = 1e-15);
        assert_relative_eq!(
            prior.covariance[(5, 5)],
            2f64.to_radians().powi(2),
            epsilon = 1e-15
        );
    }
}
