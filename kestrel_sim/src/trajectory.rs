// kestrel_sim/src/trajectory.rs

//! Ground-truth motion and the IMU samples that produce it.

use crate::config::{MotionProfile, SimulationSection};
use crate::error::SimError;
use crate::prng::SimulationRng;
use kestrel_core::config::ImuNoise;
use kestrel_core::messages::ImuMeasurement;
use kestrel_core::sensors::integrate_nav;
use kestrel_core::states::NavState;
use kestrel_core::time::Timestamp;
use kestrel_core::types::GRAVITY;
use nalgebra::Vector3;
use rand_distr::{Distribution, Normal};
use std::f64::consts::TAU;

/// The true state at one IMU sample, and the error-free IMU reading there.
#[derive(Debug, Clone, PartialEq)]
pub struct TruthSample {
    pub timestamp: Timestamp,
    pub nav: NavState,
    pub imu: ImuMeasurement,
}

/// Ground truth on the IMU grid.
///
/// The truth is defined as the strapdown integration of the clean IMU samples,
/// so a filter fed those samples reproduces it exactly.
#[derive(Debug, Clone)]
pub struct Trajectory {
    samples: Vec<TruthSample>,
}

fn sinusoid(offset: &[f64; 3], amplitude: &[f64; 3], frequency: &[f64; 3], t: f64) -> Vector3<f64> {
    Vector3::from_fn(|i, _| offset[i] + amplitude[i] * (TAU * frequency[i] * t).sin())
}

impl MotionProfile {
    /// PURE FUNCTION: Kinematic body-frame acceleration at `t`.
    pub fn body_acceleration(&self, t: f64) -> Vector3<f64> {
        sinusoid(&[0.0; 3], &self.accel_amplitude, &self.accel_frequency, t)
    }

    /// PURE FUNCTION: Body angular rate at `t`.
    pub fn angular_velocity(&self, t: f64) -> Vector3<f64> {
        sinusoid(&self.gyro_offset, &self.gyro_amplitude, &self.gyro_frequency, t)
    }
}

impl Trajectory {
    pub fn generate(sim: &SimulationSection, motion: &MotionProfile) -> Self {
        let dt = sim.imu_dt();
        let steps = (sim.duration * sim.imu_rate).round() as usize;
        let gravity = Vector3::new(0.0, 0.0, GRAVITY);

        let mut nav = NavState::new(Vector3::from(sim.initial_position), sim.initial_orientation());
        let mut imu = ImuMeasurement::new(
            motion.body_acceleration(0.0) + nav.q_wi.inverse() * gravity,
            motion.angular_velocity(0.0),
        );
        let mut samples = Vec::with_capacity(steps + 1);
        samples.push(TruthSample {
            timestamp: Timestamp::ZERO,
            nav: nav.clone(),
            imu,
        });

        for k in 1..=steps {
            let timestamp = Timestamp::new(k as f64 * dt);
            let step = timestamp - samples[k - 1].timestamp;
            let t = timestamp.seconds();

            // Attitude only depends on the gyro, so the new orientation is known
            // before the specific force at the end of the step is.
            let gyro = motion.angular_velocity(t);
            let rotation_only = ImuMeasurement::new(Vector3::zeros(), gyro);
            let q_next = integrate_nav(&nav, &imu, &rotation_only, step).q_wi;

            let next = ImuMeasurement::new(
                motion.body_acceleration(t) + q_next.inverse() * gravity,
                gyro,
            );
            nav = integrate_nav(&nav, &imu, &next, step);
            imu = next;
            samples.push(TruthSample {
                timestamp,
                nav: nav.clone(),
                imu,
            });
        }
        Self { samples }
    }

    pub fn samples(&self) -> &[TruthSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The sample closest to `timestamp`.
    pub fn sample_at(&self, timestamp: Timestamp) -> Option<&TruthSample> {
        let index = self
            .samples
            .partition_point(|s| s.timestamp < timestamp)
            .min(self.samples.len().saturating_sub(1));
        let candidate = self.samples.get(index)?;
        match index.checked_sub(1).and_then(|i| self.samples.get(i)) {
            Some(before) if (timestamp - before.timestamp) < (candidate.timestamp - timestamp) => {
                Some(before)
            }
            _ => Some(candidate),
        }
    }
}

/// Adds white noise to IMU samples, with discrete deviations `density * sqrt(rate)`.
#[derive(Debug, Clone)]
pub struct ImuNoiseModel {
    accel: [Normal<f64>; 3],
    gyro: [Normal<f64>; 3],
}

impl ImuNoiseModel {
    pub fn new(noise: &ImuNoise, imu_rate: f64) -> Result<Self, SimError> {
        let scale = imu_rate.sqrt();
        let normal = |density: f64| Normal::new(0.0, density * scale);
        Ok(Self {
            accel: [
                normal(noise.accel_noise[0])?,
                normal(noise.accel_noise[1])?,
                normal(noise.accel_noise[2])?,
            ],
            gyro: [
                normal(noise.gyro_noise[0])?,
                normal(noise.gyro_noise[1])?,
                normal(noise.gyro_noise[2])?,
            ],
        })
    }

    pub fn corrupt(&self, clean: &ImuMeasurement, rng: &mut SimulationRng) -> ImuMeasurement {
        ImuMeasurement::new(
            clean.linear_acceleration
                + Vector3::from_fn(|i, _| self.accel[i].sample(&mut rng.0)),
            clean.angular_velocity + Vector3::from_fn(|i, _| self.gyro[i].sample(&mut rng.0)),
        )
    }
}
