// kestrel_core/src/config.rs

use crate::error::{EstimatorError, Result};
use crate::states::{BA_IDX, BW_IDX, P_IDX, THETA_IDX, V_IDX};
use crate::types::CoreMatrix;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

// =========================================================================
// == Estimator Configuration ==
// =========================================================================

/// Tuning parameters of one estimator instance.
///
/// Every field has a default, so an empty `[estimator]` table is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EstimatorConfig {
    /// Two timestamps closer than this (seconds) are treated as the same instant.
    pub timestamp_epsilon: f64,
    /// Size bound of the history buffer; the oldest entries are evicted beyond it.
    pub max_buffer_entries: usize,
    /// Optional time bound (seconds behind the latest entry) for buffer retention.
    pub retention_horizon: Option<f64>,
    /// Consecutive numerical rejections after which the estimate is flagged degraded.
    pub degraded_after: u32,
    pub imu_noise: ImuNoise,
    pub initial_core_std: CoreStd,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            timestamp_epsilon: 1e-6,
            max_buffer_entries: 2000,
            retention_horizon: None,
            degraded_after: 3,
            imu_noise: ImuNoise::default(),
            initial_core_std: CoreStd::default(),
        }
    }
}

impl EstimatorConfig {
    /// Rejects values that would make the ordering logic or the filter meaningless.
    pub fn validate(&self) -> Result<()> {
        if !(self.timestamp_epsilon.is_finite() && self.timestamp_epsilon > 0.0) {
            return Err(EstimatorError::InvalidConfig(format!(
                "timestamp_epsilon must be positive, got {}",
                self.timestamp_epsilon
            )));
        }
        if self.max_buffer_entries < 2 {
            return Err(EstimatorError::InvalidConfig(format!(
                "max_buffer_entries must be at least 2, got {}",
                self.max_buffer_entries
            )));
        }
        if self.degraded_after == 0 {
            return Err(EstimatorError::InvalidConfig(
                "degraded_after must be at least 1".to_string(),
            ));
        }
        if let Some(horizon) = self.retention_horizon {
            if !(horizon.is_finite() && horizon > 0.0) {
                return Err(EstimatorError::InvalidConfig(format!(
                    "retention_horizon must be positive, got {horizon}"
                )));
            }
        }
        self.imu_noise.validate()?;
        self.initial_core_std.validate()
    }
}

/// Continuous-time IMU noise densities, per axis, as standard deviations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImuNoise {
    /// Gyroscope white noise (rad/s/√Hz).
    pub gyro_noise: [f64; 3],
    /// Gyroscope bias random walk (rad/s²/√Hz).
    pub gyro_bias_noise: [f64; 3],
    /// Accelerometer white noise (m/s²/√Hz).
    pub accel_noise: [f64; 3],
    /// Accelerometer bias random walk (m/s³/√Hz).
    pub accel_bias_noise: [f64; 3],
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self {
            gyro_noise: [0.013; 3],
            gyro_bias_noise: [0.0013; 3],
            accel_noise: [0.083; 3],
            accel_bias_noise: [0.0083; 3],
        }
    }
}

impl ImuNoise {
    pub fn gyro_variance(&self) -> Vector3<f64> {
        squared(&self.gyro_noise)
    }

    pub fn gyro_bias_variance(&self) -> Vector3<f64> {
        squared(&self.gyro_bias_noise)
    }

    pub fn accel_variance(&self) -> Vector3<f64> {
        squared(&self.accel_noise)
    }

    pub fn accel_bias_variance(&self) -> Vector3<f64> {
        squared(&self.accel_bias_noise)
    }

    fn validate(&self) -> Result<()> {
        let all = self
            .gyro_noise
            .iter()
            .chain(&self.gyro_bias_noise)
            .chain(&self.accel_noise)
            .chain(&self.accel_bias_noise);
        for value in all {
            if !(value.is_finite() && *value >= 0.0) {
                return Err(EstimatorError::InvalidConfig(format!(
                    "IMU noise must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Standard deviations of the initial core covariance, one value per 3-block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreStd {
    pub position: f64,
    pub velocity: f64,
    /// Attitude error (rad).
    pub orientation: f64,
    pub gyro_bias: f64,
    pub accel_bias: f64,
}

impl Default for CoreStd {
    fn default() -> Self {
        Self {
            position: 0.5,
            velocity: 0.3,
            orientation: 10f64.to_radians(),
            gyro_bias: 0.01,
            accel_bias: 0.1,
        }
    }
}

impl CoreStd {
    /// The diagonal initial covariance these deviations describe.
    pub fn covariance(&self) -> CoreMatrix {
        let mut p = CoreMatrix::zeros();
        for (idx, std) in [
            (P_IDX, self.position),
            (V_IDX, self.velocity),
            (THETA_IDX, self.orientation),
            (BW_IDX, self.gyro_bias),
            (BA_IDX, self.accel_bias),
        ] {
            p.fixed_view_mut::<3, 3>(idx, idx).fill_diagonal(std * std);
        }
        p
    }

    fn validate(&self) -> Result<()> {
        for value in [
            self.position,
            self.velocity,
            self.orientation,
            self.gyro_bias,
            self.accel_bias,
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(EstimatorError::InvalidConfig(format!(
                    "initial core standard deviations must be non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

fn squared(values: &[f64; 3]) -> Vector3<f64> {
    Vector3::from(*values).map(|v| v * v)
}
