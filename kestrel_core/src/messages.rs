// kestrel_core/src/messages.rs

use crate::time::Timestamp;
use crate::types::SensorHandle;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

// =========================================================================
// == Sensor Payloads ==
// =========================================================================

/// A single 6-DoF IMU sample expressed in the body frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImuMeasurement {
    /// Specific force (m/s^2). A level IMU at rest reads `(0, 0, +g)`.
    pub linear_acceleration: Vector3<f64>,
    /// Angular rate (rad/s).
    pub angular_velocity: Vector3<f64>,
}

impl ImuMeasurement {
    pub fn new(linear_acceleration: Vector3<f64>, angular_velocity: Vector3<f64>) -> Self {
        Self {
            linear_acceleration,
            angular_velocity,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.linear_acceleration.iter().all(|v| v.is_finite())
            && self.angular_velocity.iter().all(|v| v.is_finite())
    }

    /// Component-wise mean of two samples.
    pub fn midpoint(&self, other: &ImuMeasurement) -> ImuMeasurement {
        ImuMeasurement {
            linear_acceleration: (self.linear_acceleration + other.linear_acceleration) * 0.5,
            angular_velocity: (self.angular_velocity + other.angular_velocity) * 0.5,
        }
    }
}

/// A self-describing container for all sensor data the estimator understands.
///
/// Each sensor model decides which variant it accepts; everything else is
/// rejected as an invalid measurement for that sensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MeasurementData {
    Imu(ImuMeasurement),
    /// Position and orientation of the sensor frame in the world frame.
    Pose {
        position: Vector3<f64>,
        orientation: UnitQuaternion<f64>,
    },
    /// Position of the sensor (antenna) in the world frame.
    Position(Vector3<f64>),
    /// Static pressure in Pa and air temperature in K.
    Pressure { pressure: f64, temperature: f64 },
}

impl MeasurementData {
    /// Short tag used in logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            MeasurementData::Imu(_) => "imu",
            MeasurementData::Pose { .. } => "pose",
            MeasurementData::Position(_) => "position",
            MeasurementData::Pressure { .. } => "pressure",
        }
    }
}

// =========================================================================
// == Ingestion Message ==
// =========================================================================

/// The generic message that carries one timestamped measurement into the estimator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementMessage {
    pub sensor_handle: SensorHandle,
    pub timestamp: Timestamp,
    pub data: MeasurementData,
}

impl MeasurementMessage {
    pub fn new(sensor_handle: SensorHandle, timestamp: Timestamp, data: MeasurementData) -> Self {
        Self {
            sensor_handle,
            timestamp,
            data,
        }
    }
}
