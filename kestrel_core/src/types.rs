// kestrel_core/src/types.rs

use nalgebra::{DMatrix, DVector, SMatrix};
use serde::{Deserialize, Serialize};
use std::fmt;

// --- Core Type Aliases ---
pub type Vector = DVector<f64>;
pub type Matrix = DMatrix<f64>;

/// Dimension of the core error state: position, velocity, attitude, gyro bias, accel bias.
pub const CORE_ERROR_DIM: usize = 15;

/// Error-state sized square matrix used for the core covariance and transition.
pub type CoreMatrix = SMatrix<f64, CORE_ERROR_DIM, CORE_ERROR_DIM>;

/// Copies a fixed-size core matrix into a dynamically sized one for mixed-dimension algebra.
pub fn core_to_dynamic(m: &CoreMatrix) -> Matrix {
    Matrix::from_column_slice(CORE_ERROR_DIM, CORE_ERROR_DIM, m.as_slice())
}

/// Gravity magnitude in m/s^2. The world frame is z-up, so gravity is `(0, 0, -GRAVITY)`.
pub const GRAVITY: f64 = 9.81;

// --- Core Identifier ---
/// A stable identity for a registered sensor.
///
/// Handle `0` always belongs to the propagation sensor. Update sensors receive
/// consecutive handles in the order they are registered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SensorHandle(pub u64);

impl SensorHandle {
    /// The handle reserved for the propagation sensor.
    pub const PROPAGATION: SensorHandle = SensorHandle(0);

    pub fn is_propagation(self) -> bool {
        self == Self::PROPAGATION
    }
}

impl fmt::Display for SensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sensor#{}", self.0)
    }
}
