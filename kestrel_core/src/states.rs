// kestrel_core/src/states.rs

use crate::messages::ImuMeasurement;
use crate::time::Timestamp;
use crate::types::{core_to_dynamic, CoreMatrix, Matrix, SensorHandle, Vector, CORE_ERROR_DIM};
use nalgebra::{DVectorView, Quaternion, UnitQuaternion, Vector3};
use std::fmt;

// --- Error-state block offsets ---
pub const P_IDX: usize = 0;
pub const V_IDX: usize = 3;
pub const THETA_IDX: usize = 6;
pub const BW_IDX: usize = 9;
pub const BA_IDX: usize = 12;

/// The nominal navigation state of the body (IMU) frame in the world frame.
#[derive(Debug, Clone, PartialEq)]
pub struct NavState {
    /// Position of the body in the world frame.
    pub p_wi: Vector3<f64>,
    /// Velocity of the body in the world frame.
    pub v_wi: Vector3<f64>,
    /// Rotation from body to world.
    pub q_wi: UnitQuaternion<f64>,
    /// Gyroscope bias.
    pub b_w: Vector3<f64>,
    /// Accelerometer bias.
    pub b_a: Vector3<f64>,
}

impl Default for NavState {
    fn default() -> Self {
        Self {
            p_wi: Vector3::zeros(),
            v_wi: Vector3::zeros(),
            q_wi: UnitQuaternion::identity(),
            b_w: Vector3::zeros(),
            b_a: Vector3::zeros(),
        }
    }
}

impl NavState {
    pub fn new(p_wi: Vector3<f64>, q_wi: UnitQuaternion<f64>) -> Self {
        Self {
            p_wi,
            q_wi,
            ..Default::default()
        }
    }

    /// Applies a 15-element error-state correction `[δp, δv, δθ, δb_w, δb_a]`.
    ///
    /// The attitude error is a body-frame perturbation: `q ← q ⊗ exp(δθ)`.
    pub fn boxplus(&self, delta: DVectorView<f64>) -> NavState {
        debug_assert_eq!(delta.nrows(), CORE_ERROR_DIM);
        let block = |idx: usize| Vector3::new(delta[idx], delta[idx + 1], delta[idx + 2]);

        NavState {
            p_wi: self.p_wi + block(P_IDX),
            v_wi: self.v_wi + block(V_IDX),
            q_wi: normalized(self.q_wi * UnitQuaternion::from_scaled_axis(block(THETA_IDX))),
            b_w: self.b_w + block(BW_IDX),
            b_a: self.b_a + block(BA_IDX),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.p_wi.iter().all(|v| v.is_finite())
            && self.v_wi.iter().all(|v| v.is_finite())
            && self.q_wi.coords.iter().all(|v| v.is_finite())
            && self.b_w.iter().all(|v| v.is_finite())
            && self.b_a.iter().all(|v| v.is_finite())
    }
}

/// Re-normalizes a quaternion so numerical drift never accumulates in the orientation.
pub fn normalized(q: UnitQuaternion<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::new_normalize(q.into_inner())
}

/// Builds a unit quaternion from `[x, y, z, w]` storage, the layout used for
/// quaternions inside calibration vectors.
pub fn quaternion_from_xyzw(x: f64, y: f64, z: f64, w: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::new_normalize(Quaternion::new(w, x, y, z))
}

/// The core state at one instant: nominal state, error covariance and the
/// bookkeeping needed to replay and correlate later updates.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreState {
    pub nav: NavState,
    /// Error-state covariance `P` (15x15).
    pub covariance: CoreMatrix,
    /// Error-state transition from the preceding buffer entry to this one.
    pub transition: CoreMatrix,
    /// Propagation input held at this instant.
    pub input: ImuMeasurement,
}

impl CoreState {
    pub fn new(nav: NavState, covariance: CoreMatrix, input: ImuMeasurement) -> Self {
        Self {
            nav,
            covariance,
            transition: CoreMatrix::identity(),
            input,
        }
    }

    /// The same state, carried across a zero-length step.
    pub fn held(&self) -> CoreState {
        CoreState {
            transition: CoreMatrix::identity(),
            ..self.clone()
        }
    }
}

/// Calibration (extrinsic/intrinsic) parameters of one update sensor.
///
/// `values` is the nominal parameter vector in the sensor's own layout, while
/// `covariance` is expressed in its error space, whose size is the sensor's
/// `calibration_dim()`. The two may differ in length (a quaternion takes four
/// nominal entries but three error states).
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationState {
    pub values: Vector,
    pub covariance: Matrix,
}

impl CalibrationState {
    pub fn new(values: Vector, covariance: Matrix) -> Self {
        Self { values, covariance }
    }

    pub fn error_dim(&self) -> usize {
        self.covariance.nrows()
    }
}

/// One sensor's view of the filter after an update: its calibration and the
/// correlation of that calibration with the core error state.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    pub calibration: CalibrationState,
    /// Cross-covariance between core and calibration error (15 x n).
    pub cross_covariance: Matrix,
}

/// Where one update sensor's calibration lives inside a [`CalibrationSet`].
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationBlock {
    pub sensor: SensorHandle,
    /// Offset of the block in the calibration error state.
    pub offset: usize,
    pub dim: usize,
    pub values: Vector,
}

/// The calibrations of every update sensor seen so far, with their joint covariance.
///
/// Together with the core state this is the full error state of the filter,
/// `[core (15), block 0, block 1, ...]`. Blocks are appended in the order the
/// sensors first contribute a measurement. Keeping calibration-to-calibration
/// correlations means an update of one sensor correctly moves the others.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSet {
    blocks: Vec<CalibrationBlock>,
    /// Core-calibration cross-covariance (15 x N).
    cross_covariance: Matrix,
    /// Calibration covariance (N x N).
    covariance: Matrix,
}

impl Default for CalibrationSet {
    fn default() -> Self {
        Self {
            blocks: Vec::new(),
            cross_covariance: Matrix::zeros(CORE_ERROR_DIM, 0),
            covariance: Matrix::zeros(0, 0),
        }
    }
}

impl CalibrationSet {
    /// Total calibration error dimension `N`.
    pub fn dim(&self) -> usize {
        self.covariance.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[CalibrationBlock] {
        &self.blocks
    }

    pub(crate) fn blocks_mut(&mut self) -> &mut [CalibrationBlock] {
        &mut self.blocks
    }

    pub fn block(&self, sensor: SensorHandle) -> Option<&CalibrationBlock> {
        self.blocks.iter().find(|b| b.sensor == sensor)
    }

    pub fn contains(&self, sensor: SensorHandle) -> bool {
        self.block(sensor).is_some()
    }

    /// Appends a sensor's calibration, uncorrelated with everything else.
    pub fn introduce(&mut self, sensor: SensorHandle, calibration: &CalibrationState) {
        let old = self.dim();
        let n = calibration.error_dim();

        let mut cross = Matrix::zeros(CORE_ERROR_DIM, old + n);
        cross.columns_mut(0, old).copy_from(&self.cross_covariance);
        let mut covariance = Matrix::zeros(old + n, old + n);
        covariance
            .view_mut((0, 0), (old, old))
            .copy_from(&self.covariance);
        covariance
            .view_mut((old, old), (n, n))
            .copy_from(&calibration.covariance);

        self.blocks.push(CalibrationBlock {
            sensor,
            offset: old,
            dim: n,
            values: calibration.values.clone(),
        });
        self.cross_covariance = cross;
        self.covariance = covariance;
    }

    /// Moves the core-calibration correlation across one core transition.
    /// Calibrations are static, so their own covariance is unchanged.
    pub fn propagate(&mut self, transition: &CoreMatrix) {
        if !self.is_empty() {
            self.cross_covariance = core_to_dynamic(transition) * &self.cross_covariance;
        }
    }

    /// `[[P_cc, P_cs], [P_csᵀ, P_ss]]` over the full error state.
    pub fn joint_covariance(&self, core: &CoreMatrix) -> Matrix {
        let n = self.dim();
        let mut p = Matrix::zeros(CORE_ERROR_DIM + n, CORE_ERROR_DIM + n);
        p.view_mut((0, 0), (CORE_ERROR_DIM, CORE_ERROR_DIM))
            .copy_from(&core_to_dynamic(core));
        p.view_mut((0, CORE_ERROR_DIM), (CORE_ERROR_DIM, n))
            .copy_from(&self.cross_covariance);
        p.view_mut((CORE_ERROR_DIM, 0), (n, CORE_ERROR_DIM))
            .copy_from(&self.cross_covariance.transpose());
        p.view_mut((CORE_ERROR_DIM, CORE_ERROR_DIM), (n, n))
            .copy_from(&self.covariance);
        p
    }

    /// Takes the calibration blocks of a full-state covariance laid out as
    /// [`Self::joint_covariance`].
    pub(crate) fn set_joint_covariance(&mut self, joint: &Matrix) {
        let n = self.dim();
        self.cross_covariance = joint
            .view((0, CORE_ERROR_DIM), (CORE_ERROR_DIM, n))
            .into_owned();
        self.covariance = joint
            .view((CORE_ERROR_DIM, CORE_ERROR_DIM), (n, n))
            .into_owned();
    }

    /// The marginal calibration state of one sensor.
    pub fn calibration(&self, sensor: SensorHandle) -> Option<CalibrationState> {
        let block = self.block(sensor)?;
        Some(CalibrationState::new(
            block.values.clone(),
            self.covariance
                .view((block.offset, block.offset), (block.dim, block.dim))
                .into_owned(),
        ))
    }

    pub fn snapshot(&self, sensor: SensorHandle) -> Option<SensorSnapshot> {
        let block = self.block(sensor)?;
        Some(SensorSnapshot {
            calibration: self.calibration(sensor)?,
            cross_covariance: self.cross_covariance.columns(block.offset, block.dim).into_owned(),
        })
    }
}

/// The resolved estimate at one buffer entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub timestamp: Timestamp,
    /// The sensor whose measurement produced this snapshot.
    pub sensor: SensorHandle,
    pub core: CoreState,
    /// Every calibration known at this instant, jointly with the core.
    pub calibrations: CalibrationSet,
    /// Calibration of `sensor` after this snapshot; `None` for propagation entries.
    pub sensor_state: Option<SensorSnapshot>,
}

impl fmt::Display for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nav = &self.core.nav;
        let q = nav.q_wi.coords;
        write!(
            f,
            "t={} {} p=[{:.4}, {:.4}, {:.4}] v=[{:.4}, {:.4}, {:.4}] q=[w {:.5}, {:.5}, {:.5}, {:.5}]",
            self.timestamp,
            self.sensor,
            nav.p_wi.x,
            nav.p_wi.y,
            nav.p_wi.z,
            nav.v_wi.x,
            nav.v_wi.y,
            nav.v_wi.z,
            q.w,
            q.x,
            q.y,
            q.z
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    #[test]
    fn boxplus_applies_every_block() {
        let nav = NavState::new(Vector3::new(1.0, 2.0, 3.0), UnitQuaternion::identity());
        let mut delta = DVector::zeros(CORE_ERROR_DIM);
        delta[P_IDX] = 0.5;
        delta[V_IDX + 1] = -1.0;
        delta[THETA_IDX + 2] = 0.1;
        delta[BW_IDX] = 0.01;
        delta[BA_IDX + 2] = 0.02;

        let corrected = nav.boxplus(delta.rows(0, CORE_ERROR_DIM));

        assert_relative_eq!(corrected.p_wi, Vector3::new(1.5, 2.0, 3.0), epsilon = 1e-12);
        assert_relative_eq!(corrected.v_wi, Vector3::new(0.0, -1.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(corrected.q_wi.angle(), 0.1, epsilon = 1e-12);
        assert_relative_eq!(corrected.q_wi.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(corrected.b_w.x, 0.01, epsilon = 1e-12);
        assert_relative_eq!(corrected.b_a.z, 0.02, epsilon = 1e-12);
    }

    fn lever_arm(std: f64) -> CalibrationState {
        CalibrationState::new(DVector::zeros(3), Matrix::identity(3, 3) * (std * std))
    }

    #[test]
    fn introduced_blocks_start_uncorrelated() {
        let mut set = CalibrationSet::default();
        set.introduce(SensorHandle(2), &lever_arm(0.1));
        set.introduce(SensorHandle(1), &lever_arm(0.5));

        assert_eq!(set.dim(), 6);
        assert_eq!(set.block(SensorHandle(1)).map(|b| b.offset), Some(3));
        let joint = set.joint_covariance(&CoreMatrix::identity());
        assert_eq!(joint.nrows(), CORE_ERROR_DIM + 6);
        assert_relative_eq!(joint[(CORE_ERROR_DIM, CORE_ERROR_DIM)], 0.01, epsilon = 1e-15);
        assert_relative_eq!(joint[(CORE_ERROR_DIM + 3, CORE_ERROR_DIM + 3)], 0.25, epsilon = 1e-15);
        assert_eq!(joint[(CORE_ERROR_DIM, CORE_ERROR_DIM + 3)], 0.0);
        assert_eq!(joint[(0, CORE_ERROR_DIM)], 0.0);
        assert!(set.calibration(SensorHandle(3)).is_none());
    }

    #[test]
    fn propagation_moves_only_the_cross_covariance() {
        let mut set = CalibrationSet::default();
        set.introduce(SensorHandle(1), &lever_arm(1.0));
        let mut joint = set.joint_covariance(&CoreMatrix::identity());
        joint[(0, CORE_ERROR_DIM)] = 1.0;
        joint[(CORE_ERROR_DIM, 0)] = 1.0;
        set.set_joint_covariance(&joint);

        let mut transition = CoreMatrix::identity();
        transition[(3, 0)] = 2.0;
        set.propagate(&transition);

        let snapshot = set.snapshot(SensorHandle(1)).expect("introduced");
        assert_relative_eq!(snapshot.cross_covariance[(0, 0)], 1.0);
        assert_relative_eq!(snapshot.cross_covariance[(3, 0)], 2.0);
        assert_relative_eq!(snapshot.calibration.covariance, Matrix::identity(3, 3));
    }
}
