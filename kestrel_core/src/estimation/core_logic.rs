// kestrel_core/src/estimation/core_logic.rs

use crate::buffer::{BufferEntry, HistoryBuffer};
use crate::config::EstimatorConfig;
use crate::error::{EstimatorError, NumericalIssue, Result};
use crate::estimation::ekf;
use crate::messages::{MeasurementData, MeasurementMessage};
use crate::sensors::{PropagationSensor, UpdateSensor};
use crate::states::{
    normalized, CalibrationSet, CalibrationState, CoreState, NavState, StateSnapshot,
};
use crate::time::Timestamp;
use crate::types::{Matrix, SensorHandle, Vector, CORE_ERROR_DIM};
use nalgebra::{UnitQuaternion, Vector3};
use thiserror::Error;
use tracing::{debug, info, warn};

// =========================================================================
// == Reporting Types ==
// =========================================================================

/// A measurement-level contingency. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Diagnostic {
    #[error("{sensor} measurement at {timestamp} predates the oldest retained state at {oldest}")]
    StaleMeasurementDropped {
        sensor: SensorHandle,
        timestamp: Timestamp,
        oldest: Timestamp,
    },

    #[error("{sensor} measurement at {timestamp} is invalid: {reason}")]
    InvalidMeasurement {
        sensor: SensorHandle,
        timestamp: Timestamp,
        reason: String,
    },

    #[error("{sensor} update at {timestamp} aborted: {issue}")]
    NumericalInstability {
        sensor: SensorHandle,
        timestamp: Timestamp,
        issue: NumericalIssue,
    },
}

/// What happened to one call of [`Estimator::process_measurement`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Held until [`Estimator::initialize`] is called.
    Queued,
    /// Resolved into the buffer; `replayed` later entries were recomputed.
    Applied { replayed: usize },
    /// Skipped without touching the estimate.
    Rejected(Diagnostic),
}

/// Running counters over the lifetime of an estimator (reset by [`Estimator::reset`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub applied: u64,
    pub queued: u64,
    /// Measurements that arrived behind the latest buffered timestamp.
    pub out_of_order: u64,
    /// Total number of buffer entries recomputed by repropagation.
    pub replayed_entries: u64,
    pub stale_dropped: u64,
    pub invalid: u64,
    pub numerical: u64,
    pub evicted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorStatus {
    Uninitialized,
    Ready,
}

#[derive(Debug, Clone)]
struct RegisteredSensor {
    model: Box<dyn UpdateSensor>,
    prior: CalibrationState,
    /// Set once a measurement of this sensor entered the buffer; the prior is frozen from then on.
    contributed: bool,
}

enum Resolution {
    Resolved(StateSnapshot),
    /// The entry could not be processed and must leave the buffer.
    Failed(Diagnostic),
}

// =========================================================================
// == Estimator ==
// =========================================================================

/// The estimation controller: owns the history buffer, the propagation sensor and
/// the registered update sensors, and keeps every buffered snapshot equal to what
/// strictly time-ordered processing would have produced.
#[derive(Debug, Clone)]
pub struct Estimator {
    config: EstimatorConfig,
    propagation: Box<dyn PropagationSensor>,
    /// Update sensors; the sensor at index `i` has handle `i + 1`.
    sensors: Vec<RegisteredSensor>,
    buffer: HistoryBuffer,
    status: EstimatorStatus,
    consecutive_failures: u32,
    diagnostics: Diagnostics,
    replay_diagnostics: Vec<Diagnostic>,
}

impl Estimator {
    pub fn new(config: EstimatorConfig, propagation: Box<dyn PropagationSensor>) -> Result<Self> {
        config.validate()?;
        info!(
            propagation = propagation.name(),
            epsilon = config.timestamp_epsilon,
            max_entries = config.max_buffer_entries,
            "Estimator created"
        );
        let buffer = HistoryBuffer::new(config.timestamp_epsilon);
        Ok(Self {
            config,
            propagation,
            sensors: Vec::new(),
            buffer,
            status: EstimatorStatus::Uninitialized,
            consecutive_failures: 0,
            diagnostics: Diagnostics::default(),
            replay_diagnostics: Vec::new(),
        })
    }

    // --- Setup ---

    /// Registers an update sensor and returns its handle. Only allowed before the
    /// first measurement is buffered.
    pub fn register_update_sensor(&mut self, sensor: Box<dyn UpdateSensor>) -> Result<SensorHandle> {
        if !self.buffer.is_empty() {
            return Err(EstimatorError::InvalidTransition(
                "update sensors must be registered before the first measurement".to_string(),
            ));
        }
        let handle = SensorHandle(self.sensors.len() as u64 + 1);
        let prior = sensor.default_calibration();
        check_calibration(handle, sensor.as_ref(), &prior)?;

        info!(
            %handle,
            name = sensor.name(),
            calibration_dim = sensor.calibration_dim(),
            "Registered update sensor"
        );
        self.sensors.push(RegisteredSensor {
            model: sensor,
            prior,
            contributed: false,
        });
        Ok(handle)
    }

    /// Replaces the initial calibration (value and covariance) of an update sensor.
    ///
    /// Must be called before that sensor's first measurement is buffered. The rule
    /// holds until [`Estimator::reset`], even after those measurements are evicted.
    pub fn set_calibration_prior(
        &mut self,
        handle: SensorHandle,
        calibration: CalibrationState,
    ) -> Result<()> {
        let index = self.sensor_index(handle)?;
        check_calibration(handle, self.sensors[index].model.as_ref(), &calibration)?;
        if self.sensors[index].contributed {
            return Err(EstimatorError::InvalidTransition(format!(
                "{handle} already contributed measurements; its prior can no longer change"
            )));
        }
        info!(%handle, "Calibration prior set");
        self.sensors[index].prior = calibration;
        Ok(())
    }

    /// Seeds the state at the most recent queued propagation measurement.
    ///
    /// Queued entries before it are discarded; queued update measurements after it
    /// are processed in time order.
    pub fn initialize(
        &mut self,
        position: Vector3<f64>,
        orientation: UnitQuaternion<f64>,
    ) -> Result<()> {
        if self.status == EstimatorStatus::Ready {
            return Err(EstimatorError::InvalidTransition(
                "estimator is already initialized".to_string(),
            ));
        }
        if !(position.iter().all(|v| v.is_finite())
            && orientation.coords.iter().all(|v| v.is_finite()))
        {
            return Err(EstimatorError::InvalidTransition(
                "initial pose must be finite".to_string(),
            ));
        }
        let seed_index = self
            .buffer
            .iter()
            .rposition(|e| e.sensor.is_propagation())
            .ok_or_else(|| {
                EstimatorError::InvalidTransition(
                    "initialize requires a propagation measurement first".to_string(),
                )
            })?;

        let (timestamp, input) = match self.buffer.get(seed_index) {
            Some(seed) => (
                seed.timestamp,
                self.propagation.input(seed.measurement()).map_err(|e| {
                    EstimatorError::InvalidTransition(format!("seed measurement rejected: {e}"))
                })?,
            ),
            None => return Err(EstimatorError::EmptyBuffer),
        };

        let core = CoreState::new(
            NavState::new(position, normalized(orientation)),
            self.config.initial_core_std.covariance(),
            input,
        );
        self.buffer.discard_front(seed_index);
        self.buffer.set_snapshot(
            0,
            StateSnapshot {
                timestamp,
                sensor: SensorHandle::PROPAGATION,
                core,
                calibrations: CalibrationSet::default(),
                sensor_state: None,
            },
        );
        self.replay_diagnostics.clear();
        self.status = EstimatorStatus::Ready;

        info!(
            %timestamp,
            discarded = seed_index,
            queued = self.buffer.len() - 1,
            "Estimator initialized"
        );
        let replayed = self.replay_from(1)?;
        self.diagnostics.applied += replayed as u64 + 1;
        self.enforce_retention();
        Ok(())
    }

    /// Back to `Uninitialized` with an empty buffer. Registered sensors and their
    /// priors are kept, and priors may be replaced again.
    pub fn reset(&mut self) {
        self.buffer.clear();
        for sensor in &mut self.sensors {
            sensor.contributed = false;
        }
        self.replay_diagnostics.clear();
        self.status = EstimatorStatus::Uninitialized;
        self.consecutive_failures = 0;
        self.diagnostics = Diagnostics::default();
        info!("Estimator reset");
    }

    // --- Ingestion ---

    pub fn process_message(&mut self, message: &MeasurementMessage) -> Result<ProcessOutcome> {
        self.process_measurement(message.sensor_handle, message.timestamp, message.data.clone())
    }

    /// Ingests one measurement, in arrival order.
    ///
    /// Measurement-level problems come back as [`ProcessOutcome::Rejected`]; an
    /// `Err` means the estimator's own bookkeeping is inconsistent.
    pub fn process_measurement(
        &mut self,
        sensor: SensorHandle,
        timestamp: Timestamp,
        data: MeasurementData,
    ) -> Result<ProcessOutcome> {
        self.replay_diagnostics.clear();

        if !timestamp.is_finite() {
            return Ok(self.reject(Diagnostic::InvalidMeasurement {
                sensor,
                timestamp,
                reason: "timestamp is not finite".to_string(),
            }));
        }
        if let Err(reason) = self.validate(sensor, &data) {
            return Ok(self.reject(Diagnostic::InvalidMeasurement {
                sensor,
                timestamp,
                reason,
            }));
        }

        let entry = BufferEntry::pending(timestamp, sensor, data);
        match self.status {
            EstimatorStatus::Uninitialized => {
                self.buffer.insert(entry);
                self.mark_contributed(sensor);
                self.diagnostics.queued += 1;
                debug!(%sensor, %timestamp, "Queued measurement until initialization");
                self.enforce_retention();
                Ok(ProcessOutcome::Queued)
            }
            EstimatorStatus::Ready => self.apply(entry),
        }
    }

    // --- Queries ---

    pub fn get_latest_state(&self) -> Result<&StateSnapshot> {
        self.buffer.get_latest()
    }

    pub fn get_latest_state_for(&self, sensor: SensorHandle) -> Result<&StateSnapshot> {
        if !sensor.is_propagation() {
            self.sensor_index(sensor)?;
        }
        self.buffer.get_latest_for(sensor)
    }

    /// The calibration estimate of an update sensor at the latest state. Updates of
    /// other sensors refine it too, through the joint covariance.
    pub fn latest_calibration(&self, sensor: SensorHandle) -> Result<CalibrationState> {
        self.sensor_index(sensor)?;
        self.buffer
            .get_latest()?
            .calibrations
            .calibration(sensor)
            .ok_or(EstimatorError::NoEntryForSensor(sensor))
    }

    pub fn status(&self) -> EstimatorStatus {
        self.status
    }

    pub fn is_initialized(&self) -> bool {
        self.status == EstimatorStatus::Ready
    }

    /// True after `degraded_after` consecutive numerically failed updates.
    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= self.config.degraded_after
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Problems met while replaying history during the last call.
    pub fn replay_diagnostics(&self) -> &[Diagnostic] {
        &self.replay_diagnostics
    }

    pub fn buffer(&self) -> &HistoryBuffer {
        &self.buffer
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn sensor_name(&self, sensor: SensorHandle) -> Option<&str> {
        if sensor.is_propagation() {
            return Some(self.propagation.name());
        }
        let index = self.sensor_index(sensor).ok()?;
        self.sensors.get(index).map(|s| s.model.name())
    }

    // --- Internals ---

    fn sensor_index(&self, sensor: SensorHandle) -> Result<usize> {
        match sensor.0 as usize {
            0 => Err(EstimatorError::UnknownSensor(sensor)),
            n if n <= self.sensors.len() => Ok(n - 1),
            _ => Err(EstimatorError::UnknownSensor(sensor)),
        }
    }

    fn mark_contributed(&mut self, sensor: SensorHandle) {
        if let Some(registered) = self
            .sensor_index(sensor)
            .ok()
            .and_then(|i| self.sensors.get_mut(i))
        {
            registered.contributed = true;
        }
    }

    fn validate(&self, sensor: SensorHandle, data: &MeasurementData) -> std::result::Result<(), String> {
        if sensor.is_propagation() {
            return self
                .propagation
                .input(data)
                .map(|_| ())
                .map_err(|e| e.to_string());
        }
        let index = self.sensor_index(sensor).map_err(|e| e.to_string())?;
        self.sensors[index]
            .model
            .measurement(data)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn apply(&mut self, entry: BufferEntry) -> Result<ProcessOutcome> {
        let eps = self.config.timestamp_epsilon;
        let (sensor, timestamp) = (entry.sensor, entry.timestamp);

        let oldest = self
            .buffer
            .oldest_snapshot()
            .map(|s| s.timestamp)
            .ok_or(EstimatorError::EmptyBuffer)?;
        if timestamp.is_before(oldest, eps) {
            return Ok(self.reject(Diagnostic::StaleMeasurementDropped {
                sensor,
                timestamp,
                oldest,
            }));
        }
        let out_of_order = self
            .buffer
            .latest_timestamp()
            .is_some_and(|latest| timestamp.is_before(latest, eps));

        let index = self.buffer.insert(entry);
        self.mark_contributed(sensor);
        match self.resolve(index)? {
            Resolution::Resolved(snapshot) => self.buffer.set_snapshot(index, snapshot),
            Resolution::Failed(diagnostic) => {
                self.buffer.remove(index);
                return Ok(self.reject(diagnostic));
            }
        }
        if !sensor.is_propagation() {
            self.consecutive_failures = 0;
        }

        let replayed = self.replay_from(index + 1)?;
        self.diagnostics.applied += 1;
        if out_of_order {
            self.diagnostics.out_of_order += 1;
            debug!(%sensor, %timestamp, replayed, "Out-of-order measurement, repropagated");
        } else {
            debug!(%sensor, %timestamp, "Applied measurement");
        }

        self.enforce_retention();
        Ok(ProcessOutcome::Applied { replayed })
    }

    /// Recomputes every entry from `start` to the end of the buffer, in order.
    ///
    /// An entry that fails is removed, exactly as if it had failed on arrival in
    /// time order, and the entries after it are resolved without it.
    fn replay_from(&mut self, start: usize) -> Result<usize> {
        let mut index = start;
        let mut replayed = 0;
        while index < self.buffer.len() {
            replayed += 1;
            match self.resolve(index)? {
                Resolution::Resolved(snapshot) => {
                    if !snapshot.sensor.is_propagation() {
                        self.consecutive_failures = 0;
                    }
                    self.buffer.set_snapshot(index, snapshot);
                    index += 1;
                }
                Resolution::Failed(diagnostic) => {
                    warn!(%diagnostic, "Replayed measurement failed, removing it");
                    self.buffer.remove(index);
                    self.record_failure(&diagnostic);
                    self.replay_diagnostics.push(diagnostic);
                }
            }
        }
        self.diagnostics.replayed_entries += replayed as u64;
        Ok(replayed)
    }

    /// Computes the snapshot of the entry at `index` from its predecessor.
    fn resolve(&self, index: usize) -> Result<Resolution> {
        let entry = self.buffer.get(index).ok_or(EstimatorError::EmptyBuffer)?;
        let (timestamp, sensor) = (entry.timestamp, entry.sensor);
        let previous = index
            .checked_sub(1)
            .and_then(|i| self.buffer.get(i))
            .and_then(BufferEntry::snapshot)
            .ok_or_else(|| {
                EstimatorError::InvalidTransition(format!(
                    "entry at {timestamp} has no resolved predecessor"
                ))
            })?;
        let prev_core = &previous.core;
        let dt = timestamp - previous.timestamp;
        let step = dt > self.config.timestamp_epsilon;
        let invalid = |reason: String| {
            Resolution::Failed(Diagnostic::InvalidMeasurement {
                sensor,
                timestamp,
                reason,
            })
        };
        let mut calibrations = previous.calibrations.clone();

        if sensor.is_propagation() {
            let input = match self.propagation.input(entry.measurement()) {
                Ok(input) => input,
                Err(e) => return Ok(invalid(e.to_string())),
            };
            let core = if step {
                self.propagation
                    .propagate(prev_core, previous.timestamp, &input, timestamp)
            } else {
                CoreState {
                    input,
                    ..prev_core.held()
                }
            };
            if step {
                calibrations.propagate(&core.transition);
            }
            return Ok(Resolution::Resolved(StateSnapshot {
                timestamp,
                sensor,
                core,
                calibrations,
                sensor_state: None,
            }));
        }

        // --- Update: align in time with the held input, then correct ---
        let aligned = if step {
            self.propagation
                .propagate(prev_core, previous.timestamp, &prev_core.input, timestamp)
        } else {
            prev_core.held()
        };
        if step {
            calibrations.propagate(&aligned.transition);
        }

        let Some(registered) = self.registered(sensor) else {
            return Ok(invalid(format!("{sensor} is not registered")));
        };
        let model = registered.model.as_ref();
        let z = match model.measurement(entry.measurement()) {
            Ok(z) => z,
            Err(e) => return Ok(invalid(e.to_string())),
        };
        if !calibrations.contains(sensor) {
            calibrations.introduce(sensor, &registered.prior);
        }

        Ok(match self.apply_update(sensor, &aligned, &calibrations, &z) {
            Ok((core, calibrations)) => {
                let sensor_state = calibrations.snapshot(sensor);
                Resolution::Resolved(StateSnapshot {
                    timestamp,
                    sensor,
                    core,
                    calibrations,
                    sensor_state,
                })
            }
            Err(issue) => Resolution::Failed(Diagnostic::NumericalInstability {
                sensor,
                timestamp,
                issue,
            }),
        })
    }

    fn registered(&self, sensor: SensorHandle) -> Option<&RegisteredSensor> {
        self.sensor_index(sensor)
            .ok()
            .and_then(|i| self.sensors.get(i))
    }

    /// Corrects the aligned core state and every known calibration with one
    /// measurement of `sensor`, over the full joint error state.
    fn apply_update(
        &self,
        sensor: SensorHandle,
        aligned: &CoreState,
        calibrations: &CalibrationSet,
        z: &Vector,
    ) -> std::result::Result<(CoreState, CalibrationSet), NumericalIssue> {
        let (model, block) = match (self.registered(sensor), calibrations.block(sensor)) {
            (Some(registered), Some(block)) => (registered.model.as_ref(), block),
            _ => {
                return Err(NumericalIssue::DimensionMismatch(format!(
                    "{sensor} has no calibration block"
                )))
            }
        };

        let z_pred = model.predict(&aligned.nav, &block.values);
        let residual = model.residual(z, &z_pred);
        let local = model.jacobian(&aligned.nav, &block.values);
        let h = embed_jacobian(&local, block.offset, block.dim, calibrations.dim())?;
        let covariance = calibrations.joint_covariance(&aligned.covariance);

        let correction = ekf::correct(&covariance, &h, &residual, model.measurement_noise())?;
        let delta = &correction.delta;
        let p = &correction.covariance;

        let core = CoreState {
            nav: aligned.nav.boxplus(delta.rows(0, CORE_ERROR_DIM)),
            covariance: p
                .fixed_view::<CORE_ERROR_DIM, CORE_ERROR_DIM>(0, 0)
                .into_owned(),
            transition: aligned.transition,
            input: aligned.input,
        };
        let mut corrected = calibrations.clone();
        corrected.set_joint_covariance(p);
        for block in corrected.blocks_mut() {
            let step = delta.rows(CORE_ERROR_DIM + block.offset, block.dim);
            if let Some(owner) = self.registered(block.sensor) {
                block.values = owner.model.apply_correction(&block.values, step);
            }
        }
        Ok((core, corrected))
    }

    /// Applies the size and time bounds of the buffer.
    fn enforce_retention(&mut self) {
        let mut evicted = 0;

        let max = self.config.max_buffer_entries;
        if self.buffer.len() > max {
            let excess = self.buffer.len() - max;
            if let Some(cutoff) = self.buffer.get(excess).map(|e| e.timestamp) {
                evicted += self.buffer.evict_before(cutoff).len();
            }
        }
        if let (Some(horizon), Some(latest)) =
            (self.config.retention_horizon, self.buffer.latest_timestamp())
        {
            let cutoff = Timestamp::new(latest.seconds() - horizon);
            evicted += self.buffer.evict_before(cutoff).len();
        }

        if evicted == 0 {
            return;
        }
        self.diagnostics.evicted += evicted as u64;
        debug!(
            count = evicted,
            remaining = self.buffer.len(),
            "Evicted old buffer entries"
        );
    }

    fn reject(&mut self, diagnostic: Diagnostic) -> ProcessOutcome {
        warn!(%diagnostic, "Measurement rejected");
        self.record_failure(&diagnostic);
        ProcessOutcome::Rejected(diagnostic)
    }

    fn record_failure(&mut self, diagnostic: &Diagnostic) {
        match diagnostic {
            Diagnostic::StaleMeasurementDropped { .. } => self.diagnostics.stale_dropped += 1,
            Diagnostic::InvalidMeasurement { .. } => self.diagnostics.invalid += 1,
            Diagnostic::NumericalInstability { .. } => {
                self.diagnostics.numerical += 1;
                self.consecutive_failures += 1;
                if self.consecutive_failures == self.config.degraded_after {
                    warn!(
                        failures = self.consecutive_failures,
                        "Estimate degraded by repeated numerical failures"
                    );
                }
            }
        }
    }
}

// --- Pure helpers ---

fn check_calibration(
    handle: SensorHandle,
    model: &dyn UpdateSensor,
    calibration: &CalibrationState,
) -> Result<()> {
    let expected = model.calibration_dim();
    let covariance = &calibration.covariance;
    if covariance.nrows() != expected || covariance.ncols() != expected {
        return Err(EstimatorError::CalibrationDimension {
            sensor: handle,
            expected,
            found: covariance.nrows(),
        });
    }
    let values = model.default_calibration().values.len();
    if calibration.values.len() != values {
        return Err(EstimatorError::CalibrationDimension {
            sensor: handle,
            expected: values,
            found: calibration.values.len(),
        });
    }
    if !ekf::is_valid_covariance(covariance) || !calibration.values.iter().all(|v| v.is_finite()) {
        return Err(EstimatorError::InvalidConfig(format!(
            "calibration for {handle} must be finite with a symmetric positive semi-definite covariance"
        )));
    }
    Ok(())
}

/// PURE FUNCTION: widens a sensor Jacobian over `[core, own calibration]` to the
/// full error state `[core, all calibrations]`.
fn embed_jacobian(
    local: &Matrix,
    offset: usize,
    dim: usize,
    calibration_dim: usize,
) -> std::result::Result<Matrix, NumericalIssue> {
    if local.ncols() != CORE_ERROR_DIM + dim || offset + dim > calibration_dim {
        return Err(NumericalIssue::DimensionMismatch(format!(
            "jacobian has {} columns, expected {}",
            local.ncols(),
            CORE_ERROR_DIM + dim
        )));
    }
    let mut h = Matrix::zeros(local.nrows(), CORE_ERROR_DIM + calibration_dim);
    h.columns_mut(0, CORE_ERROR_DIM)
        .copy_from(&local.columns(0, CORE_ERROR_DIM));
    h.columns_mut(CORE_ERROR_DIM + offset, dim)
        .copy_from(&local.columns(CORE_ERROR_DIM, dim));
    Ok(h)
}
