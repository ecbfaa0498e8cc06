// kestrel_sim/src/runner.rs

//! Runs one scenario end to end: truth, sensors, transport and the estimator.

use crate::config::ScenarioConfig;
use crate::error::SimError;
use crate::prng::SimulationRng;
use crate::synth::SensorStream;
use crate::trajectory::{ImuNoiseModel, Trajectory};
use crate::transport::{arrival_order, delayed, immediate, Delivery};
use kestrel_core::prelude::*;
use std::fmt;
use tracing::{debug, info, warn};

/// Stream ids of the noise sources; sensor `i` draws from `SENSOR_STREAMS + 2 i`
/// (measurement noise) and `SENSOR_STREAMS + 2 i + 1` (delivery jitter).
const IMU_STREAM: u64 = 1;
const SENSOR_STREAMS: u64 = 16;

/// The outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The estimator's most recent state.
    pub final_state: StateSnapshot,
    /// The true state at the time of `final_state`.
    pub truth: NavState,
    pub position_error: f64,
    pub velocity_error: f64,
    pub attitude_error_deg: f64,
    pub diagnostics: Diagnostics,
    /// Measurements the estimator turned down, in arrival order.
    pub rejections: Vec<Diagnostic>,
    pub degraded: bool,
    pub messages: usize,
    /// The latest calibration estimate of each configured sensor, by name.
    pub calibrations: Vec<(String, Option<CalibrationState>)>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.diagnostics;
        writeln!(f, "--- Run Report ---")?;
        writeln!(f, "{}", self.final_state)?;
        writeln!(
            f,
            "errors: position {:.4} m | velocity {:.4} m/s | attitude {:.3} deg",
            self.position_error, self.velocity_error, self.attitude_error_deg
        )?;
        writeln!(
            f,
            "messages: {} | applied {} | out-of-order {} | replayed {} | stale {} | invalid {} | numerical {} | evicted {}",
            self.messages,
            d.applied,
            d.out_of_order,
            d.replayed_entries,
            d.stale_dropped,
            d.invalid,
            d.numerical,
            d.evicted
        )?;
        if self.degraded {
            writeln!(f, "estimate is DEGRADED")?;
        }
        for (name, calibration) in &self.calibrations {
            match calibration {
                Some(c) => writeln!(f, "calibration '{name}': {:.4}", c.values.transpose())?,
                None => writeln!(f, "calibration '{name}': no update applied")?,
            }
        }
        Ok(())
    }
}

/// Builds every message of the scenario, ordered by arrival at the estimator.
pub fn schedule(
    scenario: &ScenarioConfig,
    trajectory: &Trajectory,
    streams: &[SensorStream],
) -> Result<Vec<Delivery>, SimError> {
    let sim = &scenario.simulation;
    let root = SimulationRng::from_seed(sim.seed);

    let mut imu_rng = root.fork(IMU_STREAM);
    let imu_noise = ImuNoiseModel::new(&scenario.estimator.imu_noise, sim.imu_rate)?;
    let imu_messages = trajectory
        .samples()
        .iter()
        .map(|truth| {
            let imu = if sim.synthesize_noise {
                imu_noise.corrupt(&truth.imu, &mut imu_rng)
            } else {
                truth.imu
            };
            MeasurementMessage::new(
                SensorHandle::PROPAGATION,
                truth.timestamp,
                MeasurementData::Imu(imu),
            )
        })
        .collect();

    // The IMU goes first so that it wins ties in arrival time.
    let mut deliveries = immediate(imu_messages);
    for (i, stream) in streams.iter().enumerate() {
        let base = SENSOR_STREAMS + 2 * i as u64;
        let recorded = stream.record(trajectory, sim.imu_rate, &mut root.fork(base));
        deliveries.extend(delayed(
            recorded,
            stream.config.stream(),
            &mut root.fork(base + 1),
        ));
    }
    Ok(arrival_order(deliveries))
}

/// Runs a scenario and compares the final estimate with the truth.
pub fn run_scenario(scenario: &ScenarioConfig) -> Result<RunReport, SimError> {
    scenario.validate()?;
    let sim = &scenario.simulation;
    info!(
        duration = sim.duration,
        imu_rate = sim.imu_rate,
        sensors = scenario.sensors.len(),
        seed = sim.seed,
        "Starting scenario"
    );

    let trajectory = Trajectory::generate(sim, &scenario.motion);
    let initial = trajectory
        .samples()
        .first()
        .map(|s| s.nav.clone())
        .ok_or_else(|| SimError::InvalidScenario("empty trajectory".to_string()))?;

    // --- Estimator and sensor registration ---
    let propagation = ImuPropagation::new(scenario.estimator.imu_noise.clone());
    let mut estimator = Estimator::new(scenario.estimator.clone(), Box::new(propagation))?;
    let mut streams = Vec::with_capacity(scenario.sensors.len());
    for sensor in &scenario.sensors {
        let handle = estimator.register_update_sensor(sensor.build_model())?;
        if let Some(prior) = sensor.calibration_prior() {
            estimator.set_calibration_prior(handle, prior)?;
        }
        info!(
            %handle,
            name = sensor.name(),
            kind = sensor.kind_str(),
            rate = sensor.stream().rate,
            latency = sensor.stream().latency,
            "Configured sensor"
        );
        streams.push(SensorStream::new(handle, sensor.clone(), sim.synthesize_noise)?);
    }

    let deliveries = schedule(scenario, &trajectory, &streams)?;
    let messages = deliveries.len();

    // --- Feed the estimator in arrival order ---
    let mut rejections = Vec::new();
    for Delivery { arrival, message } in &deliveries {
        match estimator.process_message(message)? {
            ProcessOutcome::Rejected(diagnostic) => {
                debug!(arrival, %diagnostic, "Measurement rejected");
                rejections.push(diagnostic);
            }
            ProcessOutcome::Applied { .. } | ProcessOutcome::Queued => {}
        }
        if !estimator.is_initialized() && message.sensor_handle.is_propagation() {
            estimator.initialize(initial.p_wi, initial.q_wi)?;
        }
    }

    let final_state = estimator.get_latest_state()?.clone();
    let truth = trajectory
        .sample_at(final_state.timestamp)
        .map(|s| s.nav.clone())
        .ok_or_else(|| SimError::InvalidScenario("empty trajectory".to_string()))?;
    let estimate = &final_state.core.nav;

    let calibrations = streams
        .iter()
        .map(|s| {
            (
                s.config.name().to_string(),
                estimator.latest_calibration(s.handle).ok(),
            )
        })
        .collect();

    let report = RunReport {
        position_error: (estimate.p_wi - truth.p_wi).norm(),
        velocity_error: (estimate.v_wi - truth.v_wi).norm(),
        attitude_error_deg: estimate.q_wi.angle_to(&truth.q_wi).to_degrees(),
        diagnostics: *estimator.diagnostics(),
        degraded: estimator.is_degraded(),
        final_state,
        truth,
        rejections,
        messages,
        calibrations,
    };
    if report.degraded {
        warn!("Run finished with a degraded estimate");
    }
    info!(
        position_error = report.position_error,
        attitude_error_deg = report.attitude_error_deg,
        "Scenario finished"
    );
    Ok(report)
}
