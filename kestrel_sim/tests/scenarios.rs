// kestrel_sim/tests/scenarios.rs

//! End-to-end runs of the bundled scenarios.

use kestrel_core::estimation::Diagnostic;
use kestrel_sim::config::{ScenarioConfig, SensorConfig};
use kestrel_sim::{load_scenario, parse_scenario, run_scenario, SimError};
use std::path::{Path, PathBuf};

const DEFAULT: &str = include_str!("../../assets/scenarios/default.toml");
const NOISE_FREE: &str = include_str!("../../assets/scenarios/noise_free.toml");

fn scenario(text: &str) -> ScenarioConfig {
    parse_scenario(text).expect("bundled scenario must parse")
}

fn with_stream_delay(mut scenario: ScenarioConfig, latency: f64, jitter: f64) -> ScenarioConfig {
    for sensor in &mut scenario.sensors {
        let stream = match sensor {
            SensorConfig::Pose(c) => &mut c.stream,
            SensorConfig::Position(c) => &mut c.stream,
            SensorConfig::Pressure(c) => &mut c.stream,
        };
        stream.latency = latency;
        stream.jitter = jitter;
    }
    scenario
}

#[test]
fn bundled_scenario_loads_from_disk() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../assets/scenarios/default.toml");
    let loaded = load_scenario(&path).expect("default scenario");
    assert_eq!(loaded.sensors.len(), 3);
    assert_eq!(loaded.sensors[0].name(), "mocap");
}

#[test]
fn missing_scenario_is_reported() {
    let result = load_scenario(&PathBuf::from("does/not/exist.toml"));
    assert!(matches!(result, Err(SimError::MissingScenario(_))));
}

#[test]
fn noise_free_run_reproduces_the_truth() {
    let report = run_scenario(&scenario(NOISE_FREE)).expect("run");

    assert!(report.position_error < 1e-6, "{report}");
    assert!(report.velocity_error < 1e-6, "{report}");
    assert!(report.attitude_error_deg < 1e-6, "{report}");
    assert!(report.rejections.is_empty(), "{report}");
    assert!(!report.degraded);
    // Latency made the update sensors arrive behind the IMU.
    assert!(report.diagnostics.out_of_order > 0);
    assert!(report.diagnostics.replayed_entries > 0);
    assert!((report.final_state.timestamp.seconds() - 10.0).abs() < 1e-9);

    // The priors matched the true mounting, and the residuals were zero.
    let (name, calibration) = &report.calibrations[1];
    assert_eq!(name, "gnss");
    let calibration = calibration.as_ref().expect("gnss applied updates");
    assert!((calibration.values[1] - 0.1).abs() < 1e-6);
}

#[test]
fn delayed_delivery_matches_in_order_delivery() {
    let mut base = scenario(DEFAULT);
    base.simulation.duration = 5.0;

    let in_order = run_scenario(&with_stream_delay(base.clone(), 0.0, 0.0)).expect("run");
    let delayed = run_scenario(&with_stream_delay(base, 0.12, 0.05)).expect("run");

    assert_eq!(in_order.diagnostics.out_of_order, 0);
    assert!(delayed.diagnostics.out_of_order > 0);
    assert_eq!(in_order.diagnostics.stale_dropped, 0);
    assert_eq!(delayed.diagnostics.stale_dropped, 0);
    assert_eq!(in_order.final_state, delayed.final_state);
    assert_eq!(in_order.calibrations, delayed.calibrations);
}

#[test]
fn measurements_older_than_the_buffer_are_dropped() {
    let mut base = scenario(DEFAULT);
    base.simulation.duration = 4.0;
    base.estimator.max_buffer_entries = 100;
    let report = run_scenario(&with_stream_delay(base, 1.0, 0.0)).expect("run");

    assert!(report.diagnostics.stale_dropped > 0);
    assert!(report
        .rejections
        .iter()
        .all(|d| matches!(d, Diagnostic::StaleMeasurementDropped { .. })));
    assert!(report.final_state.core.nav.is_finite());
    assert!(report.diagnostics.evicted > 0);
}

#[test]
fn noisy_run_tracks_the_truth() {
    let report = run_scenario(&scenario(DEFAULT)).expect("run");

    assert!(report.position_error < 0.2, "{report}");
    assert!(report.velocity_error < 0.5, "{report}");
    assert!(report.attitude_error_deg < 3.0, "{report}");
    assert!(!report.degraded, "{report}");
    assert!(report.rejections.is_empty(), "{report}");
}

#[test]
fn the_same_seed_gives_the_same_run() {
    let mut base = scenario(DEFAULT);
    base.simulation.duration = 2.0;

    let a = run_scenario(&base).expect("run");
    let b = run_scenario(&base).expect("run");
    assert_eq!(a.final_state, b.final_state);

    base.simulation.seed += 1;
    let c = run_scenario(&base).expect("run");
    assert_ne!(a.final_state, c.final_state);
}
