// kestrel_sim/src/config.rs

//! Scenario configuration: the TOML file layout of one simulation run and its loader.

use crate::error::SimError;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use kestrel_core::config::EstimatorConfig;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::path::Path;

// =========================================================================
// == Top-Level Configuration ==
// =========================================================================

/// The root of a `scenario.toml` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)] // Fail if the TOML has fields not in our struct
pub struct ScenarioConfig {
    #[serde(default)] // Use default if the [simulation] section is missing
    pub simulation: SimulationSection,

    #[serde(default)]
    pub estimator: EstimatorConfig,

    #[serde(default)]
    pub motion: MotionProfile,

    // The TOML has `[[sensors]]`, which becomes a Vec of SensorConfig values.
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

impl ScenarioConfig {
    /// Rejects scenarios the generator cannot run.
    pub fn validate(&self) -> Result<(), SimError> {
        let sim = &self.simulation;
        if !(sim.duration.is_finite() && sim.duration > 0.0) {
            return Err(SimError::InvalidScenario(format!(
                "simulation.duration must be positive, got {}",
                sim.duration
            )));
        }
        if !(sim.imu_rate.is_finite() && sim.imu_rate > 0.0) {
            return Err(SimError::InvalidScenario(format!(
                "simulation.imu_rate must be positive, got {}",
                sim.imu_rate
            )));
        }
        for sensor in &self.sensors {
            let stream = sensor.stream();
            if !(stream.rate > 0.0 && stream.rate <= sim.imu_rate) {
                return Err(SimError::InvalidScenario(format!(
                    "sensor '{}' rate must be in (0, imu_rate], got {}",
                    sensor.name(),
                    stream.rate
                )));
            }
            if stream.latency < 0.0 || stream.jitter < 0.0 || stream.offset < 0.0 {
                return Err(SimError::InvalidScenario(format!(
                    "sensor '{}' latency, jitter and offset must be non-negative",
                    sensor.name()
                )));
            }
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, SimError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// =========================================================================
// == Configuration Sub-Structs ==
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationSection {
    /// Duration of the simulated trajectory in seconds.
    pub duration: f64,
    /// IMU sample rate in Hz. Every other sensor samples on this grid.
    pub imu_rate: f64,
    /// Seed for the pseudo-random number generator, for determinism.
    pub seed: u64,
    pub initial_position: [f64; 3],
    pub initial_yaw_deg: f64,
    /// Add white noise to the IMU and to every sensor. When off, the only
    /// difference between estimate and truth comes from the estimator itself.
    pub synthesize_noise: bool,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            duration: 20.0,
            imu_rate: 200.0,
            seed: 42,
            initial_position: [0.0, 0.0, 5.0],
            initial_yaw_deg: 0.0,
            synthesize_noise: true,
        }
    }
}

impl SimulationSection {
    pub fn imu_dt(&self) -> f64 {
        1.0 / self.imu_rate
    }

    pub fn initial_orientation(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_euler_angles(0.0, 0.0, self.initial_yaw_deg.to_radians())
    }
}

/// Body motion as sums of sinusoids: `offset + amplitude * sin(2π f t)` per axis.
///
/// `accel_*` is the kinematic acceleration in the body frame (gravity is added
/// by the IMU model), `gyro_*` the body angular rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MotionProfile {
    pub accel_amplitude: [f64; 3],
    pub accel_frequency: [f64; 3],
    pub gyro_offset: [f64; 3],
    pub gyro_amplitude: [f64; 3],
    pub gyro_frequency: [f64; 3],
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            accel_amplitude: [0.5, 0.4, 0.2],
            accel_frequency: [0.1, 0.13, 0.07],
            gyro_offset: [0.0, 0.0, 0.05],
            gyro_amplitude: [0.1, 0.08, 0.15],
            gyro_frequency: [0.05, 0.09, 0.11],
        }
    }
}

/// When and how a sensor's measurements are sampled and delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    /// Sample rate in Hz, snapped to a whole number of IMU periods.
    pub rate: f64,
    /// Time of the first sample in seconds, snapped to the IMU grid.
    pub offset: f64,
    /// Fixed delivery delay in seconds.
    pub latency: f64,
    /// Additional uniformly distributed delivery delay in `[0, jitter)` seconds.
    pub jitter: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            offset: 0.0,
            latency: 0.0,
            jitter: 0.0,
        }
    }
}

/// A rigid sensor-to-body transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Extrinsic {
    pub translation: [f64; 3],
    /// Roll, pitch and yaw in degrees.
    pub rotation_deg: [f64; 3],
}

impl Extrinsic {
    pub fn translation(&self) -> Vector3<f64> {
        Vector3::from(self.translation)
    }

    pub fn rotation(&self) -> UnitQuaternion<f64> {
        let [roll, pitch, yaw] = self.rotation_deg.map(f64::to_radians);
        UnitQuaternion::from_euler_angles(roll, pitch, yaw)
    }
}

/// An initial calibration guess handed to the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationPrior {
    pub extrinsic: Extrinsic,
    pub translation_std: f64,
    /// Only used by sensors that estimate a rotation.
    #[serde(default)]
    pub rotation_std_deg: f64,
}

// =========================================================================
// == Sensors ==
// =========================================================================

// The `tag = "type"` tells Serde to look for a `type = "..."` field in the TOML
// to decide which variant to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "PascalCase")]
pub enum SensorConfig {
    Pose(PoseConfig),
    Position(PositionConfig),
    Pressure(PressureConfig),
}

impl SensorConfig {
    pub fn name(&self) -> &str {
        match self {
            SensorConfig::Pose(c) => &c.name,
            SensorConfig::Position(c) => &c.name,
            SensorConfig::Pressure(c) => &c.name,
        }
    }

    pub fn kind_str(&self) -> &str {
        match self {
            SensorConfig::Pose(_) => "Pose",
            SensorConfig::Position(_) => "Position",
            SensorConfig::Pressure(_) => "Pressure",
        }
    }

    pub fn stream(&self) -> &StreamConfig {
        match self {
            SensorConfig::Pose(c) => &c.stream,
            SensorConfig::Position(c) => &c.stream,
            SensorConfig::Pressure(c) => &c.stream,
        }
    }

    /// The true mounting of the sensor used to synthesize its measurements.
    pub fn extrinsic(&self) -> &Extrinsic {
        match self {
            SensorConfig::Pose(c) => &c.extrinsic,
            SensorConfig::Position(c) => &c.extrinsic,
            SensorConfig::Pressure(c) => &c.extrinsic,
        }
    }

    pub fn prior(&self) -> Option<&CalibrationPrior> {
        match self {
            SensorConfig::Pose(c) => c.prior.as_ref(),
            SensorConfig::Position(c) => c.prior.as_ref(),
            SensorConfig::Pressure(c) => c.prior.as_ref(),
        }
    }
}

/// A 6-DoF pose source such as motion capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoseConfig {
    pub name: String,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub extrinsic: Extrinsic,
    /// Per-axis position noise in metres.
    pub position_std: f64,
    /// Per-axis attitude noise in degrees.
    pub orientation_std_deg: f64,
    #[serde(default)]
    pub prior: Option<CalibrationPrior>,
}

/// A position fix of a lever-armed antenna.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PositionConfig {
    pub name: String,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub extrinsic: Extrinsic,
    pub position_std: f64,
    #[serde(default)]
    pub prior: Option<CalibrationPrior>,
}

/// A barometer. Its height noise is applied before conversion to pressure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PressureConfig {
    pub name: String,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub extrinsic: Extrinsic,
    pub height_std: f64,
    #[serde(default = "default_reference_pressure")]
    pub reference_pressure: f64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub prior: Option<CalibrationPrior>,
}

fn default_reference_pressure() -> f64 {
    101_325.0
}

fn default_temperature() -> f64 {
    288.15
}

// =========================================================================
// == Loading ==
// =========================================================================

/// Loads a scenario file, layered with `KESTREL_`-prefixed environment
/// overrides (`KESTREL_SIMULATION__SEED=7` sets `simulation.seed`).
pub fn load_scenario(path: &Path) -> Result<ScenarioConfig, SimError> {
    if !path.is_file() {
        return Err(SimError::MissingScenario(path.to_path_buf()));
    }
    let scenario: ScenarioConfig = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("KESTREL_").split("__"))
        .extract()?;
    scenario.validate()?;
    Ok(scenario)
}

/// Parses a scenario from TOML text, without environment overrides.
pub fn parse_scenario(toml: &str) -> Result<ScenarioConfig, SimError> {
    let scenario: ScenarioConfig = Figment::new().merge(Toml::string(toml)).extract()?;
    scenario.validate()?;
    Ok(scenario)
}
