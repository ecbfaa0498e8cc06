// kestrel_core/src/prelude.rs

// --- Core Abstractions (The main contracts of the library) ---
pub use crate::messages::{ImuMeasurement, MeasurementData, MeasurementMessage};
pub use crate::sensors::{PropagationSensor, UpdateSensor};
pub use crate::time::Timestamp;
pub use crate::types::{SensorHandle, CORE_ERROR_DIM, GRAVITY};

// --- Core Data Structures (The "nouns" of the library) ---
pub use crate::buffer::{BufferEntry, EntryPayload, HistoryBuffer};
pub use crate::states::{
    CalibrationBlock, CalibrationSet, CalibrationState, CoreState, NavState, SensorSnapshot,
    StateSnapshot,
};

// --- Estimation ---
pub use crate::config::{CoreStd, EstimatorConfig, ImuNoise};
pub use crate::error::{EstimatorError, NumericalIssue, SensorError};
pub use crate::estimation::{Diagnostic, Diagnostics, Estimator, EstimatorStatus, ProcessOutcome};

// --- Concrete Model Implementations (Export common ones for convenience) ---
pub use crate::sensors::{ImuPropagation, PoseSensor, PositionSensor, PressureSensor};
