// kestrel_sim/src/lib.rs

// A deterministic scenario harness around `kestrel_core`: synthetic truth,
// sensor streams with latency, and a report of how well the estimator tracked.
pub mod cli;
pub mod config;
pub mod error;
pub mod prng;
pub mod runner;
pub mod synth;
pub mod trajectory;
pub mod transport;

pub use config::{load_scenario, parse_scenario, ScenarioConfig};
pub use error::SimError;
pub use runner::{run_scenario, RunReport};

use tracing_subscriber::EnvFilter;

/// A good filter for focusing on our crates' logs during development.
pub const DEFAULT_LOG_FILTER: &str = "info,kestrel_core=info,kestrel_sim=debug";

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` (a filter directive such as
/// `"debug"` or `"kestrel_core=trace"`) or [`DEFAULT_LOG_FILTER`]. Calling this
/// twice is harmless.
pub fn init_tracing(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or(DEFAULT_LOG_FILTER)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
