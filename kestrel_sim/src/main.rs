// kestrel_sim/src/main.rs

//! A full end-to-end run of the Kestrel estimator on a synthetic scenario.
//!
//! The binary:
//! 1. Loads a simulation scenario from a TOML file (with `KESTREL_` env overrides).
//! 2. Synthesizes the IMU and the delayed, out-of-order update sensor streams.
//! 3. Feeds them to the estimator in arrival order and reports the final error.
//!
//! To run it:
//! `cargo run -p kestrel_sim -- --scenario assets/scenarios/default.toml`

use clap::Parser;
use kestrel_sim::cli::Cli;
use kestrel_sim::{init_tracing, load_scenario, run_scenario, SimError};
use std::process::ExitCode;
use tracing::error;

fn run(cli: &Cli) -> Result<(), SimError> {
    let mut scenario = load_scenario(&cli.scenario)?;
    if let Some(seed) = cli.seed {
        scenario.simulation.seed = seed;
    }
    if cli.print_config {
        println!("{}", scenario.to_toml()?);
    }

    let report = run_scenario(&scenario)?;
    println!("{report}");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "Scenario failed");
            ExitCode::FAILURE
        }
    }
}
