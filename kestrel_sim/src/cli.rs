// kestrel_sim/src/cli.rs

use clap::Parser;
use std::path::PathBuf;

/// Kestrel: replay a sensor scenario through the multi-sensor estimator.
///
/// This struct defines the command-line arguments that can be passed to any
/// binary application that uses the Kestrel simulation library.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The path to the scenario TOML file to run.
    #[arg(short, long, default_value = "assets/scenarios/default.toml")]
    pub scenario: PathBuf,

    /// Override the scenario's random seed.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log filter used when RUST_LOG is not set (e.g. "debug", "kestrel_core=trace").
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Print the fully resolved scenario before running it.
    #[arg(long, default_value_t = false)]
    pub print_config: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_bundled_scenario() {
        let cli = Cli::parse_from(["kestrel"]);
        assert_eq!(cli.scenario, PathBuf::from("assets/scenarios/default.toml"));
        assert_eq!(cli.seed, None);
        assert!(!cli.print_config);
    }

    #[test]
    fn parses_overrides() {
        let cli = Cli::parse_from([
            "kestrel",
            "-s",
            "other.toml",
            "--seed",
            "9",
            "--print-config",
        ]);
        assert_eq!(cli.scenario, PathBuf::from("other.toml"));
        assert_eq!(cli.seed, Some(9));
        assert!(cli.print_config);
    }
}
