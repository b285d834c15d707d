//! slimfed simulation CLI

mod sim;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use slimfed_common::{init_logging, LogLevel, RunConfig};
use sim::Simulation;

#[derive(Parser, Debug)]
#[command(name = "slimfed")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Run configuration (YAML)
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Override the number of rounds
    #[arg(short = 'r', long = "rounds", value_name = "N")]
    pub rounds: Option<usize>,

    /// Override the RNG seed
    #[arg(short = 's', long = "seed", value_name = "SEED")]
    pub seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long = "log-level", default_value = "info")]
    pub log_level: LogLevel,

    /// Write round metrics as JSON to this file
    #[arg(short = 'o', long = "export-metrics", value_name = "FILE")]
    pub export_metrics: Option<PathBuf>,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level);

    let mut config = RunConfig::from_yaml_file(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(rounds) = args.rounds {
        config.rounds = rounds;
    }
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }

    let mut simulation = Simulation::new(config)?;
    simulation.run()?;

    if let Some(path) = &args.export_metrics {
        let json = simulation.metrics_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
        println!("Metrics written to {}", path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() { Args::command().debug_assert(); }

    #[test]
    fn test_config_argument() {
        let args = Args::parse_from(["slimfed", "run.yaml"]);
        assert_eq!(args.config, PathBuf::from("run.yaml"));
        assert_eq!(args.rounds, None);
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from(["slimfed", "run.yaml", "-r", "10", "-s", "99"]);
        assert_eq!(args.rounds, Some(10));
        assert_eq!(args.seed, Some(99));
    }

    #[test]
    fn test_metrics_export_flag() {
        let args = Args::parse_from(["slimfed", "run.yaml", "-o", "metrics.json"]);
        assert_eq!(args.export_metrics, Some(PathBuf::from("metrics.json")));
    }
}
