use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Runs SDN experiments on an emulated network", long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an experiment
    Run {
        /// Path to the scenario config
        #[arg(short, long, default_value = "labrun.toml")]
        config: PathBuf,

        /// Log what would happen instead of touching the system. All waits are skipped.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the topology and launch schedule of a scenario
    Plan {
        /// Path to the scenario config
        #[arg(short, long, default_value = "labrun.toml")]
        config: PathBuf,
    },

    /// Write the example scenario to disk
    Init {
        /// Where to write it
        #[arg(short, long, default_value = "labrun.toml")]
        path: PathBuf,
    },
}

pub fn parse() -> Args {
    Args::parse()
}
