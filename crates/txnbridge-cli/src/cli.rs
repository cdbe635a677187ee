//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "txnbridge")]
#[command(about = "Deterministic runs of the split-phase transaction bridge")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workload against a system and print the statistics
    Run {
        /// System description (TOML); a preset is used when absent
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Workload file (TOML)
        #[arg(short, long)]
        workload: PathBuf,
        /// Preset used when no configuration file is given
        #[arg(long, value_enum, default_value_t = Preset::MultiCore)]
        preset: Preset,
        /// Number of cores for the multi-core preset
        #[arg(long, default_value_t = 2)]
        cores: usize,
        /// Override the seed of the workload's random traffic
        #[arg(long)]
        seed: Option<u64>,
        /// Output format for the report
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Include every response in the report
        #[arg(long)]
        responses: bool,
    },
    /// Validate a system description
    Check {
        /// System description (TOML)
        config: PathBuf,
    },
    /// Print a sample system description or workload
    SampleConfig {
        #[arg(long, value_enum, default_value_t = Preset::MultiCore)]
        preset: Preset,
        #[arg(long, default_value_t = 2)]
        cores: usize,
        /// Print a sample workload instead
        #[arg(long)]
        workload: bool,
    },
}

/// Built-in system layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    SingleCore,
    MultiCore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
