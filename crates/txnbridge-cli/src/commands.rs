//! Command dispatch for the txnbridge CLI

use std::path::Path;

use anyhow::Context;
use tracing::info;

use txnbridge_core::SystemConfig;

use crate::cli::{Cli, Commands, OutputFormat, Preset};
use crate::runner::{render_json, render_text, run};
use crate::workload::Workload;

pub struct CommandDispatcher;

impl CommandDispatcher {
    pub fn execute(cli: Cli) -> anyhow::Result<()> {
        match cli.command {
            Commands::Run {
                config,
                workload,
                preset,
                cores,
                seed,
                format,
                responses,
            } => {
                let system = match config {
                    Some(path) => load_config(&path)?,
                    None => preset_config(preset, cores),
                };
                system.validate()?;

                let workload = Workload::from_file(&workload)
                    .with_context(|| format!("loading workload {}", workload.display()))?;
                info!(
                    "running {} packets on {} nodes",
                    workload.packets.len(),
                    system.nodes.len()
                );

                let report = run(&system, &workload, seed, responses)?;
                match format {
                    OutputFormat::Text => print!("{}", render_text(&report)),
                    OutputFormat::Json => println!("{}", render_json(&report)?),
                }
            }
            Commands::Check { config } => {
                let system = load_config(&config)?;
                system.validate()?;
                println!(
                    "{}: {} sources, {} nodes, memory {:#x}+{:#x}",
                    config.display(),
                    system.source_count(),
                    system.nodes.len(),
                    system.memory.base,
                    system.memory.size
                );
            }
            Commands::SampleConfig {
                preset,
                cores,
                workload,
            } => {
                let text = if workload {
                    Workload::sample().to_toml()?
                } else {
                    preset_config(preset, cores).to_toml()?
                };
                print!("{text}");
            }
        }
        Ok(())
    }
}

fn preset_config(preset: Preset, cores: usize) -> SystemConfig {
    match preset {
        Preset::SingleCore => SystemConfig::single_core(),
        Preset::MultiCore => SystemConfig::multi_core(cores),
    }
}

fn load_config(path: &Path) -> anyhow::Result<SystemConfig> {
    info!("Loading configuration from: {}", path.display());
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading configuration {}", path.display()))?;
    Ok(SystemConfig::from_toml(&text)?)
}

/// One-line failure message for the exit log
///
/// Wrapped errors already print their cause, so a cause is only appended
/// when the text so far does not contain it.
pub fn error_report(err: &anyhow::Error) -> String {
    let mut report = err.to_string();
    for cause in err.chain().skip(1) {
        let text = cause.to_string();
        if !report.contains(&text) {
            report.push_str(": ");
            report.push_str(&text);
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CliError;
    use txnbridge_core::BridgeError;

    #[test]
    fn test_error_report_prints_nested_reason_once() {
        let err = anyhow::Error::from(CliError::from(BridgeError::out_of_range(
            "router0",
            0x4000_0000,
            None,
        )))
        .context("running workload");

        let report = error_report(&err);
        assert!(report.starts_with("running workload: Bridge error: Routing error:"));
        assert_eq!(report.matches("Routing error").count(), 1);
        assert_eq!(report.matches("0x40000000").count(), 1);
    }

    #[test]
    fn test_error_report_keeps_unrelated_causes() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = anyhow::Error::from(io).context("reading configuration bridge.toml");
        assert_eq!(
            error_report(&err),
            "reading configuration bridge.toml: no such file"
        );
    }
}
