//! txnbridge - run workloads against the transaction bridge

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use txnbridge_cli::{
    cli::Cli,
    commands::{error_report, CommandDispatcher},
};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    if let Err(e) = CommandDispatcher::execute(cli) {
        error!("Command execution failed: {}", error_report(&e));
        std::process::exit(1);
    }
    Ok(())
}

/// Setup logging based on verbosity level; RUST_LOG takes precedence
fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
