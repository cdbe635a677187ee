//! txnbridge CLI library
//!
//! Workload files, the run loop and report rendering behind the `txnbridge`
//! binary.

pub mod cli;
pub mod commands;
pub mod error;
pub mod runner;
pub mod workload;

pub use cli::{Cli, Commands};
pub use error::{CliError, Result};
pub use runner::{run, RunReport};
pub use workload::{PacketEntry, RandomTraffic, Workload};
