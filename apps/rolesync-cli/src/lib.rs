//! # rolesync command-line interface
//!
//! Argument parsing, configuration discovery, logging setup, plan display
//! and exit-code mapping for the `rolesync` binary.

pub mod app;
pub mod args;
pub mod config;
pub mod error;
pub mod logging;
pub mod output;

pub use args::Cli;
pub use error::{CliError, CliResult};
