//! Logging setup
//!
//! `RUST_LOG` wins when set. Otherwise the filter follows the verbosity
//! flags. Logs always go to stderr so `--json` output on stdout stays clean.

use std::fmt;

use clap::ValueEnum;
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{CliError, CliResult};

/// Crates whose events follow the verbosity flags. Dependencies stay at `warn`.
const OWN_TARGETS: [&str; 6] = [
    "rolesync",
    "rolesync_cli",
    "rolesync_core",
    "rolesync_engine",
    "rolesync_ldap",
    "rolesync_postgres",
];

/// Verbosity level for CLI output
///
/// Levels are ordered: Quiet < Normal < Verbose < Trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Warnings and errors only
    Quiet,
    /// One line per action and phase (default)
    #[default]
    Normal,
    /// SQL statements and per-query details
    Verbose,
    /// Everything, including collaborator internals
    Trace,
}

impl LogLevel {
    /// Create LogLevel from CLI flags. `-q` wins over `-v`.
    pub fn from_flags(verbose: u8, quiet: bool) -> Self {
        match (quiet, verbose) {
            (true, _) => Self::Quiet,
            (false, 0) => Self::Normal,
            (false, 1) => Self::Verbose,
            (false, _) => Self::Trace,
        }
    }

    /// The `tracing` level name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Quiet => "warn",
            Self::Normal => "info",
            Self::Verbose => "debug",
            Self::Trace => "trace",
        }
    }

    /// `EnvFilter` directive for this level.
    pub fn directive(&self) -> String {
        let mut directive = if *self == Self::Trace {
            "trace".to_string()
        } else {
            "warn".to_string()
        };
        for target in OWN_TARGETS {
            directive.push_str(&format!(",{target}={}", self.name()));
        }
        directive
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global subscriber.
pub fn init_logging(level: LogLevel, format: LogFormat) -> CliResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.directive()))
        .map_err(|e| CliError::Config(format!("invalid log filter: {e}")))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Text => registry
            .with(
                tracing_fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(level >= LogLevel::Verbose),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .flatten_event(true),
            )
            .try_init(),
    };
    result.map_err(|e| CliError::Internal(format!("cannot install logger: {e}")))
}
