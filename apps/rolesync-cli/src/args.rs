//! Command-line arguments

use std::path::PathBuf;

use clap::Parser;

use rolesync_engine::{RetryConfig, SyncOptions};

use crate::logging::{LogFormat, LogLevel};

/// Synchronize PostgreSQL roles and privileges from LDAP and YAML rules.
///
/// Without --real, the plan is only shown.
#[derive(Debug, Parser)]
#[command(name = "rolesync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file, `-` for stdin
    #[arg(short, long, env = "ROLESYNC_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Apply the plan
    #[arg(short = 'R', long, conflicts_with = "check")]
    pub real: bool,

    /// Dry run, exit with code 4 when changes are pending
    #[arg(short = 'C', long)]
    pub check: bool,

    /// Keep applying actions after a failure
    #[arg(long)]
    pub continue_on_error: bool,

    /// Skip a sync item on template errors instead of aborting
    #[arg(long)]
    pub isolate_template_errors: bool,

    /// Print the plan and report as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// More logs, repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Warnings and errors only
    #[arg(short, long)]
    pub quiet: bool,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Maximum LDAP searches in flight
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    pub ldap_concurrency: u16,
}

impl Cli {
    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_flags(self.verbose, self.quiet)
    }

    pub fn dry_run(&self) -> bool {
        !self.real
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            dry_run: self.dry_run(),
            continue_on_error: self.continue_on_error,
            isolate_template_errors: self.isolate_template_errors,
            ldap_concurrency: usize::from(self.ldap_concurrency),
            retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("rolesync").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_to_dry_run() {
        let cli = parse(&[]);
        assert!(cli.dry_run());
        assert_eq!(cli.ldap_concurrency, 4);
        assert_eq!(cli.log_format, LogFormat::Text);
        assert_eq!(cli.log_level(), LogLevel::Normal);
    }

    #[test]
    fn test_real_with_options() {
        let cli = parse(&["--real", "--continue-on-error", "-vv", "--ldap-concurrency", "8"]);
        let options = cli.sync_options();
        assert!(!options.dry_run);
        assert!(options.continue_on_error);
        assert_eq!(options.ldap_concurrency, 8);
        assert_eq!(cli.log_level(), LogLevel::Trace);
    }

    #[test]
    fn test_real_conflicts_with_check() {
        let result = Cli::try_parse_from(["rolesync", "--real", "--check"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = Cli::try_parse_from(["rolesync", "--ldap-concurrency", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_json_log_format() {
        let cli = parse(&["--log-format", "json", "-q"]);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.log_level(), LogLevel::Quiet);
    }
}
