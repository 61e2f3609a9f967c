//! One synchronization run driven by the command line.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rolesync_core::{Config, PrivilegeCatalog, SyncError};
use rolesync_engine::{SyncOutcome, Synchronizer};
use rolesync_ldap::{LdapDirectory, LdapSettings};
use rolesync_postgres::{PgSettings, PostgresClient};

use crate::args::Cli;
use crate::config::{discover_default, load};
use crate::error::{CliError, CliResult};
use crate::logging::LogLevel;
use crate::output::{render_json, render_text};

/// Load configuration, connect, synchronize and print the outcome.
pub async fn run(cli: Cli, cancel: CancellationToken) -> CliResult<()> {
    let source = discover_default(cli.config.as_deref())?;
    let config = load(&source)?;
    check_privileges(&config)?;

    let outcome = synchronize(&cli, &config, cancel).await?;

    if cli.json {
        println!("{}", render_json(&outcome)?);
    } else {
        print!("{}", render_text(&outcome, cli.log_level() >= LogLevel::Verbose));
    }
    exit_status(&cli, &outcome)
}

/// Validate privilege groups and references before any connection is opened.
pub fn check_privileges(config: &Config) -> CliResult<()> {
    let catalog = PrivilegeCatalog::with_groups(&config.privileges).map_err(SyncError::from)?;
    config.check_privileges(&catalog)?;
    debug!("Privilege references checked");
    Ok(())
}

async fn synchronize(cli: &Cli, config: &Config, cancel: CancellationToken) -> CliResult<SyncOutcome> {
    let postgres = PostgresClient::new(PgSettings::from_env()?)?;

    let directory = if config.needs_ldap() {
        let directory = LdapDirectory::new(LdapSettings::from_env()?);
        directory.bind().await?;
        Some(directory)
    } else {
        debug!("No ldapsearch in configuration, skipping LDAP connection");
        None
    };

    let mut synchronizer = Synchronizer::new(config, &postgres)
        .with_options(cli.sync_options())
        .with_cancellation(cancel);
    if let Some(directory) = &directory {
        synchronizer = synchronizer.with_directory(directory);
    }
    let result = synchronizer.run().await;

    if let Some(directory) = &directory {
        directory.unbind().await;
    }
    postgres.close().await;

    let outcome = result?;
    info!(
        user = %outcome.session.user,
        actions = outcome.report.outcomes.len(),
        "Run complete"
    );
    Ok(outcome)
}

/// Map a completed run to the process status.
pub fn exit_status(cli: &Cli, outcome: &SyncOutcome) -> CliResult<()> {
    let report = &outcome.report;
    if report.cancelled {
        return Err(CliError::Cancelled);
    }
    if report.failed() > 0 {
        return Err(CliError::ExecutionFailed {
            failed: report.failed(),
        });
    }
    if cli.check && outcome.has_changes() {
        return Err(CliError::ChangesPending {
            count: report.outcomes.len(),
        });
    }
    Ok(())
}
