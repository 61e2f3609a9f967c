//! rolesync - synchronize PostgreSQL roles and privileges from LDAP

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rolesync_cli::logging::init_logging;
use rolesync_cli::{app, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_level(), cli.log_format) {
        e.print();
        std::process::exit(e.exit_code());
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping before the next action");
            on_signal.cancel();
        }
    });

    match app::run(cli, cancel).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            e.print();
            std::process::exit(e.exit_code());
        }
    }
}
