//! Plan and report rendering

use serde_json::json;

use rolesync_engine::{ActionStatus, SyncOutcome};

use crate::error::CliResult;

fn status_tag(status: &ActionStatus) -> &'static str {
    match status {
        ActionStatus::Planned => "plan",
        ActionStatus::Applied => "done",
        ActionStatus::Failed(_) => "FAILED",
        ActionStatus::Skipped => "skipped",
    }
}

/// Human-readable report, one line per action and a summary.
pub fn render_text(outcome: &SyncOutcome, show_sql: bool) -> String {
    let report = &outcome.report;
    let mut out = String::new();

    for item in &report.outcomes {
        out.push_str(&format!("[{}] {}\n", status_tag(&item.status), item.action));
        if let ActionStatus::Failed(error) = &item.status {
            out.push_str(&format!("    error: {error}\n"));
        }
        if show_sql {
            for statement in item.action.statements() {
                match &statement.database {
                    Some(db) => out.push_str(&format!("    {db}: {}\n", statement.sql)),
                    None => out.push_str(&format!("    {}\n", statement.sql)),
                }
            }
        }
    }

    let summary = if report.outcomes.is_empty() {
        "Nothing to do.".to_string()
    } else if report.dry_run {
        format!(
            "{} change(s) planned. Use --real to apply.",
            report.outcomes.len()
        )
    } else {
        format!(
            "{} applied, {} failed, {} skipped.",
            report.applied(),
            report.failed(),
            report.skipped()
        )
    };
    out.push_str(&summary);
    if report.cancelled {
        out.push_str(" Cancelled.");
    }
    out.push('\n');
    out
}

/// Machine-readable report.
pub fn render_json(outcome: &SyncOutcome) -> CliResult<String> {
    let document = json!({
        "dry_run": outcome.report.dry_run,
        "cancelled": outcome.report.cancelled,
        "session": {
            "user": outcome.session.user,
            "server_version": outcome.session.server_version,
            "superuser": outcome.session.is_superuser,
        },
        "actions": outcome.report.outcomes,
        "statistics": outcome.statistics,
    });
    Ok(serde_json::to_string_pretty(&document)?)
}
