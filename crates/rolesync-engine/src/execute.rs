//! Plan execution
//!
//! Actions run strictly in order. The statements of one action are grouped
//! by database and each group runs in its own transaction. Statements that
//! change the cluster are never retried.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rolesync_core::{CollaboratorError, PgClient};

use crate::plan::{ActionSummary, Statement, SyncAction};

/// What happened to one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum ActionStatus {
    /// Dry run: shown, not applied.
    Planned,
    Applied,
    Failed(String),
    /// Not attempted after a failure or cancellation.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub action: SyncAction,
    pub status: ActionStatus,
}

#[derive(Debug, Clone, Serialize)]
struct OutcomeView {
    #[serde(flatten)]
    action: ActionSummary,
    #[serde(flatten)]
    status: ActionStatus,
}

impl Serialize for ActionOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        OutcomeView {
            action: ActionSummary::from(&self.action),
            status: self.status.clone(),
        }
        .serialize(serializer)
    }
}

/// Result of executing a plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub dry_run: bool,
    pub cancelled: bool,
    pub outcomes: Vec<ActionOutcome>,
}

impl ExecutionReport {
    fn count(&self, f: impl Fn(&ActionStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| f(&o.status)).count()
    }

    #[must_use]
    pub fn applied(&self) -> usize {
        self.count(|s| *s == ActionStatus::Applied)
    }

    #[must_use]
    pub fn planned(&self) -> usize {
        self.count(|s| *s == ActionStatus::Planned)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Failed(_)))
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|s| *s == ActionStatus::Skipped)
    }

    /// No failure and not cancelled.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && !self.cancelled
    }
}

/// Applies a plan through a [`PgClient`].
pub struct Executor<'a> {
    client: &'a dyn PgClient,
    dry_run: bool,
    continue_on_error: bool,
    cancel: CancellationToken,
}

impl<'a> Executor<'a> {
    /// A dry-run executor. Call [`Executor::dry_run`] with `false` to apply.
    #[must_use]
    pub fn new(client: &'a dyn PgClient) -> Self {
        Self {
            client,
            dry_run: true,
            continue_on_error: false,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `actions` in order.
    pub async fn execute(&self, actions: Vec<SyncAction>) -> ExecutionReport {
        let mut report = ExecutionReport {
            dry_run: self.dry_run,
            ..ExecutionReport::default()
        };
        let mut stop = false;

        for action in actions {
            if !stop && self.cancel.is_cancelled() {
                warn!("Run cancelled, remaining actions skipped");
                report.cancelled = true;
                stop = true;
            }
            if stop {
                report.outcomes.push(ActionOutcome {
                    action,
                    status: ActionStatus::Skipped,
                });
                continue;
            }

            let status = if self.dry_run {
                info!(action = %action, "Would apply");
                for statement in action.statements() {
                    debug!(database = ?statement.database, sql = %statement.sql, "Would run");
                }
                ActionStatus::Planned
            } else {
                match self.apply(&action).await {
                    Ok(()) => {
                        info!(action = %action, "Applied");
                        ActionStatus::Applied
                    }
                    Err(e) => {
                        error!(
                            action = %action,
                            kind = %action.kind(),
                            target = %action.target(),
                            error = %e,
                            "Action failed"
                        );
                        stop = !self.continue_on_error;
                        ActionStatus::Failed(e.to_string())
                    }
                }
            };
            report.outcomes.push(ActionOutcome { action, status });
        }
        report
    }

    async fn apply(&self, action: &SyncAction) -> Result<(), CollaboratorError> {
        for (database, sql) in group_by_database(action.statements()) {
            for statement in &sql {
                debug!(database = ?database, sql = %statement, "Executing");
            }
            self.client.execute(database.as_deref(), &sql).await?;
        }
        Ok(())
    }
}

/// Split into consecutive runs targeting the same database.
fn group_by_database(statements: Vec<Statement>) -> Vec<(Option<String>, Vec<String>)> {
    let mut groups: Vec<(Option<String>, Vec<String>)> = Vec::new();
    for statement in statements {
        match groups.last_mut() {
            Some((database, sql)) if *database == statement.database => sql.push(statement.sql),
            _ => groups.push((statement.database, vec![statement.sql])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_by_database_keeps_order() {
        let action = SyncAction::ReassignOwnedAndDrop {
            role: "bob".into(),
            fallback_owner: "postgres".into(),
            databases: vec!["app".into(), "billing".into()],
            takeover: None,
        };
        let groups = group_by_database(action.statements());
        let databases: Vec<Option<&str>> = groups.iter().map(|(d, _)| d.as_deref()).collect();
        assert_eq!(databases, vec![None, Some("app"), Some("billing"), None]);
        assert_eq!(groups[1].1.len(), 2);
    }

    #[test]
    fn test_report_counts() {
        let action = SyncAction::DropRole {
            role: "x".into(),
            databases: vec![],
            takeover: None,
        };
        let report = ExecutionReport {
            dry_run: false,
            cancelled: false,
            outcomes: vec![
                ActionOutcome {
                    action: action.clone(),
                    status: ActionStatus::Applied,
                },
                ActionOutcome {
                    action: action.clone(),
                    status: ActionStatus::Failed("boom".into()),
                },
                ActionOutcome {
                    action,
                    status: ActionStatus::Skipped,
                },
            ],
        };
        assert_eq!(report.applied(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
        assert!(!report.is_success());
    }

    #[test]
    fn test_outcome_json_shape() {
        let outcome = ActionOutcome {
            action: SyncAction::DropRole {
                role: "x".into(),
                databases: vec![],
                takeover: None,
            },
            status: ActionStatus::Failed("boom".into()),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "drop_role");
        assert_eq!(json["target"], "x");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");
        assert_eq!(json["statements"].as_array().unwrap().len(), 2);
    }
}
