//! End-to-end synchronization run.
//!
//! Catalog validation happens before any I/O. Directory expansion and
//! cluster inspection then run concurrently, and nothing is executed until
//! both have completed and the plan has been computed.

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use rolesync_core::{
    Config, CurrentState, Directory, PgClient, PrivilegeCatalog, SyncError, SyncResult,
    WantedState,
};

use crate::execute::{ExecutionReport, Executor};
use crate::expand::RuleExpander;
use crate::inspect::{RoleBlacklist, SessionInfo, StateInspector};
use crate::plan::{Planner, SyncAction};
use crate::retry::RetryConfig;
use crate::statistics::RunStatistics;

/// Run-time switches.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub continue_on_error: bool,
    pub isolate_template_errors: bool,
    pub ldap_concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            continue_on_error: false,
            isolate_template_errors: false,
            ldap_concurrency: 4,
            retry: RetryConfig::default(),
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub session: SessionInfo,
    pub report: ExecutionReport,
    pub statistics: RunStatistics,
}

impl SyncOutcome {
    /// Whether the cluster differs (or differed) from the wanted state.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.report.outcomes.is_empty()
    }
}

pub struct Synchronizer<'a> {
    config: &'a Config,
    client: &'a dyn PgClient,
    directory: Option<&'a dyn Directory>,
    options: SyncOptions,
    cancel: CancellationToken,
}

impl<'a> Synchronizer<'a> {
    #[must_use]
    pub fn new(config: &'a Config, client: &'a dyn PgClient) -> Self {
        Self {
            config,
            client,
            directory: None,
            options: SyncOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_directory(mut self, directory: &'a dyn Directory) -> Self {
        self.directory = Some(directory);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the user catalog and check every privilege reference.
    pub fn catalog(&self) -> SyncResult<PrivilegeCatalog> {
        let catalog = PrivilegeCatalog::with_groups(&self.config.privileges)?;
        self.config.check_privileges(&catalog)?;
        Ok(catalog)
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Expand, inspect, plan and execute.
    #[instrument(skip(self), fields(dry_run = self.options.dry_run))]
    pub async fn run(&self) -> SyncResult<SyncOutcome> {
        let mut statistics = RunStatistics::start();
        let catalog = self.catalog()?;
        self.check_cancelled()?;

        let mut expander = RuleExpander::new(&catalog)
            .with_concurrency(self.options.ldap_concurrency)
            .isolate_template_errors(self.options.isolate_template_errors);
        if let Some(directory) = self.directory {
            expander = expander.with_directory(directory);
        }
        let inspector = StateInspector::new(self.client, &self.config.postgres)
            .with_retry(self.options.retry.clone());

        let gathered = async {
            tokio::try_join!(expander.expand(self.config), inspector.inspect_cluster())
        };
        let (expansion, cluster) = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            result = gathered => result?,
        };

        statistics.ldap_searches = expansion.searches;
        statistics.ldap_entries = expansion.entries;
        statistics.skipped_items = expansion.skipped_items;

        let mut current = cluster.current;
        let mut wanted = expansion.wanted;
        let blacklist = RoleBlacklist::new(&self.config.postgres.roles_blacklist)?;
        drop_unmanaged_roles(&mut wanted, &current, &cluster.scope, &blacklist, &cluster.session.user);

        wanted.resolve_grants(&cluster.topology, |name| {
            catalog
                .privilege(name)
                .is_some_and(|p| p.kind.is_schema_scoped())
        });
        wanted.grants.retain(|grant| {
            let known = cluster.topology.databases.contains_key(&grant.target.database);
            if !known {
                warn!(grant = %grant, "Ignoring grant on unknown database");
            }
            known
        });
        check_role_references(&wanted, &current)?;
        statistics.wanted_roles = wanted.roles.len();
        statistics.wanted_grants = wanted.grants.len();

        statistics.privilege_queries = inspector
            .inspect_grants(
                &catalog,
                &wanted.referenced_privileges(),
                &cluster.topology,
                &mut current,
            )
            .await?;
        statistics.mark_inspected();

        let actions = Planner::new(&catalog, &cluster.scope)
            .fallback_owner(&self.config.postgres.fallback_owner)
            .superuser(cluster.session.is_superuser)
            .connected_as(&cluster.session.user)
            .databases(cluster.topology.databases.keys().cloned())
            .diff(&current, &wanted)?;
        info!(actions = actions.len(), "Plan ready");
        self.check_cancelled()?;

        let report = self.execute(actions).await;
        statistics.finish(&report);
        info!(
            applied = statistics.applied,
            failed = statistics.failed,
            elapsed_ms = statistics.elapsed_ms().unwrap_or_default(),
            "Synchronization finished"
        );

        Ok(SyncOutcome {
            session: cluster.session,
            report,
            statistics,
        })
    }

    async fn execute(&self, actions: Vec<SyncAction>) -> ExecutionReport {
        Executor::new(self.client)
            .dry_run(self.options.dry_run)
            .continue_on_error(self.options.continue_on_error)
            .with_cancellation(self.cancel.clone())
            .execute(actions)
            .await
    }
}

/// Remove wanted roles the run may not touch, with the memberships and
/// grants they would receive.
fn drop_unmanaged_roles(
    wanted: &mut WantedState,
    current: &CurrentState,
    scope: &rolesync_core::ManagedScope,
    blacklist: &RoleBlacklist,
    me: &str,
) {
    let ignored = |name: &str| {
        name == me
            || blacklist.matches(name)
            || (current.roles.contains_key(name) && !scope.contains(name))
    };

    wanted.roles.retain(|name, _| {
        let skip = name == "public" || ignored(name);
        if skip {
            warn!(role = %name, "Ignoring wanted role outside the managed scope");
        }
        !skip
    });
    wanted.memberships.retain(|membership| {
        let skip = membership.member == "public" || ignored(&membership.member);
        if skip {
            warn!(membership = %membership, "Ignoring membership of a role outside the managed scope");
        }
        !skip
    });
    wanted.grant_specs.retain(|spec| {
        let skip = spec.grantee != "public" && ignored(&spec.grantee);
        if skip {
            warn!(
                grantee = %spec.grantee,
                privilege = %spec.privilege,
                "Ignoring grant to a role outside the managed scope"
            );
        }
        !skip
    });
}

/// Memberships and grants may only name wanted or existing roles.
fn check_role_references(wanted: &WantedState, current: &CurrentState) -> SyncResult<()> {
    let exists = |role: &str| wanted.roles.contains_key(role) || current.roles.contains_key(role);

    for membership in &wanted.memberships {
        for role in [&membership.member, &membership.group] {
            if !exists(role) {
                return Err(SyncError::UnknownRole {
                    role: role.clone(),
                    referenced_by: format!("membership {membership}"),
                });
            }
        }
    }
    for grant in &wanted.grants {
        if grant.grantee != "public" && !exists(&grant.grantee) {
            return Err(SyncError::UnknownRole {
                role: grant.grantee.clone(),
                referenced_by: format!("grant {grant}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolesync_core::{Grant, GrantSpec, GrantTarget, ManagedScope, Membership, ObjectScope, Role};

    #[test]
    fn test_unknown_role_in_membership() {
        let mut wanted = WantedState::default();
        wanted.roles.insert("alice".into(), Role::new("alice"));
        wanted.memberships.insert(Membership::new("alice", "ghosts"));
        let err = check_role_references(&wanted, &CurrentState::default()).unwrap_err();
        assert!(matches!(err, SyncError::UnknownRole { ref role, .. } if role == "ghosts"));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_public_grantee_needs_no_role() {
        let mut wanted = WantedState::default();
        wanted.grants.insert(Grant::new(
            "public",
            "__connect__",
            GrantTarget::database("app"),
        ));
        assert!(check_role_references(&wanted, &CurrentState::default()).is_ok());
    }

    #[test]
    fn test_blacklisted_and_unmanaged_wanted_roles_are_dropped() {
        let mut wanted = WantedState::default();
        for name in ["alice", "pg_monitor", "dba", "me", "fresh"] {
            wanted.roles.insert(name.into(), Role::new(name));
        }
        let mut current = CurrentState::default();
        for name in ["alice", "dba", "me"] {
            current.roles.insert(name.into(), Role::new(name));
        }
        let scope = ManagedScope::new(["alice"]);
        let blacklist = RoleBlacklist::new(&["pg_*".to_string()]).unwrap();

        drop_unmanaged_roles(&mut wanted, &current, &scope, &blacklist, "me");
        assert_eq!(
            wanted.roles.keys().collect::<Vec<_>>(),
            vec!["alice", "fresh"]
        );
    }

    #[test]
    fn test_memberships_and_grants_of_ignored_roles_are_dropped() {
        let mut wanted = WantedState::default();
        wanted.roles.insert("readers".into(), Role::new("readers"));
        wanted.memberships.insert(Membership::new("postgres", "readers"));
        wanted.memberships.insert(Membership::new("alice", "pg_monitor"));
        for grantee in ["pg_monitor", "readers", "public"] {
            wanted.grant_specs.insert(GrantSpec {
                grantee: grantee.into(),
                privilege: "__connect__".into(),
                database: ObjectScope::parse("app"),
                schema: ObjectScope::parse("__all__"),
            });
        }
        let mut current = CurrentState::default();
        for name in ["alice", "postgres", "pg_monitor"] {
            current.roles.insert(name.into(), Role::new(name));
        }
        let scope = ManagedScope::new(["alice"]);
        let blacklist = RoleBlacklist::new(&["pg_*".to_string(), "postgres".to_string()]).unwrap();

        drop_unmanaged_roles(&mut wanted, &current, &scope, &blacklist, "postgres");
        assert_eq!(
            wanted.memberships.into_iter().collect::<Vec<_>>(),
            vec![Membership::new("alice", "pg_monitor")]
        );
        let grantees: Vec<&str> = wanted.grant_specs.iter().map(|s| s.grantee.as_str()).collect();
        assert_eq!(grantees, vec!["public", "readers"]);
    }
}
