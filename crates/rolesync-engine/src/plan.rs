//! Synchronization planning
//!
//! [`Planner::diff`] compares current and wanted state and returns an ordered
//! list of [`SyncAction`]. It never executes anything.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::debug;

use rolesync_core::role::comment_sql;
use rolesync_core::sql::{quote_ident, quote_literal};
use rolesync_core::{
    CatalogError, CurrentState, Grant, ManagedScope, Membership, Privilege, PrivilegeCatalog,
    Role, RoleOptions, SyncResult, WantedState,
};

/// One SQL statement and the database it must run in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statement {
    /// `None` runs on the default database.
    pub database: Option<String>,
    pub sql: String,
}

impl Statement {
    fn default_db(sql: impl Into<String>) -> Self {
        Self {
            database: None,
            sql: sql.into(),
        }
    }

    fn on(database: &str, sql: impl Into<String>) -> Self {
        Self {
            database: Some(database.to_string()),
            sql: sql.into(),
        }
    }
}

/// Category of an action, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RenameRole,
    CreateRole,
    AlterRoleOptions,
    SetComment,
    AddMember,
    Grant,
    Revoke,
    RemoveMember,
    DropRole,
    ReassignOwnedAndDrop,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::RenameRole => "rename_role",
            ActionKind::CreateRole => "create_role",
            ActionKind::AlterRoleOptions => "alter_role_options",
            ActionKind::SetComment => "set_comment",
            ActionKind::AddMember => "add_member",
            ActionKind::Grant => "grant",
            ActionKind::Revoke => "revoke",
            ActionKind::RemoveMember => "remove_member",
            ActionKind::DropRole => "drop_role",
            ActionKind::ReassignOwnedAndDrop => "reassign_owned_and_drop",
        }
    }

    /// Execution phase. Both drop variants share the last one.
    fn phase(self) -> u8 {
        match self {
            ActionKind::RenameRole => 0,
            ActionKind::CreateRole => 1,
            ActionKind::AlterRoleOptions => 2,
            ActionKind::SetComment => 3,
            ActionKind::AddMember => 4,
            ActionKind::Grant => 5,
            ActionKind::Revoke => 6,
            ActionKind::RemoveMember => 7,
            ActionKind::DropRole | ActionKind::ReassignOwnedAndDrop => 8,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memberships a non-superuser session needs before it can reassign and
/// drop another role's objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Takeover {
    /// The connected role.
    pub by: String,
    /// The dropped role is a member of `by`; revoked first to avoid a loop.
    pub break_loop: bool,
    /// `by` is not yet a member of the dropped role.
    pub grant: bool,
}

impl Takeover {
    fn statements(&self, role: &str) -> Vec<Statement> {
        let mut statements = Vec::new();
        if self.break_loop {
            statements.push(Statement::default_db(Membership::new(role, &self.by).revoke_sql()));
        }
        if self.grant {
            statements.push(Statement::default_db(Membership::new(&self.by, role).grant_sql()));
        }
        statements
    }
}

/// A change to apply to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Case-only rename of an existing role.
    RenameRole {
        from: String,
        to: String,
    },
    CreateRole {
        role: Role,
    },
    AlterRoleOptions {
        role: String,
        changes: RoleOptions,
    },
    SetComment {
        role: String,
        comment: String,
    },
    AddMember {
        membership: Membership,
    },
    Grant {
        grant: Grant,
        privilege: Privilege,
    },
    Revoke {
        grant: Grant,
        privilege: Privilege,
    },
    RemoveMember {
        membership: Membership,
    },
    /// Drop a role owning nothing: `DROP OWNED` in each database, then `DROP ROLE`.
    DropRole {
        role: String,
        databases: Vec<String>,
        takeover: Option<Takeover>,
    },
    /// Reassign owned objects to `fallback_owner`, then drop.
    ReassignOwnedAndDrop {
        role: String,
        fallback_owner: String,
        databases: Vec<String>,
        takeover: Option<Takeover>,
    },
}

impl SyncAction {
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            SyncAction::RenameRole { .. } => ActionKind::RenameRole,
            SyncAction::CreateRole { .. } => ActionKind::CreateRole,
            SyncAction::AlterRoleOptions { .. } => ActionKind::AlterRoleOptions,
            SyncAction::SetComment { .. } => ActionKind::SetComment,
            SyncAction::AddMember { .. } => ActionKind::AddMember,
            SyncAction::Grant { .. } => ActionKind::Grant,
            SyncAction::Revoke { .. } => ActionKind::Revoke,
            SyncAction::RemoveMember { .. } => ActionKind::RemoveMember,
            SyncAction::DropRole { .. } => ActionKind::DropRole,
            SyncAction::ReassignOwnedAndDrop { .. } => ActionKind::ReassignOwnedAndDrop,
        }
    }

    /// Kind of object the action targets.
    #[must_use]
    pub fn object_type(&self) -> &'static str {
        match self {
            SyncAction::Grant { privilege, .. } | SyncAction::Revoke { privilege, .. } => {
                privilege.kind.as_str()
            }
            SyncAction::AddMember { .. } | SyncAction::RemoveMember { .. } => "membership",
            _ => "role",
        }
    }

    /// Identifier of the target, used for ordering and display.
    #[must_use]
    pub fn target(&self) -> String {
        match self {
            SyncAction::RenameRole { to, .. } => to.clone(),
            SyncAction::CreateRole { role } => role.name.clone(),
            SyncAction::AlterRoleOptions { role, .. }
            | SyncAction::SetComment { role, .. }
            | SyncAction::DropRole { role, .. }
            | SyncAction::ReassignOwnedAndDrop { role, .. } => role.clone(),
            SyncAction::AddMember { membership } | SyncAction::RemoveMember { membership } => {
                membership.to_string()
            }
            SyncAction::Grant { grant, .. } | SyncAction::Revoke { grant, .. } => {
                format!("{} {} {}", grant.target, grant.privilege, grant.grantee)
            }
        }
    }

    /// Roles this action needs to exist.
    #[must_use]
    pub fn referenced_roles(&self) -> Vec<&str> {
        match self {
            SyncAction::RenameRole { from, .. } => vec![from.as_str()],
            SyncAction::CreateRole { role } => vec![role.name.as_str()],
            SyncAction::AddMember { membership } | SyncAction::RemoveMember { membership } => {
                vec![membership.member.as_str(), membership.group.as_str()]
            }
            SyncAction::Grant { grant, .. } | SyncAction::Revoke { grant, .. } => {
                vec![grant.grantee.as_str()]
            }
            SyncAction::AlterRoleOptions { role, .. }
            | SyncAction::SetComment { role, .. }
            | SyncAction::DropRole { role, .. }
            | SyncAction::ReassignOwnedAndDrop { role, .. } => vec![role.as_str()],
        }
    }

    /// SQL statements, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<Statement> {
        match self {
            SyncAction::RenameRole { from, to } => vec![Statement::default_db(format!(
                "ALTER ROLE {} RENAME TO {};",
                quote_ident(from),
                quote_ident(to)
            ))],
            SyncAction::CreateRole { role } => {
                role.create_sql().into_iter().map(Statement::default_db).collect()
            }
            SyncAction::AlterRoleOptions { role, changes } => {
                vec![Statement::default_db(Role::alter_sql(role, changes))]
            }
            SyncAction::SetComment { role, comment } => {
                vec![Statement::default_db(comment_sql(role, comment))]
            }
            SyncAction::AddMember { membership } => {
                vec![Statement::default_db(membership.grant_sql())]
            }
            SyncAction::RemoveMember { membership } => {
                vec![Statement::default_db(membership.revoke_sql())]
            }
            SyncAction::Grant { grant, privilege } => vec![Statement {
                database: privilege
                    .kind
                    .is_schema_scoped()
                    .then(|| grant.target.database.clone()),
                sql: privilege.grant_sql(&grant.target, &grant.grantee),
            }],
            SyncAction::Revoke { grant, privilege } => vec![Statement {
                database: privilege
                    .kind
                    .is_schema_scoped()
                    .then(|| grant.target.database.clone()),
                sql: privilege.revoke_sql(&grant.target, &grant.grantee),
            }],
            SyncAction::DropRole {
                role,
                databases,
                takeover,
            } => drop_statements(role, None, databases, takeover.as_ref()),
            SyncAction::ReassignOwnedAndDrop {
                role,
                fallback_owner,
                databases,
                takeover,
            } => drop_statements(
                role,
                Some(fallback_owner.as_str()),
                databases,
                takeover.as_ref(),
            ),
        }
    }
}

fn drop_statements(
    role: &str,
    fallback_owner: Option<&str>,
    databases: &[String],
    takeover: Option<&Takeover>,
) -> Vec<Statement> {
    let ident = quote_ident(role);
    let mut statements = vec![Statement::default_db(format!(
        "SELECT pg_catalog.pg_terminate_backend(pid) FROM pg_catalog.pg_stat_activity WHERE usename = {};",
        quote_literal(role)
    ))];
    if let Some(takeover) = takeover {
        statements.extend(takeover.statements(role));
    }
    for database in databases {
        if let Some(owner) = fallback_owner {
            statements.push(Statement::on(
                database,
                format!("REASSIGN OWNED BY {ident} TO {};", quote_ident(owner)),
            ));
        }
        statements.push(Statement::on(database, format!("DROP OWNED BY {ident};")));
    }
    statements.push(Statement::default_db(format!("DROP ROLE {ident};")));
    statements
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::RenameRole { from, to } => write!(f, "Rename role {from} to {to}"),
            SyncAction::CreateRole { role } => write!(f, "Create role {}", role.name),
            SyncAction::AlterRoleOptions { role, changes } => {
                write!(f, "Alter role {role} with {changes}")
            }
            SyncAction::SetComment { role, comment } => {
                write!(f, "Set comment of {role} to {comment:?}")
            }
            SyncAction::AddMember { membership } => {
                write!(f, "Add {} to {}", membership.member, membership.group)
            }
            SyncAction::RemoveMember { membership } => {
                write!(f, "Remove {} from {}", membership.member, membership.group)
            }
            SyncAction::Grant { grant, .. } => write!(f, "Grant {grant}"),
            SyncAction::Revoke { grant, .. } => write!(f, "Revoke {grant}"),
            SyncAction::DropRole { role, .. } => write!(f, "Drop role {role}"),
            SyncAction::ReassignOwnedAndDrop {
                role,
                fallback_owner,
                ..
            } => write!(f, "Reassign objects of {role} to {fallback_owner} and drop it"),
        }
    }
}

/// Machine-readable view of an action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionSummary {
    pub kind: ActionKind,
    pub object_type: &'static str,
    pub target: String,
    pub description: String,
    pub statements: Vec<Statement>,
}

impl From<&SyncAction> for ActionSummary {
    fn from(action: &SyncAction) -> Self {
        Self {
            kind: action.kind(),
            object_type: action.object_type(),
            target: action.target(),
            description: action.to_string(),
            statements: action.statements(),
        }
    }
}

/// Computes the ordered plan.
pub struct Planner<'a> {
    catalog: &'a PrivilegeCatalog,
    scope: &'a ManagedScope,
    fallback_owner: String,
    superuser: bool,
    me: Option<String>,
    databases: Vec<String>,
}

impl<'a> Planner<'a> {
    #[must_use]
    pub fn new(catalog: &'a PrivilegeCatalog, scope: &'a ManagedScope) -> Self {
        Self {
            catalog,
            scope,
            fallback_owner: rolesync_core::config::DEFAULT_FALLBACK_OWNER.to_string(),
            superuser: true,
            me: None,
            databases: Vec::new(),
        }
    }

    #[must_use]
    pub fn fallback_owner(mut self, owner: impl Into<String>) -> Self {
        self.fallback_owner = owner.into();
        self
    }

    /// Whether the connected role may manage superuser-only options.
    #[must_use]
    pub fn superuser(mut self, superuser: bool) -> Self {
        self.superuser = superuser;
        self
    }

    /// The connected role, which takes over dropped roles when not superuser.
    #[must_use]
    pub fn connected_as(mut self, me: impl Into<String>) -> Self {
        self.me = Some(me.into());
        self
    }

    /// Databases in which a dropped role's objects and privileges are cleaned.
    #[must_use]
    pub fn databases<I, S>(mut self, databases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.databases = databases.into_iter().map(Into::into).collect();
        self
    }

    fn privilege(&self, name: &str) -> Result<Privilege, CatalogError> {
        self.catalog
            .privilege(name)
            .cloned()
            .ok_or_else(|| CatalogError::Undefined {
                name: name.to_string(),
                referenced_by: "grant".to_string(),
            })
    }

    /// Ordered actions converging `current` to `wanted`.
    pub fn diff(&self, current: &CurrentState, wanted: &WantedState) -> SyncResult<Vec<SyncAction>> {
        let mut actions = Vec::new();

        let mut current = current.clone();
        let mut scope = self.scope.clone();
        for (from, to) in self.renames(&current, wanted) {
            current.rename_role(&from, &to);
            scope.insert(to.clone());
            actions.push(SyncAction::RenameRole { from, to });
        }
        let current = &current;
        let scope = &scope;

        let dropped: BTreeSet<&str> = current
            .roles
            .keys()
            .filter(|name| scope.contains(name) && !wanted.roles.contains_key(*name))
            .map(String::as_str)
            .collect();

        self.diff_roles(current, wanted, scope, &dropped, &mut actions);
        self.diff_memberships(current, wanted, scope, &dropped, &mut actions);
        self.diff_grants(current, wanted, scope, &dropped, &mut actions)?;

        actions.sort_by(|a, b| {
            (a.kind().phase(), a.object_type(), a.target())
                .cmp(&(b.kind().phase(), b.object_type(), b.target()))
        });
        debug!(actions = actions.len(), "Computed plan");
        Ok(actions)
    }

    /// Wanted roles that exist in scope under another case only. Skips
    /// names matching several existing roles.
    fn renames(&self, current: &CurrentState, wanted: &WantedState) -> Vec<(String, String)> {
        let mut renames: Vec<(String, String)> = Vec::new();
        for name in wanted.roles.keys() {
            if current.roles.contains_key(name) {
                continue;
            }
            let candidates: Vec<&String> = current
                .roles
                .keys()
                .filter(|existing| {
                    existing.to_lowercase() == name.to_lowercase()
                        && self.scope.contains(existing)
                        && !wanted.roles.contains_key(*existing)
                        && !renames.iter().any(|(from, _)| from == *existing)
                })
                .collect();
            match candidates.as_slice() {
                [from] => renames.push(((*from).clone(), name.clone())),
                [] => {}
                _ => debug!(role = %name, "Several roles differ only by case, not renaming"),
            }
        }
        renames
    }

    fn diff_roles(
        &self,
        current: &CurrentState,
        wanted: &WantedState,
        scope: &ManagedScope,
        dropped: &BTreeSet<&str>,
        actions: &mut Vec<SyncAction>,
    ) {
        for (name, role) in &wanted.roles {
            let mut options = role.options.clone();
            options.retain_supported(self.superuser);

            let Some(existing) = current.roles.get(name) else {
                actions.push(SyncAction::CreateRole {
                    role: Role {
                        name: name.clone(),
                        options,
                        comment: role.comment.clone(),
                    },
                });
                continue;
            };
            if !scope.contains(name) {
                continue;
            }

            let mut full = role.options.with_defaults();
            full.retain_supported(self.superuser);
            let changes = existing.options.changes_to(&full);
            if !changes.is_empty() {
                actions.push(SyncAction::AlterRoleOptions {
                    role: name.clone(),
                    changes,
                });
            }
            if let Some(comment) = &role.comment {
                if existing.comment.as_ref() != Some(comment) {
                    actions.push(SyncAction::SetComment {
                        role: name.clone(),
                        comment: comment.clone(),
                    });
                }
            }
        }

        for name in dropped {
            let owns = current.owning_databases(name);
            let takeover = self.takeover(current, name);
            actions.push(if owns.is_empty() {
                SyncAction::DropRole {
                    role: name.to_string(),
                    databases: self.databases.clone(),
                    takeover,
                }
            } else {
                SyncAction::ReassignOwnedAndDrop {
                    role: name.to_string(),
                    fallback_owner: self.fallback_owner.clone(),
                    databases: self.databases.clone(),
                    takeover,
                }
            });
        }
    }

    fn takeover(&self, current: &CurrentState, role: &str) -> Option<Takeover> {
        if self.superuser {
            return None;
        }
        let me = self.me.as_deref()?;
        let takeover = Takeover {
            by: me.to_string(),
            break_loop: current.memberships.contains(&Membership::new(role, me)),
            grant: !current.memberships.contains(&Membership::new(me, role)),
        };
        (takeover.break_loop || takeover.grant).then_some(takeover)
    }

    fn diff_memberships(
        &self,
        current: &CurrentState,
        wanted: &WantedState,
        scope: &ManagedScope,
        dropped: &BTreeSet<&str>,
        actions: &mut Vec<SyncAction>,
    ) {
        for membership in wanted.memberships.difference(&current.memberships) {
            actions.push(SyncAction::AddMember {
                membership: membership.clone(),
            });
        }
        for membership in current.memberships.difference(&wanted.memberships) {
            if !scope.contains(&membership.member)
                || dropped.contains(membership.member.as_str())
                || dropped.contains(membership.group.as_str())
            {
                continue;
            }
            actions.push(SyncAction::RemoveMember {
                membership: membership.clone(),
            });
        }
    }

    fn diff_grants(
        &self,
        current: &CurrentState,
        wanted: &WantedState,
        scope: &ManagedScope,
        dropped: &BTreeSet<&str>,
        actions: &mut Vec<SyncAction>,
    ) -> SyncResult<()> {
        for grant in &wanted.grants {
            if !current.is_granted(grant) {
                actions.push(SyncAction::Grant {
                    grant: grant.clone(),
                    privilege: self.privilege(&grant.privilege)?,
                });
            }
        }
        for grant in current.grants.keys() {
            if wanted.grants.contains(grant)
                || !scope.contains(&grant.grantee)
                || dropped.contains(grant.grantee.as_str())
            {
                continue;
            }
            actions.push(SyncAction::Revoke {
                grant: grant.clone(),
                privilege: self.privilege(&grant.privilege)?,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolesync_core::{GrantTarget, RoleOption};

    #[test]
    fn test_drop_statements() {
        let action = SyncAction::ReassignOwnedAndDrop {
            role: "bob".into(),
            fallback_owner: "postgres".into(),
            databases: vec!["app".into()],
            takeover: None,
        };
        let sql: Vec<String> = action.statements().into_iter().map(|s| s.sql).collect();
        assert_eq!(
            sql,
            vec![
                "SELECT pg_catalog.pg_terminate_backend(pid) FROM pg_catalog.pg_stat_activity WHERE usename = 'bob';",
                "REASSIGN OWNED BY \"bob\" TO \"postgres\";",
                "DROP OWNED BY \"bob\";",
                "DROP ROLE \"bob\";",
            ]
        );
    }

    #[test]
    fn test_takeover_statements_precede_reassign() {
        let action = SyncAction::ReassignOwnedAndDrop {
            role: "bob".into(),
            fallback_owner: "postgres".into(),
            databases: vec!["app".into()],
            takeover: Some(Takeover {
                by: "sync".into(),
                break_loop: true,
                grant: true,
            }),
        };
        let statements = action.statements();
        let sql: Vec<&str> = statements.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(
            sql[1..4],
            [
                "REVOKE \"sync\" FROM \"bob\";",
                "GRANT \"bob\" TO \"sync\";",
                "REASSIGN OWNED BY \"bob\" TO \"postgres\";",
            ]
        );
        assert_eq!(statements[1].database, None);
    }

    #[test]
    fn test_grant_statement_database() {
        let catalog = PrivilegeCatalog::builtin().unwrap();
        let action = SyncAction::Grant {
            grant: Grant::new("reader", "__usage_on_schemas__", GrantTarget::schema("app", "public")),
            privilege: catalog.privilege("__usage_on_schemas__").cloned().unwrap(),
        };
        let statements = action.statements();
        assert_eq!(statements[0].database.as_deref(), Some("app"));
        assert_eq!(statements[0].sql, "GRANT USAGE ON SCHEMA \"public\" TO \"reader\";");

        let connect = SyncAction::Grant {
            grant: Grant::new("reader", "__connect__", GrantTarget::database("app")),
            privilege: catalog.privilege("__connect__").cloned().unwrap(),
        };
        assert_eq!(connect.statements()[0].database, None);
    }

    #[test]
    fn test_superuser_options_skipped_for_non_superuser() {
        let catalog = PrivilegeCatalog::builtin().unwrap();
        let scope = ManagedScope::new(["alice"]);
        let mut current = CurrentState::default();
        current.roles.insert(
            "alice".into(),
            Role::new("alice").with_options(RoleOptions::defaults()),
        );
        let mut wanted = WantedState::default();
        wanted.roles.insert(
            "alice".into(),
            Role::new("alice").with_options(RoleOptions::new().with(RoleOption::BypassRls, true)),
        );

        let planner = Planner::new(&catalog, &scope).superuser(false);
        assert!(planner.diff(&current, &wanted).unwrap().is_empty());

        let planner = Planner::new(&catalog, &scope).superuser(true);
        let actions = planner.diff(&current, &wanted).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), ActionKind::AlterRoleOptions);
    }

    #[test]
    fn test_comment_untouched_when_not_configured() {
        let catalog = PrivilegeCatalog::builtin().unwrap();
        let scope = ManagedScope::new(["alice"]);
        let mut current = CurrentState::default();
        current.roles.insert(
            "alice".into(),
            Role::new("alice")
                .with_options(RoleOptions::defaults())
                .with_comment("managed by hand"),
        );
        let mut wanted = WantedState::default();
        wanted.roles.insert("alice".into(), Role::new("alice"));
        assert!(Planner::new(&catalog, &scope)
            .diff(&current, &wanted)
            .unwrap()
            .is_empty());

        wanted.roles.insert("alice".into(), Role::new("alice").with_comment("Alice"));
        let actions = Planner::new(&catalog, &scope).diff(&current, &wanted).unwrap();
        assert_eq!(
            actions,
            vec![SyncAction::SetComment {
                role: "alice".into(),
                comment: "Alice".into()
            }]
        );
    }
}
