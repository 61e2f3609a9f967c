//! State inspection
//!
//! Read-only queries building the [`CurrentState`]. Every query goes through
//! the retry executor; any failure that survives the retries aborts the run.

use std::collections::BTreeSet;

use regex::Regex;
use tracing::{debug, info, instrument};

use rolesync_core::{
    CollaboratorError, CurrentState, Grant, GrantTarget, ManagedScope, Membership, ObjectRef,
    PgClient, PostgresConfig, PrivilegeCatalog, Role, RoleOption, RoleOptions, SqlRow, SyncError,
    SyncResult, Topology,
};

use crate::retry::{RetryConfig, RetryExecutor};

pub const SESSION_QUERY: &str = "SELECT current_user::text, current_setting('server_version')::text, r.rolsuper
FROM pg_catalog.pg_roles AS r
WHERE r.rolname = current_user";

pub const DATABASES_QUERY: &str = "SELECT d.datname::text
FROM pg_catalog.pg_database AS d
WHERE d.datallowconn AND NOT d.datistemplate
ORDER BY 1";

pub const SCHEMAS_QUERY: &str = "SELECT n.nspname::text
FROM pg_catalog.pg_namespace AS n
WHERE n.nspname NOT LIKE 'pg\\_%' AND n.nspname <> 'information_schema'
ORDER BY 1";

/// Option columns follow [`RoleOption::ALL`].
pub const ROLES_QUERY: &str = "SELECT r.rolname::text,
  r.rolsuper, r.rolcreatedb, r.rolcreaterole, r.rolinherit,
  r.rolcanlogin, r.rolreplication, r.rolbypassrls,
  pg_catalog.shobj_description(r.oid, 'pg_authid')::text
FROM pg_catalog.pg_roles AS r
ORDER BY 1";

pub const MEMBERSHIPS_QUERY: &str = "SELECT m.rolname::text, g.rolname::text
FROM pg_catalog.pg_auth_members AS a
JOIN pg_catalog.pg_roles AS m ON m.oid = a.member
JOIN pg_catalog.pg_roles AS g ON g.oid = a.roleid
ORDER BY 1, 2";

pub const DATABASE_OWNERS_QUERY: &str = "SELECT r.rolname::text, d.datname::text
FROM pg_catalog.pg_database AS d
JOIN pg_catalog.pg_roles AS r ON r.oid = d.datdba";

/// Objects owned in the current database: `(owner, kind, name)`.
pub const OWNERSHIP_QUERY: &str = "SELECT r.rolname::text, 'schema'::text, n.nspname::text
FROM pg_catalog.pg_namespace AS n
JOIN pg_catalog.pg_roles AS r ON r.oid = n.nspowner
WHERE n.nspname NOT LIKE 'pg\\_%' AND n.nspname <> 'information_schema'
UNION ALL
SELECT r.rolname::text,
  CASE c.relkind WHEN 'S' THEN 'sequence' WHEN 'v' THEN 'view' WHEN 'm' THEN 'materialized view' ELSE 'table' END,
  n.nspname::text || '.' || c.relname::text
FROM pg_catalog.pg_class AS c
JOIN pg_catalog.pg_namespace AS n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_roles AS r ON r.oid = c.relowner
WHERE c.relkind IN ('r', 'p', 'v', 'm', 'f', 'S')
  AND n.nspname NOT LIKE 'pg\\_%' AND n.nspname <> 'information_schema'
UNION ALL
SELECT r.rolname::text, 'function'::text, n.nspname::text || '.' || p.proname::text
FROM pg_catalog.pg_proc AS p
JOIN pg_catalog.pg_namespace AS n ON n.oid = p.pronamespace
JOIN pg_catalog.pg_roles AS r ON r.oid = p.proowner
WHERE n.nspname NOT LIKE 'pg\\_%' AND n.nspname <> 'information_schema'";

/// Connected role and server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub user: String,
    pub server_version: String,
    pub is_superuser: bool,
}

/// Cluster-wide state gathered before privileges are inspected.
#[derive(Debug, Clone)]
pub struct ClusterState {
    pub session: SessionInfo,
    pub topology: Topology,
    pub scope: ManagedScope,
    pub current: CurrentState,
}

/// Compiled `roles_blacklist` globs.
#[derive(Debug, Clone)]
pub struct RoleBlacklist {
    patterns: Vec<Regex>,
}

impl RoleBlacklist {
    pub fn new(globs: &[String]) -> SyncResult<Self> {
        let patterns = globs
            .iter()
            .map(|glob| {
                Regex::new(&glob_to_regex(glob))
                    .map_err(|e| SyncError::config("postgres.roles_blacklist", e.to_string()))
            })
            .collect::<SyncResult<_>>()?;
        Ok(Self { patterns })
    }

    #[must_use]
    pub fn matches(&self, role: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(role))
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

fn invalid_row(sql: &str, row: &SqlRow, column: usize) -> SyncError {
    let head = sql.lines().next().unwrap_or_default();
    SyncError::Collaborator(CollaboratorError::invalid_response(format!(
        "unexpected value {:?} in column {column} of '{head}'",
        row.get(column)
    )))
}

fn text(sql: &str, row: &SqlRow, column: usize) -> SyncResult<String> {
    row.get(column)
        .and_then(|v| v.as_text())
        .map(str::to_string)
        .ok_or_else(|| invalid_row(sql, row, column))
}

fn optional_text(sql: &str, row: &SqlRow, column: usize) -> SyncResult<Option<String>> {
    match row.get(column) {
        Some(v) if v.is_null() => Ok(None),
        _ => text(sql, row, column).map(Some),
    }
}

fn boolean(sql: &str, row: &SqlRow, column: usize) -> SyncResult<bool> {
    row.get(column)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| invalid_row(sql, row, column))
}

/// Issues the read-only inspection queries.
pub struct StateInspector<'a> {
    client: &'a dyn PgClient,
    postgres: &'a PostgresConfig,
    retry: RetryExecutor,
}

impl<'a> StateInspector<'a> {
    #[must_use]
    pub fn new(client: &'a dyn PgClient, postgres: &'a PostgresConfig) -> Self {
        Self {
            client,
            postgres,
            retry: RetryExecutor::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryExecutor::new(config);
        self
    }

    async fn query(&self, database: Option<&str>, sql: &str) -> SyncResult<Vec<SqlRow>> {
        Ok(self
            .retry
            .execute(|| self.client.query(database, sql, &[]))
            .await?)
    }

    async fn single_column(&self, database: Option<&str>, sql: &str) -> SyncResult<Vec<String>> {
        self.query(database, sql)
            .await?
            .iter()
            .map(|row| text(sql, row, 0))
            .collect()
    }

    pub async fn session(&self) -> SyncResult<SessionInfo> {
        let rows = self.query(None, SESSION_QUERY).await?;
        let row = rows.first().ok_or_else(|| {
            SyncError::Collaborator(CollaboratorError::invalid_response(
                "current user is not visible in pg_roles",
            ))
        })?;
        Ok(SessionInfo {
            user: text(SESSION_QUERY, row, 0)?,
            server_version: text(SESSION_QUERY, row, 1)?,
            is_superuser: boolean(SESSION_QUERY, row, 2)?,
        })
    }

    /// Databases with their user schemas.
    pub async fn topology(&self) -> SyncResult<Topology> {
        let sql = self
            .postgres
            .databases_query
            .as_deref()
            .unwrap_or(DATABASES_QUERY);
        let mut topology = Topology::default();
        for database in self.single_column(None, sql).await? {
            let schemas = self.single_column(Some(&database), SCHEMAS_QUERY).await?;
            debug!(database = %database, schemas = schemas.len(), "Inspected schemas");
            topology.databases.insert(database, schemas.into_iter().collect());
        }
        Ok(topology)
    }

    pub async fn roles(&self) -> SyncResult<Vec<Role>> {
        let rows = self.query(None, ROLES_QUERY).await?;
        rows.iter()
            .map(|row| {
                let mut options = RoleOptions::new();
                for (i, option) in RoleOption::ALL.into_iter().enumerate() {
                    options.set(option, boolean(ROLES_QUERY, row, i + 1)?);
                }
                Ok(Role {
                    name: text(ROLES_QUERY, row, 0)?,
                    options,
                    comment: optional_text(ROLES_QUERY, row, RoleOption::ALL.len() + 1)?,
                })
            })
            .collect()
    }

    pub async fn memberships(&self) -> SyncResult<BTreeSet<Membership>> {
        let rows = self.query(None, MEMBERSHIPS_QUERY).await?;
        rows.iter()
            .map(|row| {
                Ok(Membership::new(
                    text(MEMBERSHIPS_QUERY, row, 0)?,
                    text(MEMBERSHIPS_QUERY, row, 1)?,
                ))
            })
            .collect()
    }

    /// Roles the run may touch. The connected user and `public` never are.
    pub async fn managed_scope(&self, roles: &[Role], me: &str) -> SyncResult<ManagedScope> {
        let blacklist = RoleBlacklist::new(&self.postgres.roles_blacklist)?;
        let candidates: Vec<String> = match &self.postgres.managed_roles_query {
            Some(sql) => self.single_column(None, sql).await?,
            None => roles.iter().map(|r| r.name.clone()).collect(),
        };
        Ok(ManagedScope::new(candidates.into_iter().filter(|name| {
            name != me && name != "public" && !blacklist.matches(name)
        })))
    }

    /// Objects owned by managed roles, in every database of `topology`.
    pub async fn ownership(
        &self,
        topology: &Topology,
        scope: &ManagedScope,
        current: &mut CurrentState,
    ) -> SyncResult<()> {
        for row in self.query(None, DATABASE_OWNERS_QUERY).await? {
            let owner = text(DATABASE_OWNERS_QUERY, &row, 0)?;
            if scope.contains(&owner) {
                let database = text(DATABASE_OWNERS_QUERY, &row, 1)?;
                current.owned.entry(owner).or_default().insert(ObjectRef {
                    database: database.clone(),
                    kind: "database".to_string(),
                    name: database,
                });
            }
        }
        for database in topology.databases.keys() {
            for row in self.query(Some(database), OWNERSHIP_QUERY).await? {
                let owner = text(OWNERSHIP_QUERY, &row, 0)?;
                if !scope.contains(&owner) {
                    continue;
                }
                current.owned.entry(owner).or_default().insert(ObjectRef {
                    database: database.clone(),
                    kind: text(OWNERSHIP_QUERY, &row, 1)?,
                    name: text(OWNERSHIP_QUERY, &row, 2)?,
                });
            }
        }
        Ok(())
    }

    /// Session, topology, roles, memberships, managed scope and ownership.
    #[instrument(skip(self))]
    pub async fn inspect_cluster(&self) -> SyncResult<ClusterState> {
        let session = self.session().await?;
        info!(
            user = %session.user,
            server_version = %session.server_version,
            superuser = session.is_superuser,
            "Connected to PostgreSQL"
        );

        let topology = self.topology().await?;
        let roles = self.roles().await?;
        let scope = self.managed_scope(&roles, &session.user).await?;

        let mut current = CurrentState {
            roles: roles.into_iter().map(|r| (r.name.clone(), r)).collect(),
            memberships: self.memberships().await?,
            ..CurrentState::default()
        };
        self.ownership(&topology, &scope, &mut current).await?;

        info!(
            databases = topology.databases.len(),
            roles = current.roles.len(),
            managed = scope.len(),
            memberships = current.memberships.len(),
            "Inspected cluster"
        );
        Ok(ClusterState {
            session,
            topology,
            scope,
            current,
        })
    }

    /// Inspect `privileges` and record their grants in `current`.
    ///
    /// Returns the number of inspection queries issued.
    #[instrument(skip_all, fields(privileges = privileges.len()))]
    pub async fn inspect_grants(
        &self,
        catalog: &PrivilegeCatalog,
        privileges: &BTreeSet<&str>,
        topology: &Topology,
        current: &mut CurrentState,
    ) -> SyncResult<usize> {
        let mut queries = 0;
        for name in privileges {
            let privilege = catalog.privilege(name).ok_or_else(|| {
                SyncError::from(rolesync_core::CatalogError::Undefined {
                    name: name.to_string(),
                    referenced_by: "wanted grants".to_string(),
                })
            })?;

            if !privilege.kind.is_schema_scoped() {
                queries += 1;
                for row in self.query(None, &privilege.inspect).await? {
                    let database = text(&privilege.inspect, &row, 0)?;
                    if !topology.databases.contains_key(&database) {
                        continue;
                    }
                    record(current, &privilege.name, GrantTarget::database(database), &privilege.inspect, &row)?;
                }
                continue;
            }

            for database in topology.databases.keys() {
                queries += 1;
                for row in self.query(Some(database), &privilege.inspect).await? {
                    let schema = text(&privilege.inspect, &row, 0)?;
                    record(
                        current,
                        &privilege.name,
                        GrantTarget::schema(database, schema),
                        &privilege.inspect,
                        &row,
                    )?;
                }
            }
            debug!(privilege = %privilege.name, "Inspected privilege");
        }
        Ok(queries)
    }
}

/// Record one `(object, grantee, complete)` row.
fn record(
    current: &mut CurrentState,
    privilege: &str,
    target: GrantTarget,
    sql: &str,
    row: &SqlRow,
) -> SyncResult<()> {
    match optional_text(sql, row, 1)? {
        None => {
            current.vacuous.insert((privilege.to_string(), target));
        }
        Some(grantee) => {
            let complete = boolean(sql, row, 2)?;
            current
                .grants
                .entry(Grant::new(grantee, privilege, target))
                .and_modify(|c| *c |= complete)
                .or_insert(complete);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blacklist_globs() {
        let blacklist =
            RoleBlacklist::new(&["pg_*".to_string(), "postgres".to_string(), "r?s".to_string()]).unwrap();
        assert!(blacklist.matches("pg_monitor"));
        assert!(blacklist.matches("postgres"));
        assert!(blacklist.matches("rds"));
        assert!(!blacklist.matches("postgres2"));
        assert!(!blacklist.matches("alice"));
        assert!(!blacklist.matches("a.pg_x"));
    }

    #[test]
    fn test_glob_escapes_regex_characters() {
        let blacklist = RoleBlacklist::new(&["app.admin".to_string()]).unwrap();
        assert!(blacklist.matches("app.admin"));
        assert!(!blacklist.matches("appXadmin"));
    }

    #[test]
    fn test_roles_query_follows_option_order() {
        let mut last = 0;
        for option in RoleOption::ALL {
            let pos = ROLES_QUERY
                .find(&format!("r.{},", option.column()))
                .unwrap_or_else(|| panic!("{} missing", option.column()));
            assert!(pos > last);
            last = pos;
        }
    }
}
