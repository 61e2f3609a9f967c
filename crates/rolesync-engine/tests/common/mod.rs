//! Hand-written collaborators for engine tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use rolesync_core::{
    CollaboratorError, CollaboratorResult, Directory, Grant, GrantTarget, LdapEntry,
    LdapSearchSpec, Membership, PgClient, PrivilegeCatalog, Role, RoleOption, RoleOptions,
    SqlRow, SqlValue,
};
use rolesync_engine::inspect::{
    DATABASES_QUERY, DATABASE_OWNERS_QUERY, MEMBERSHIPS_QUERY, OWNERSHIP_QUERY, ROLES_QUERY,
    SCHEMAS_QUERY, SESSION_QUERY,
};

/// Directory answering searches by base DN.
#[derive(Default)]
pub struct FakeDirectory {
    pub entries: HashMap<String, Vec<LdapEntry>>,
    pub delays: HashMap<String, Duration>,
    pub fail: bool,
    pub searches: AtomicUsize,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(mut self, base: &str, entries: Vec<LdapEntry>) -> Self {
        self.entries.insert(base.to_string(), entries);
        self
    }

    pub fn with_delay(mut self, base: &str, delay: Duration) -> Self {
        self.delays.insert(base.to_string(), delay);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn whoami(&self) -> CollaboratorResult<String> {
        Ok("dn:cn=rolesync,dc=example,dc=com".to_string())
    }

    async fn search(&self, spec: &LdapSearchSpec) -> CollaboratorResult<Vec<LdapEntry>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CollaboratorError::query_failed("directory unavailable"));
        }
        if let Some(delay) = self.delays.get(&spec.base) {
            tokio::time::sleep(*delay).await;
        }
        Ok(self.entries.get(&spec.base).cloned().unwrap_or_default())
    }
}

/// In-memory cluster.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub user: String,
    pub superuser: bool,
    pub databases: BTreeMap<String, BTreeSet<String>>,
    pub roles: BTreeMap<String, Role>,
    pub memberships: BTreeSet<Membership>,
    /// Grants, mapped to whether every object carries them.
    pub grants: BTreeMap<Grant, bool>,
    /// `(owner, database, kind, name)`
    pub owned: Vec<(String, String, String, String)>,
}

impl Default for Cluster {
    fn default() -> Self {
        let mut cluster = Self {
            user: "postgres".to_string(),
            superuser: true,
            databases: BTreeMap::new(),
            roles: BTreeMap::new(),
            memberships: BTreeSet::new(),
            grants: BTreeMap::new(),
            owned: Vec::new(),
        };
        cluster.add_role("postgres", RoleOptions::new().with(RoleOption::Superuser, true));
        cluster.add_database("postgres", ["public"]);
        cluster
    }
}

impl Cluster {
    pub fn add_role(&mut self, name: &str, options: RoleOptions) {
        let mut full = RoleOptions::defaults();
        for (option, value) in options.iter() {
            full.set(option, value);
        }
        self.roles
            .insert(name.to_string(), Role::new(name).with_options(full));
    }

    pub fn add_database<const N: usize>(&mut self, name: &str, schemas: [&str; N]) {
        self.databases.insert(
            name.to_string(),
            schemas.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn role_names(&self) -> Vec<&str> {
        self.roles.keys().map(String::as_str).collect()
    }

    fn targets(&self) -> Vec<GrantTarget> {
        let mut targets = Vec::new();
        for (database, schemas) in &self.databases {
            targets.push(GrantTarget::database(database));
            for schema in schemas {
                targets.push(GrantTarget::schema(database, schema));
            }
        }
        targets
    }
}

/// PostgreSQL fake answering the inspection queries from a [`Cluster`] and
/// applying the statements it understands.
pub struct FakePostgres {
    pub cluster: Mutex<Cluster>,
    catalog: PrivilegeCatalog,
    pub fail_on: Option<String>,
    pub fail_queries: bool,
    pub queries: AtomicUsize,
    pub executions: AtomicUsize,
    pub executed: Mutex<Vec<(Option<String>, String)>>,
}

impl FakePostgres {
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster: Mutex::new(cluster),
            catalog: PrivilegeCatalog::builtin().unwrap(),
            fail_on: None,
            fail_queries: false,
            queries: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Fail any transaction containing `needle`.
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    pub fn snapshot(&self) -> Cluster {
        self.cluster.lock().unwrap().clone()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    fn answer(&self, database: Option<&str>, sql: &str) -> CollaboratorResult<Vec<SqlRow>> {
        let cluster = self.cluster.lock().unwrap();
        let database = database.unwrap_or("postgres");
        let text = |s: &str| SqlValue::Text(s.to_string());

        let rows = match sql {
            SESSION_QUERY => vec![vec![
                text(&cluster.user),
                text("16.4"),
                SqlValue::Bool(cluster.superuser),
            ]],
            DATABASES_QUERY => cluster.databases.keys().map(|d| vec![text(d)]).collect(),
            SCHEMAS_QUERY => cluster
                .databases
                .get(database)
                .map(|schemas| schemas.iter().map(|s| vec![text(s)]).collect())
                .unwrap_or_default(),
            ROLES_QUERY => cluster
                .roles
                .values()
                .map(|role| {
                    let mut row = vec![text(&role.name)];
                    for option in RoleOption::ALL {
                        row.push(SqlValue::Bool(role.options.effective(option)));
                    }
                    row.push(role.comment.as_deref().map_or(SqlValue::Null, text));
                    row
                })
                .collect(),
            MEMBERSHIPS_QUERY => cluster
                .memberships
                .iter()
                .map(|m| vec![text(&m.member), text(&m.group)])
                .collect(),
            DATABASE_OWNERS_QUERY => cluster
                .owned
                .iter()
                .filter(|(_, _, kind, _)| kind == "database")
                .map(|(owner, db, _, _)| vec![text(owner), text(db)])
                .collect(),
            OWNERSHIP_QUERY => cluster
                .owned
                .iter()
                .filter(|(_, db, kind, _)| db == database && kind != "database")
                .map(|(owner, _, kind, name)| vec![text(owner), text(kind), text(name)])
                .collect(),
            _ => {
                let privilege = self
                    .catalog
                    .privileges()
                    .find(|p| p.inspect == sql)
                    .ok_or_else(|| CollaboratorError::query_failed(format!("unexpected query: {sql}")))?;
                cluster
                    .grants
                    .iter()
                    .filter(|(grant, _)| grant.privilege == privilege.name)
                    .filter_map(|(grant, complete)| match &grant.target.schema {
                        None if !privilege.kind.is_schema_scoped() => Some(vec![
                            text(&grant.target.database),
                            text(&grant.grantee),
                            SqlValue::Bool(true),
                        ]),
                        Some(schema)
                            if privilege.kind.is_schema_scoped()
                                && grant.target.database == database =>
                        {
                            Some(vec![text(schema), text(&grant.grantee), SqlValue::Bool(*complete)])
                        }
                        _ => None,
                    })
                    .collect()
            }
        };
        Ok(rows)
    }

    fn apply(&self, database: &str, sql: &str) -> CollaboratorResult<()> {
        let mut cluster = self.cluster.lock().unwrap();
        let caps = |pattern: &str| {
            Regex::new(pattern)
                .unwrap()
                .captures(sql)
                .map(|c| c.iter().skip(1).map(|m| m.map_or("", |m| m.as_str()).to_string()).collect::<Vec<_>>())
        };
        let words = |text: &str| RoleOptions::parse_words([text]).unwrap();

        if sql.starts_with("SELECT pg_catalog.pg_terminate_backend") {
            return Ok(());
        }
        if let Some(c) = caps(r#"^CREATE ROLE "([^"]+)"(?: WITH (.*))?;$"#) {
            if cluster.roles.contains_key(&c[0]) {
                return Err(CollaboratorError::exec_failed(format!("role \"{}\" already exists", c[0])));
            }
            cluster.add_role(&c[0], words(&c[1]));
            return Ok(());
        }
        if let Some(c) = caps(r#"^ALTER ROLE "([^"]+)" RENAME TO "([^"]+)";$"#) {
            let (from, to) = (&c[0], &c[1]);
            if cluster.roles.contains_key(to) {
                return Err(CollaboratorError::exec_failed(format!("role \"{to}\" already exists")));
            }
            let mut role = cluster
                .roles
                .remove(from)
                .ok_or_else(|| CollaboratorError::exec_failed("role does not exist"))?;
            role.name = to.clone();
            cluster.roles.insert(to.clone(), role);
            let rename = |name: &String| if name == from { to.clone() } else { name.clone() };
            cluster.memberships = cluster
                .memberships
                .iter()
                .map(|m| Membership::new(rename(&m.member), rename(&m.group)))
                .collect();
            cluster.grants = std::mem::take(&mut cluster.grants)
                .into_iter()
                .map(|(mut grant, complete)| {
                    grant.grantee = rename(&grant.grantee);
                    (grant, complete)
                })
                .collect();
            for (owner, _, _, _) in cluster.owned.iter_mut() {
                *owner = rename(owner);
            }
            return Ok(());
        }
        if let Some(c) = caps(r#"^ALTER ROLE "([^"]+)" WITH (.*);$"#) {
            let role = cluster
                .roles
                .get_mut(&c[0])
                .ok_or_else(|| CollaboratorError::exec_failed("role does not exist"))?;
            for (option, value) in words(&c[1]).iter() {
                role.options.set(option, value);
            }
            return Ok(());
        }
        if let Some(c) = caps(r#"^COMMENT ON ROLE "([^"]+)" IS '(.*)';$"#) {
            if let Some(role) = cluster.roles.get_mut(&c[0]) {
                role.comment = Some(c[1].replace("''", "'"));
            }
            return Ok(());
        }
        if let Some(c) = caps(r#"^GRANT "([^"]+)" TO "([^"]+)";$"#) {
            for role in [&c[0], &c[1]] {
                if !cluster.roles.contains_key(role) {
                    return Err(CollaboratorError::exec_failed(format!("role \"{role}\" does not exist")));
                }
            }
            cluster.memberships.insert(Membership::new(&c[1], &c[0]));
            return Ok(());
        }
        if let Some(c) = caps(r#"^REVOKE "([^"]+)" FROM "([^"]+)";$"#) {
            cluster.memberships.remove(&Membership::new(&c[1], &c[0]));
            return Ok(());
        }
        if let Some(c) = caps(r#"^REASSIGN OWNED BY "([^"]+)" TO "([^"]+)";$"#) {
            for (owner, db, _, _) in cluster.owned.iter_mut() {
                if *owner == c[0] && db == database {
                    *owner = c[1].clone();
                }
            }
            return Ok(());
        }
        if let Some(c) = caps(r#"^DROP OWNED BY "([^"]+)";$"#) {
            if cluster.owned.iter().any(|(owner, db, _, _)| *owner == c[0] && db == database) {
                return Err(CollaboratorError::exec_failed("cannot drop owned objects"));
            }
            cluster.grants.retain(|grant, _| {
                grant.grantee != c[0]
                    || (grant.target.schema.is_some() && grant.target.database != database)
            });
            return Ok(());
        }
        if let Some(c) = caps(r#"^DROP ROLE "([^"]+)";$"#) {
            if cluster.owned.iter().any(|(owner, _, _, _)| *owner == c[0]) {
                return Err(CollaboratorError::exec_failed("role owns objects"));
            }
            cluster.roles.remove(&c[0]);
            cluster
                .memberships
                .retain(|m| m.member != c[0] && m.group != c[0]);
            return Ok(());
        }

        let mut grantees: Vec<String> = cluster.roles.keys().cloned().collect();
        grantees.push("public".to_string());
        for privilege in self.catalog.privileges() {
            for target in cluster.targets() {
                if target.schema.is_some() != privilege.kind.is_schema_scoped()
                    || (target.schema.is_some() && target.database != database)
                {
                    continue;
                }
                for grantee in &grantees {
                    let grant = Grant::new(grantee, &privilege.name, target.clone());
                    if privilege.grant_sql(&target, grantee) == sql {
                        cluster.grants.insert(grant, true);
                        return Ok(());
                    }
                    if privilege.revoke_sql(&target, grantee) == sql {
                        cluster.grants.remove(&grant);
                        return Ok(());
                    }
                }
            }
        }
        Err(CollaboratorError::exec_failed(format!("unsupported statement: {sql}")))
    }
}

#[async_trait]
impl PgClient for FakePostgres {
    async fn query(
        &self,
        database: Option<&str>,
        sql: &str,
        _args: &[String],
    ) -> CollaboratorResult<Vec<SqlRow>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_queries {
            return Err(CollaboratorError::query_failed("permission denied"));
        }
        self.answer(database, sql)
    }

    async fn execute(&self, database: Option<&str>, statements: &[String]) -> CollaboratorResult<()> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(needle) = &self.fail_on {
            if statements.iter().any(|s| s.contains(needle.as_str())) {
                return Err(CollaboratorError::exec_failed(format!("injected failure on {needle}")));
            }
        }

        // One transaction: apply on a copy, commit on success.
        let before = self.snapshot();
        let db = database.unwrap_or("postgres");
        for sql in statements {
            if let Err(e) = self.apply(db, sql) {
                *self.cluster.lock().unwrap() = before;
                return Err(e);
            }
            self.executed
                .lock()
                .unwrap()
                .push((database.map(str::to_string), sql.clone()));
        }
        Ok(())
    }
}

/// A cluster with an `app` database and a few roles.
pub fn sample_cluster() -> Cluster {
    let mut cluster = Cluster::default();
    cluster.add_database("app", ["public", "reporting"]);
    cluster.add_role("alice", RoleOptions::new().with(RoleOption::Login, true));
    cluster.add_role("pg_monitor", RoleOptions::new());
    cluster
}

pub fn person(uid: &str) -> LdapEntry {
    LdapEntry::new(format!("uid={uid},ou=people,dc=example,dc=com"))
        .with_attribute("uid", [uid])
        .with_attribute("cn", [format!("User {uid}")])
}
