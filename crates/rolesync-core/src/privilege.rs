//! Privilege catalog
//!
//! Concrete privileges carry GRANT, REVOKE and inspection SQL. Groups alias a
//! set of privileges or other groups. The catalog is assembled through
//! [`CatalogBuilder`], validated once, and immutable afterwards.
//!
//! Names wrapped in double underscores are well-known entries. A single
//! leading underscore marks a privilege that computed `__all_on_*__`
//! aggregates skip; it is only reachable when named explicitly.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::CatalogError;
use crate::sql::quote_ident;
use crate::state::GrantTarget;

/// Kind of object a privilege applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrivilegeType {
    Database,
    Schema,
    Table,
    Sequence,
    Function,
}

impl PrivilegeType {
    pub const ALL: [PrivilegeType; 5] = [
        PrivilegeType::Database,
        PrivilegeType::Schema,
        PrivilegeType::Table,
        PrivilegeType::Sequence,
        PrivilegeType::Function,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PrivilegeType::Database => "database",
            PrivilegeType::Schema => "schema",
            PrivilegeType::Table => "table",
            PrivilegeType::Sequence => "sequence",
            PrivilegeType::Function => "function",
        }
    }

    fn plural(self) -> &'static str {
        match self {
            PrivilegeType::Database => "databases",
            PrivilegeType::Schema => "schemas",
            PrivilegeType::Table => "tables",
            PrivilegeType::Sequence => "sequences",
            PrivilegeType::Function => "functions",
        }
    }

    /// Whether grants of this type target a schema inside a database.
    #[must_use]
    pub fn is_schema_scoped(self) -> bool {
        !matches!(self, PrivilegeType::Database)
    }
}

impl fmt::Display for PrivilegeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete, grantable privilege.
///
/// `grant` and `revoke` are templates over `{database}`, `{schema}` and
/// `{role}`. `inspect` returns rows of `(object, grantee, complete)`; a NULL
/// grantee marks an object on which any grant is vacuously satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Privilege {
    pub name: String,
    pub kind: PrivilegeType,
    pub grant: String,
    pub revoke: String,
    pub inspect: String,
}

impl Privilege {
    /// Excluded from computed aggregates.
    #[must_use]
    pub fn is_disabled_by_default(&self) -> bool {
        is_disabled_name(&self.name)
    }

    #[must_use]
    pub fn grant_sql(&self, target: &GrantTarget, role: &str) -> String {
        render(&self.grant, target, role)
    }

    #[must_use]
    pub fn revoke_sql(&self, target: &GrantTarget, role: &str) -> String {
        render(&self.revoke, target, role)
    }
}

fn is_disabled_name(name: &str) -> bool {
    name.starts_with('_') && !name.starts_with("__")
}

fn grantee_sql(role: &str) -> String {
    if role == "public" {
        "PUBLIC".to_string()
    } else {
        quote_ident(role)
    }
}

/// Substitute placeholders in one pass so substituted names are never rescanned.
fn render(template: &str, target: &GrantTarget, role: &str) -> String {
    let values = [
        ("{database}", quote_ident(&target.database)),
        ("{schema}", quote_ident(target.schema.as_deref().unwrap_or_default())),
        ("{role}", grantee_sql(role)),
    ];
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        match values.iter().find(|(key, _)| rest.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &rest[key.len()..];
            }
            None => {
                out.push('{');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Privilege(Privilege),
    Group(Vec<String>),
}

/// Validated, immutable registry of privileges and groups.
#[derive(Debug, Clone)]
pub struct PrivilegeCatalog {
    entries: BTreeMap<String, Entry>,
}

impl PrivilegeCatalog {
    /// The built-in catalog.
    pub fn builtin() -> Result<Self, CatalogError> {
        CatalogBuilder::with_builtins()?.build()
    }

    /// Built-ins extended with user-defined groups.
    pub fn with_groups(groups: &BTreeMap<String, Vec<String>>) -> Result<Self, CatalogError> {
        let mut builder = CatalogBuilder::with_builtins()?;
        for (name, members) in groups {
            builder.add_group(name.clone(), members.clone())?;
        }
        builder.build()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Look up a concrete privilege.
    #[must_use]
    pub fn privilege(&self, name: &str) -> Option<&Privilege> {
        match self.entries.get(name) {
            Some(Entry::Privilege(p)) => Some(p),
            _ => None,
        }
    }

    /// Every concrete privilege, sorted by name.
    pub fn privileges(&self) -> impl Iterator<Item = &Privilege> {
        self.entries.values().filter_map(|e| match e {
            Entry::Privilege(p) => Some(p),
            Entry::Group(_) => None,
        })
    }

    /// Members of a group, or `None` for a concrete privilege or unknown name.
    #[must_use]
    pub fn group_members(&self, name: &str) -> Option<&[String]> {
        match self.entries.get(name) {
            Some(Entry::Group(members)) => Some(members),
            _ => None,
        }
    }

    /// Check every group member is defined and the group graph is acyclic.
    pub fn validate(&self) -> Result<(), CatalogError> {
        for (name, entry) in &self.entries {
            if let Entry::Group(members) = entry {
                for member in members {
                    if !self.entries.contains_key(member) {
                        return Err(CatalogError::Undefined {
                            name: member.clone(),
                            referenced_by: name.clone(),
                        });
                    }
                }
            }
        }

        let mut done = BTreeSet::new();
        for name in self.entries.keys() {
            let mut stack = Vec::new();
            self.check_acyclic(name, &mut stack, &mut done)?;
        }
        Ok(())
    }

    fn check_acyclic<'a>(
        &'a self,
        name: &'a str,
        stack: &mut Vec<&'a str>,
        done: &mut BTreeSet<&'a str>,
    ) -> Result<(), CatalogError> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|n| *n == name) {
            let mut chain: Vec<String> = stack[pos..].iter().map(|n| n.to_string()).collect();
            chain.push(name.to_string());
            return Err(CatalogError::Cycle { chain });
        }
        if let Some(Entry::Group(members)) = self.entries.get(name) {
            stack.push(name);
            for member in members {
                self.check_acyclic(member, stack, done)?;
            }
            stack.pop();
        }
        done.insert(name);
        Ok(())
    }

    /// Flatten `name` into the set of concrete privileges it denotes.
    pub fn resolve(&self, name: &str) -> Result<Vec<&Privilege>, CatalogError> {
        let mut found = BTreeMap::new();
        let mut visiting = Vec::new();
        self.collect(name, "<grant rule>", &mut visiting, &mut found)?;
        Ok(found.into_values().collect())
    }

    fn collect<'a>(
        &'a self,
        name: &str,
        referenced_by: &str,
        visiting: &mut Vec<String>,
        found: &mut BTreeMap<&'a str, &'a Privilege>,
    ) -> Result<(), CatalogError> {
        if let Some(pos) = visiting.iter().position(|n| n == name) {
            let mut chain = visiting[pos..].to_vec();
            chain.push(name.to_string());
            return Err(CatalogError::Cycle { chain });
        }
        match self.entries.get(name) {
            Some(Entry::Privilege(p)) => {
                found.insert(p.name.as_str(), p);
                Ok(())
            }
            Some(Entry::Group(members)) => {
                visiting.push(name.to_string());
                for member in members {
                    self.collect(member, name, visiting, found)?;
                }
                visiting.pop();
                Ok(())
            }
            None => Err(CatalogError::Undefined {
                name: name.to_string(),
                referenced_by: referenced_by.to_string(),
            }),
        }
    }
}

/// Mutable catalog under construction.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    entries: BTreeMap<String, Entry>,
}

impl CatalogBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder preloaded with the well-known privileges and groups.
    pub fn with_builtins() -> Result<Self, CatalogError> {
        let mut builder = Self::new();
        for privilege in builtin_privileges() {
            builder.add_privilege(privilege)?;
        }
        builder.add_group(
            "__ro__",
            [
                "__connect__",
                "__usage_on_schemas__",
                "__select_on_tables__",
                "__select_on_sequences__",
            ],
        )?;
        builder.add_group(
            "__rw__",
            [
                "__ro__",
                "__temporary__",
                "__insert_on_tables__",
                "__update_on_tables__",
                "__delete_on_tables__",
                "__usage_on_sequences__",
                "__update_on_sequences__",
            ],
        )?;
        builder.add_group(
            "__ddl__",
            [
                "__create_on_schemas__",
                "_truncate_on_tables",
                "_trigger_on_tables",
                "_references_on_tables",
            ],
        )?;
        Ok(builder)
    }

    pub fn add_privilege(&mut self, privilege: Privilege) -> Result<&mut Self, CatalogError> {
        let name = privilege.name.clone();
        self.insert(name, Entry::Privilege(privilege))
    }

    pub fn add_group<S, I>(&mut self, name: impl Into<String>, members: I) -> Result<&mut Self, CatalogError>
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        let members = members.into_iter().map(Into::into).collect();
        self.insert(name.into(), Entry::Group(members))
    }

    fn insert(&mut self, name: String, entry: Entry) -> Result<&mut Self, CatalogError> {
        if self.entries.contains_key(&name) {
            return Err(CatalogError::Duplicate { name });
        }
        self.entries.insert(name, entry);
        Ok(self)
    }

    /// Add computed `__all_on_*__` aggregates, validate and freeze.
    pub fn build(mut self) -> Result<PrivilegeCatalog, CatalogError> {
        let mut aggregates: BTreeMap<PrivilegeType, Vec<String>> = BTreeMap::new();
        for entry in self.entries.values() {
            if let Entry::Privilege(p) = entry {
                if !p.is_disabled_by_default() {
                    aggregates.entry(p.kind).or_default().push(p.name.clone());
                }
            }
        }
        for (kind, members) in aggregates {
            self.add_group(format!("__all_on_{}__", kind.plural()), members)?;
        }

        let catalog = PrivilegeCatalog {
            entries: self.entries,
        };
        catalog.validate()?;
        Ok(catalog)
    }
}

const USER_SCHEMAS: &str = "n.nspname NOT LIKE 'pg\\_%' AND n.nspname <> 'information_schema'";

fn database_privilege(name: &str, keyword: &str) -> Privilege {
    Privilege {
        name: name.to_string(),
        kind: PrivilegeType::Database,
        grant: format!("GRANT {keyword} ON DATABASE {{database}} TO {{role}};"),
        revoke: format!("REVOKE {keyword} ON DATABASE {{database}} FROM {{role}};"),
        inspect: format!(
            "SELECT d.datname::text, COALESCE(r.rolname, 'public')::text, TRUE
FROM pg_catalog.pg_database AS d
CROSS JOIN LATERAL aclexplode(COALESCE(d.datacl, acldefault('d', d.datdba))) AS acl
LEFT JOIN pg_catalog.pg_roles AS r ON r.oid = acl.grantee
WHERE acl.privilege_type = '{keyword}'"
        ),
    }
}

fn schema_privilege(name: &str, keyword: &str) -> Privilege {
    Privilege {
        name: name.to_string(),
        kind: PrivilegeType::Schema,
        grant: format!("GRANT {keyword} ON SCHEMA {{schema}} TO {{role}};"),
        revoke: format!("REVOKE {keyword} ON SCHEMA {{schema}} FROM {{role}};"),
        inspect: format!(
            "SELECT n.nspname::text, COALESCE(r.rolname, 'public')::text, TRUE
FROM pg_catalog.pg_namespace AS n
CROSS JOIN LATERAL aclexplode(COALESCE(n.nspacl, acldefault('n', n.nspowner))) AS acl
LEFT JOIN pg_catalog.pg_roles AS r ON r.oid = acl.grantee
WHERE acl.privilege_type = '{keyword}' AND {USER_SCHEMAS}"
        ),
    }
}

/// A privilege granted on every object of a kind inside a schema.
fn all_in_schema_privilege(name: &str, keyword: &str, kind: PrivilegeType) -> Privilege {
    let (objects, keyword_target) = match kind {
        PrivilegeType::Sequence => (
            "SELECT c.oid, c.relnamespace AS nsp, c.relacl AS acl, c.relowner AS owner, 's'::\"char\" AS acltype
  FROM pg_catalog.pg_class AS c WHERE c.relkind = 'S'",
            "SEQUENCES",
        ),
        PrivilegeType::Function => (
            "SELECT p.oid, p.pronamespace AS nsp, p.proacl AS acl, p.proowner AS owner, 'f'::\"char\" AS acltype
  FROM pg_catalog.pg_proc AS p WHERE p.prokind IN ('f', 'a', 'w')",
            "FUNCTIONS",
        ),
        _ => (
            "SELECT c.oid, c.relnamespace AS nsp, c.relacl AS acl, c.relowner AS owner, 'r'::\"char\" AS acltype
  FROM pg_catalog.pg_class AS c WHERE c.relkind IN ('r', 'p', 'v', 'm', 'f')",
            "TABLES",
        ),
    };

    Privilege {
        name: name.to_string(),
        kind,
        grant: format!("GRANT {keyword} ON ALL {keyword_target} IN SCHEMA {{schema}} TO {{role}};"),
        revoke: format!(
            "REVOKE {keyword} ON ALL {keyword_target} IN SCHEMA {{schema}} FROM {{role}};"
        ),
        inspect: format!(
            "WITH objects AS (
  {objects}
), totals AS (
  SELECT nsp, COUNT(*) AS total FROM objects GROUP BY nsp
), granted AS (
  SELECT o.nsp, acl.grantee, COUNT(DISTINCT o.oid) AS granted
  FROM objects AS o
  CROSS JOIN LATERAL aclexplode(COALESCE(o.acl, acldefault(o.acltype, o.owner))) AS acl
  WHERE acl.privilege_type = '{keyword}'
  GROUP BY o.nsp, acl.grantee
)
SELECT n.nspname::text, COALESCE(r.rolname, 'public')::text, g.granted = t.total
FROM granted AS g
JOIN totals AS t ON t.nsp = g.nsp
JOIN pg_catalog.pg_namespace AS n ON n.oid = g.nsp
LEFT JOIN pg_catalog.pg_roles AS r ON r.oid = g.grantee
WHERE {USER_SCHEMAS}
UNION ALL
SELECT n.nspname::text, NULL, TRUE
FROM pg_catalog.pg_namespace AS n
WHERE {USER_SCHEMAS}
  AND NOT EXISTS (SELECT 1 FROM objects AS o WHERE o.nsp = n.oid)"
        ),
    }
}

fn builtin_privileges() -> Vec<Privilege> {
    use PrivilegeType::{Function, Sequence, Table};

    vec![
        database_privilege("__connect__", "CONNECT"),
        database_privilege("__temporary__", "TEMPORARY"),
        schema_privilege("__usage_on_schemas__", "USAGE"),
        schema_privilege("__create_on_schemas__", "CREATE"),
        all_in_schema_privilege("__select_on_tables__", "SELECT", Table),
        all_in_schema_privilege("__insert_on_tables__", "INSERT", Table),
        all_in_schema_privilege("__update_on_tables__", "UPDATE", Table),
        all_in_schema_privilege("__delete_on_tables__", "DELETE", Table),
        all_in_schema_privilege("_truncate_on_tables", "TRUNCATE", Table),
        all_in_schema_privilege("_trigger_on_tables", "TRIGGER", Table),
        all_in_schema_privilege("_references_on_tables", "REFERENCES", Table),
        all_in_schema_privilege("__select_on_sequences__", "SELECT", Sequence),
        all_in_schema_privilege("__usage_on_sequences__", "USAGE", Sequence),
        all_in_schema_privilege("__update_on_sequences__", "UPDATE", Sequence),
        all_in_schema_privilege("__execute_on_functions__", "EXECUTE", Function),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(privileges: &[&Privilege]) -> Vec<String> {
        privileges.iter().map(|p| p.name.clone()).collect()
    }

    #[test]
    fn test_builtin_catalog_is_valid() {
        let catalog = PrivilegeCatalog::builtin().unwrap();
        assert!(catalog.validate().is_ok());
        assert!(catalog.contains("__all_on_tables__"));
        assert!(catalog.contains("__all_on_databases__"));
    }

    #[test]
    fn test_all_aggregate_skips_disabled() {
        let catalog = PrivilegeCatalog::builtin().unwrap();
        let resolved = catalog.resolve("__all_on_tables__").unwrap();
        assert_eq!(
            names(&resolved),
            vec![
                "__delete_on_tables__",
                "__insert_on_tables__",
                "__select_on_tables__",
                "__update_on_tables__",
            ]
        );
    }

    #[test]
    fn test_ddl_reaches_disabled_privileges() {
        let catalog = PrivilegeCatalog::builtin().unwrap();
        let resolved = catalog.resolve("__ddl__").unwrap();
        assert!(names(&resolved).contains(&"_truncate_on_tables".to_string()));
    }

    #[test]
    fn test_render_grant() {
        let catalog = PrivilegeCatalog::builtin().unwrap();
        let select = catalog.privilege("__select_on_tables__").unwrap();
        let target = GrantTarget::schema("appdb", "public");
        assert_eq!(
            select.grant_sql(&target, "reader"),
            "GRANT SELECT ON ALL TABLES IN SCHEMA \"public\" TO \"reader\";"
        );

        let connect = catalog.privilege("__connect__").unwrap();
        assert_eq!(
            connect.revoke_sql(&GrantTarget::database("appdb"), "public"),
            "REVOKE CONNECT ON DATABASE \"appdb\" FROM PUBLIC;"
        );
    }

    #[test]
    fn test_render_does_not_rescan_substituted_names() {
        let catalog = PrivilegeCatalog::builtin().unwrap();
        let connect = catalog.privilege("__connect__").unwrap();
        assert_eq!(
            connect.grant_sql(&GrantTarget::database("db{schema}{role}"), "{database}"),
            "GRANT CONNECT ON DATABASE \"db{schema}{role}\" TO \"{database}\";"
        );

        let select = catalog.privilege("__select_on_tables__").unwrap();
        assert_eq!(
            select.grant_sql(&GrantTarget::schema("app", "s{role}"), "reader"),
            "GRANT SELECT ON ALL TABLES IN SCHEMA \"s{role}\" TO \"reader\";"
        );
    }

    #[test]
    fn test_computed_aggregate_cannot_be_redefined() {
        let mut builder = CatalogBuilder::with_builtins().unwrap();
        builder.add_group("__all_on_tables__", ["__select_on_tables__"]).unwrap();
        assert_eq!(
            builder.build().unwrap_err(),
            CatalogError::Duplicate {
                name: "__all_on_tables__".into()
            }
        );
    }
}
