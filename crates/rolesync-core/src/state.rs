//! Wanted and current state models.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::role::{Membership, Role};

/// Database, and schema for schema-scoped privileges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrantTarget {
    pub database: String,
    pub schema: Option<String>,
}

impl GrantTarget {
    pub fn database(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            schema: None,
        }
    }

    pub fn schema(database: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            schema: Some(schema.into()),
        }
    }
}

impl fmt::Display for GrantTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", self.database, schema),
            None => f.write_str(&self.database),
        }
    }
}

/// A (grantee, privilege, object) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Grant {
    pub grantee: String,
    pub privilege: String,
    pub target: GrantTarget,
}

impl Grant {
    pub fn new(grantee: impl Into<String>, privilege: impl Into<String>, target: GrantTarget) -> Self {
        Self {
            grantee: grantee.into(),
            privilege: privilege.into(),
            target,
        }
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} to {}", self.privilege, self.target, self.grantee)
    }
}

/// Either every visible object or one named object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectScope {
    All,
    Named(String),
}

/// Name that selects every database or schema visible to inspection.
pub const ALL_WILDCARD: &str = "__all__";

impl ObjectScope {
    pub fn parse(name: &str) -> Self {
        if name == ALL_WILDCARD {
            ObjectScope::All
        } else {
            ObjectScope::Named(name.to_string())
        }
    }
}

/// A grant whose database and schema may still be wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrantSpec {
    pub grantee: String,
    pub privilege: String,
    pub database: ObjectScope,
    pub schema: ObjectScope,
}

/// Databases and their user schemas, as inspected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub databases: BTreeMap<String, BTreeSet<String>>,
}

impl Topology {
    pub fn with_database<S, I>(mut self, name: impl Into<String>, schemas: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        self.databases
            .insert(name.into(), schemas.into_iter().map(Into::into).collect());
        self
    }
}

/// State computed from configuration and directory data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WantedState {
    pub roles: BTreeMap<String, Role>,
    pub memberships: BTreeSet<Membership>,
    /// Grant rules before wildcard resolution.
    pub grant_specs: BTreeSet<GrantSpec>,
    /// Concrete grants, filled by [`WantedState::resolve_grants`].
    pub grants: BTreeSet<Grant>,
}

impl WantedState {
    /// Concrete privilege names referenced by the wanted grants.
    pub fn referenced_privileges(&self) -> BTreeSet<&str> {
        self.grant_specs
            .iter()
            .map(|s| s.privilege.as_str())
            .chain(self.grants.iter().map(|g| g.privilege.as_str()))
            .collect()
    }

    /// Expand wildcard specs against `topology`. Database privileges ignore the schema.
    pub fn resolve_grants<F>(&mut self, topology: &Topology, is_schema_scoped: F)
    where
        F: Fn(&str) -> bool,
    {
        for spec in &self.grant_specs {
            let databases: Vec<&String> = match &spec.database {
                ObjectScope::All => topology.databases.keys().collect(),
                ObjectScope::Named(name) => vec![name],
            };
            for database in databases {
                if !is_schema_scoped(&spec.privilege) {
                    self.grants.insert(Grant::new(
                        &spec.grantee,
                        &spec.privilege,
                        GrantTarget::database(database),
                    ));
                    continue;
                }
                let schemas: Vec<String> = match &spec.schema {
                    ObjectScope::All => topology
                        .databases
                        .get(database)
                        .map(|s| s.iter().cloned().collect())
                        .unwrap_or_default(),
                    ObjectScope::Named(name) => vec![name.clone()],
                };
                for schema in schemas {
                    self.grants.insert(Grant::new(
                        &spec.grantee,
                        &spec.privilege,
                        GrantTarget::schema(database, schema),
                    ));
                }
            }
        }
    }
}

/// Kind and name of an object owned by a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub database: String,
    pub kind: String,
    pub name: String,
}

/// Live state inspected from the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentState {
    pub roles: BTreeMap<String, Role>,
    pub memberships: BTreeSet<Membership>,
    /// Objects owned by each role, per database.
    pub owned: BTreeMap<String, BTreeSet<ObjectRef>>,
    /// Inspected grants, mapped to whether they cover every object.
    pub grants: BTreeMap<Grant, bool>,
    /// (privilege, target) pairs with no object to grant on.
    pub vacuous: BTreeSet<(String, GrantTarget)>,
}

impl CurrentState {
    /// Whether `grant` is fully in place, or vacuously satisfied.
    #[must_use]
    pub fn is_granted(&self, grant: &Grant) -> bool {
        self.grants.get(grant).copied().unwrap_or(false)
            || self
                .vacuous
                .contains(&(grant.privilege.clone(), grant.target.clone()))
    }

    /// Rewrite every reference to `from` as `to`, as `ALTER ROLE .. RENAME`
    /// does on the cluster.
    pub fn rename_role(&mut self, from: &str, to: &str) {
        if let Some(mut role) = self.roles.remove(from) {
            role.name = to.to_string();
            self.roles.insert(to.to_string(), role);
        }
        let rename = |name: &String| if name == from { to.to_string() } else { name.clone() };
        self.memberships = self
            .memberships
            .iter()
            .map(|m| Membership::new(rename(&m.member), rename(&m.group)))
            .collect();
        if let Some(objects) = self.owned.remove(from) {
            self.owned.insert(to.to_string(), objects);
        }
        self.grants = std::mem::take(&mut self.grants)
            .into_iter()
            .map(|(mut grant, complete)| {
                grant.grantee = rename(&grant.grantee);
                (grant, complete)
            })
            .collect();
    }

    /// Databases in which `role` owns at least one object.
    pub fn owning_databases(&self, role: &str) -> BTreeSet<&str> {
        self.owned
            .get(role)
            .map(|objects| objects.iter().map(|o| o.database.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Roles the synchronizer may create, alter or drop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedScope {
    roles: BTreeSet<String>,
}

impl ManagedScope {
    pub fn new<S, I>(roles: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn contains(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn insert(&mut self, role: impl Into<String>) {
        self.roles.insert(role.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.roles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}
