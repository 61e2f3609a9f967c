//! Canonical configuration
//!
//! Produced by the normalizer from a raw [`Value`] tree. Every structure can
//! be rendered back into a canonical tree with `to_value`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use crate::error::{SyncError, SyncResult};
use crate::normalize::normalize_config;
use crate::privilege::PrivilegeCatalog;
use crate::role::RoleOptions;
use crate::value::Value;

/// Default glob patterns of roles never managed.
pub const DEFAULT_ROLES_BLACKLIST: [&str; 2] = ["pg_*", "postgres"];

/// Default owner of objects left behind by dropped roles.
pub const DEFAULT_FALLBACK_OWNER: &str = "postgres";

/// Default LDAP search filter.
pub const DEFAULT_FILTER: &str = "(objectClass=*)";

/// Normalized configuration document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub postgres: PostgresConfig,
    /// User-defined privilege groups.
    pub privileges: BTreeMap<String, Vec<String>>,
    pub sync_map: Vec<SyncItem>,
}

impl Config {
    /// Read and normalize a YAML configuration file.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::config(path.display().to_string(), format!("cannot read file: {e}"))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse and normalize a YAML document.
    pub fn from_yaml_str(text: &str) -> SyncResult<Self> {
        Self::from_value(&Value::from_yaml_str(text)?)
    }

    pub fn from_value(value: &Value) -> SyncResult<Self> {
        normalize_config(value)
    }

    /// Whether any sync item queries the directory.
    #[must_use]
    pub fn needs_ldap(&self) -> bool {
        self.sync_map.iter().any(|item| item.ldapsearch.is_some())
    }

    /// Check every privilege named by a grant rule exists in `catalog`.
    pub fn check_privileges(&self, catalog: &PrivilegeCatalog) -> SyncResult<()> {
        for (i, item) in self.sync_map.iter().enumerate() {
            for (j, rule) in item.grants.iter().enumerate() {
                for privilege in &rule.privileges {
                    if !catalog.contains(privilege) {
                        return Err(SyncError::config(
                            format!("sync_map[{i}].grant[{j}].privileges"),
                            format!("unknown privilege '{privilege}'"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::map([
            ("postgres", self.postgres.to_value()),
            (
                "privileges",
                Value::Map(
                    self.privileges
                        .iter()
                        .map(|(name, members)| (name.clone(), Value::strings(members.iter().cloned())))
                        .collect(),
                ),
            ),
            (
                "sync_map",
                Value::List(self.sync_map.iter().map(SyncItem::to_value).collect()),
            ),
        ])
    }
}

/// The `postgres` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    /// Query listing managed roles. Defaults to every non-blacklisted role.
    pub managed_roles_query: Option<String>,
    /// Glob patterns of roles never touched.
    pub roles_blacklist: Vec<String>,
    /// Receives objects owned by dropped roles.
    pub fallback_owner: String,
    /// Query listing synchronized databases.
    pub databases_query: Option<String>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            managed_roles_query: None,
            roles_blacklist: DEFAULT_ROLES_BLACKLIST.iter().map(|s| s.to_string()).collect(),
            fallback_owner: DEFAULT_FALLBACK_OWNER.to_string(),
            databases_query: None,
        }
    }
}

impl PostgresConfig {
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        if let Some(query) = &self.managed_roles_query {
            map.insert("managed_roles_query".to_string(), Value::from(query.as_str()));
        }
        map.insert(
            "roles_blacklist".to_string(),
            Value::strings(self.roles_blacklist.iter().cloned()),
        );
        map.insert(
            "fallback_owner".to_string(),
            Value::from(self.fallback_owner.as_str()),
        );
        if let Some(query) = &self.databases_query {
            map.insert("databases_query".to_string(), Value::from(query.as_str()));
        }
        Value::Map(map)
    }
}

/// One entry of `sync_map`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncItem {
    pub description: Option<String>,
    pub ldapsearch: Option<LdapSearchSpec>,
    pub roles: Vec<RoleRule>,
    pub grants: Vec<GrantRule>,
}

impl SyncItem {
    /// Label used in logs.
    #[must_use]
    pub fn label(&self, index: usize) -> String {
        match &self.description {
            Some(description) => format!("sync_map[{index}] ({description})"),
            None => format!("sync_map[{index}]"),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        if let Some(description) = &self.description {
            map.insert("description".to_string(), Value::from(description.as_str()));
        }
        if let Some(search) = &self.ldapsearch {
            map.insert("ldapsearch".to_string(), search.to_value());
        }
        map.insert(
            "roles".to_string(),
            Value::List(self.roles.iter().map(RoleRule::to_value).collect()),
        );
        map.insert(
            "grant".to_string(),
            Value::List(self.grants.iter().map(GrantRule::to_value).collect()),
        );
        Value::Map(map)
    }
}

/// LDAP search scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    OneLevel,
    #[default]
    Subtree,
}

impl SearchScope {
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "base" => Some(SearchScope::Base),
            "one" | "onelevel" => Some(SearchScope::OneLevel),
            "sub" | "subtree" => Some(SearchScope::Subtree),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SearchScope::Base => "base",
            SearchScope::OneLevel => "onelevel",
            SearchScope::Subtree => "subtree",
        }
    }
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directory search feeding a sync item's templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapSearchSpec {
    pub base: String,
    pub filter: String,
    pub scope: SearchScope,
    /// Requested attributes, including every attribute templates reference.
    pub attributes: BTreeSet<String>,
}

impl LdapSearchSpec {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            filter: DEFAULT_FILTER.to_string(),
            scope: SearchScope::default(),
            attributes: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::map([
            ("base", Value::from(self.base.as_str())),
            ("filter", Value::from(self.filter.as_str())),
            ("scope", Value::from(self.scope.as_str())),
            ("attributes", Value::strings(self.attributes.iter().cloned())),
        ])
    }
}

/// Rule producing one role per name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleRule {
    pub names: Vec<String>,
    /// Empty, a single comment shared by all names, or one per name.
    pub comments: Vec<String>,
    pub options: RoleOptions,
    pub parents: Vec<String>,
    pub members: Vec<String>,
}

impl RoleRule {
    /// Comment template paired with the name at `index`.
    #[must_use]
    pub fn comment_for(&self, index: usize) -> Option<&str> {
        match self.comments.len() {
            0 => None,
            1 => self.comments.first().map(String::as_str),
            _ => self.comments.get(index).map(String::as_str),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::map([
            ("names", Value::strings(self.names.iter().cloned())),
            ("comments", Value::strings(self.comments.iter().cloned())),
            ("options", Value::strings(self.options.words())),
            ("parents", Value::strings(self.parents.iter().cloned())),
            ("members", Value::strings(self.members.iter().cloned())),
        ])
    }
}

/// Rule granting privileges to roles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantRule {
    pub privileges: Vec<String>,
    pub databases: Vec<String>,
    pub schemas: Vec<String>,
    pub roles: Vec<String>,
}

impl GrantRule {
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::map([
            ("privileges", Value::strings(self.privileges.iter().cloned())),
            ("databases", Value::strings(self.databases.iter().cloned())),
            ("schemas", Value::strings(self.schemas.iter().cloned())),
            ("roles", Value::strings(self.roles.iter().cloned())),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sync_map:\n- role: alice").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.sync_map.len(), 1);
        assert_eq!(config.sync_map[0].roles[0].names, vec!["alice"]);
        assert!(!config.needs_ldap());
        assert_eq!(config.postgres, PostgresConfig::default());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/rolesync.yml")).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_check_privileges() {
        let catalog = PrivilegeCatalog::builtin().unwrap();
        let config = Config::from_yaml_str(
            "sync_map:\n- grant:\n    privilege: __nope__\n    role: alice\n",
        )
        .unwrap();
        let err = config.check_privileges(&catalog).unwrap_err();
        assert!(err.to_string().contains("__nope__"));
    }

    #[test]
    fn test_comment_for() {
        let rule = RoleRule {
            names: vec!["a".into(), "b".into()],
            comments: vec!["shared".into()],
            ..RoleRule::default()
        };
        assert_eq!(rule.comment_for(1), Some("shared"));
    }
}
