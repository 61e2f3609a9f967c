//! Collaborator traits
//!
//! The engine talks to LDAP and PostgreSQL only through these traits, so the
//! network implementations live in their own crates and tests can use fakes.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::config::LdapSearchSpec;
use crate::error::CollaboratorResult;

/// One directory entry. Attribute names are stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapEntry {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl LdapEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_attribute<S, I>(mut self, name: &str, values: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        self.attributes.insert(
            name.to_ascii_lowercase(),
            values.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// First value of an attribute. `dn` always yields the entry DN.
    #[must_use]
    pub fn first_value(&self, name: &str) -> Option<&str> {
        if name.eq_ignore_ascii_case("dn") {
            return Some(&self.dn);
        }
        self.attributes
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

/// A bound LDAP directory.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Identity the connection is bound as.
    async fn whoami(&self) -> CollaboratorResult<String>;

    /// Run a search, returning entries in server order.
    async fn search(&self, spec: &LdapSearchSpec) -> CollaboratorResult<Vec<LdapEntry>>;
}

/// A scalar column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl SqlValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> Self {
        SqlValue::Bool(b)
    }
}

pub type SqlRow = Vec<SqlValue>;

/// A PostgreSQL cluster.
///
/// `database` selects the connection; `None` means the default database.
#[async_trait]
pub trait PgClient: Send + Sync {
    /// Run a read-only query with positional text arguments.
    async fn query(
        &self,
        database: Option<&str>,
        sql: &str,
        args: &[String],
    ) -> CollaboratorResult<Vec<SqlRow>>;

    /// Run statements inside a single transaction.
    async fn execute(&self, database: Option<&str>, statements: &[String]) -> CollaboratorResult<()>;
}
