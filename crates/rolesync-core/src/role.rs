//! Role model: options, comments and membership edges.

use std::collections::BTreeMap;
use std::fmt;

use crate::sql::{quote_ident, quote_literal};

/// A boolean role attribute of `CREATE ROLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoleOption {
    Superuser,
    CreateDb,
    CreateRole,
    Inherit,
    Login,
    Replication,
    BypassRls,
}

impl RoleOption {
    pub const ALL: [RoleOption; 7] = [
        RoleOption::Superuser,
        RoleOption::CreateDb,
        RoleOption::CreateRole,
        RoleOption::Inherit,
        RoleOption::Login,
        RoleOption::Replication,
        RoleOption::BypassRls,
    ];

    /// SQL keyword enabling the option.
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            RoleOption::Superuser => "SUPERUSER",
            RoleOption::CreateDb => "CREATEDB",
            RoleOption::CreateRole => "CREATEROLE",
            RoleOption::Inherit => "INHERIT",
            RoleOption::Login => "LOGIN",
            RoleOption::Replication => "REPLICATION",
            RoleOption::BypassRls => "BYPASSRLS",
        }
    }

    /// Column of `pg_roles` holding the option.
    #[must_use]
    pub fn column(self) -> &'static str {
        match self {
            RoleOption::Superuser => "rolsuper",
            RoleOption::CreateDb => "rolcreatedb",
            RoleOption::CreateRole => "rolcreaterole",
            RoleOption::Inherit => "rolinherit",
            RoleOption::Login => "rolcanlogin",
            RoleOption::Replication => "rolreplication",
            RoleOption::BypassRls => "rolbypassrls",
        }
    }

    /// Value PostgreSQL uses when `CREATE ROLE` does not mention the option.
    #[must_use]
    pub fn default_value(self) -> bool {
        matches!(self, RoleOption::Inherit)
    }

    /// Only a superuser may set or compare these.
    #[must_use]
    pub fn is_superuser_only(self) -> bool {
        matches!(
            self,
            RoleOption::Superuser | RoleOption::Replication | RoleOption::BypassRls
        )
    }

    /// Parse `LOGIN` or `NOLOGIN` into the option and its value.
    #[must_use]
    pub fn parse_word(word: &str) -> Option<(RoleOption, bool)> {
        let upper = word.trim().to_ascii_uppercase();
        let (name, value) = match upper.strip_prefix("NO") {
            Some(rest) => (rest, false),
            None => (upper.as_str(), true),
        };
        RoleOption::ALL
            .into_iter()
            .find(|opt| opt.keyword() == name)
            .map(|opt| (opt, value))
    }
}

/// A partial set of role options. Unset options are left to defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleOptions(BTreeMap<RoleOption, bool>);

impl RoleOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every option at its PostgreSQL default.
    #[must_use]
    pub fn defaults() -> Self {
        Self(
            RoleOption::ALL
                .into_iter()
                .map(|opt| (opt, opt.default_value()))
                .collect(),
        )
    }

    pub fn set(&mut self, option: RoleOption, value: bool) {
        self.0.insert(option, value);
    }

    #[must_use]
    pub fn with(mut self, option: RoleOption, value: bool) -> Self {
        self.set(option, value);
        self
    }

    #[must_use]
    pub fn get(&self, option: RoleOption) -> Option<bool> {
        self.0.get(&option).copied()
    }

    /// Value of `option`, falling back to the PostgreSQL default.
    #[must_use]
    pub fn effective(&self, option: RoleOption) -> bool {
        self.get(option).unwrap_or_else(|| option.default_value())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RoleOption, bool)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    /// Parse space separated option words, e.g. `LOGIN NOSUPERUSER`.
    pub fn parse_words<'a, I>(words: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut options = Self::new();
        for word in words.into_iter().flat_map(str::split_whitespace) {
            let (option, value) =
                RoleOption::parse_word(word).ok_or_else(|| format!("unknown role option '{word}'"))?;
            options.merge_one(option, value)?;
        }
        Ok(options)
    }

    /// Add one option, refusing contradictions.
    pub fn merge_one(&mut self, option: RoleOption, value: bool) -> Result<(), String> {
        match self.get(option) {
            Some(existing) if existing != value => Err(format!(
                "contradictory role options {} and NO{}",
                option.keyword(),
                option.keyword()
            )),
            _ => {
                self.set(option, value);
                Ok(())
            }
        }
    }

    /// Drop options the connected role is not allowed to manage.
    pub fn retain_supported(&mut self, superuser: bool) {
        if !superuser {
            self.0.retain(|opt, _| !opt.is_superuser_only());
        }
    }

    /// `self` laid over every PostgreSQL default.
    #[must_use]
    pub fn with_defaults(&self) -> RoleOptions {
        let mut full = Self::defaults();
        full.0.extend(self.iter());
        full
    }

    /// Options set in `wanted` whose value differs from `self`. Fill
    /// `wanted` with [`RoleOptions::with_defaults`] to compare every option.
    #[must_use]
    pub fn changes_to(&self, wanted: &RoleOptions) -> RoleOptions {
        Self(
            wanted
                .iter()
                .filter(|(opt, value)| self.effective(*opt) != *value)
                .collect(),
        )
    }

    /// Option words in canonical order, e.g. `["LOGIN", "NOSUPERUSER"]`.
    #[must_use]
    pub fn words(&self) -> Vec<String> {
        self.iter()
            .map(|(opt, value)| {
                if value {
                    opt.keyword().to_string()
                } else {
                    format!("NO{}", opt.keyword())
                }
            })
            .collect()
    }
}

impl fmt::Display for RoleOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.words().join(" "))
    }
}

/// A role as wanted or as inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub options: RoleOptions,
    pub comment: Option<String>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: RoleOptions::new(),
            comment: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: RoleOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    #[must_use]
    pub fn create_sql(&self) -> Vec<String> {
        let ident = quote_ident(&self.name);
        let mut sql = if self.options.is_empty() {
            vec![format!("CREATE ROLE {ident};")]
        } else {
            vec![format!("CREATE ROLE {ident} WITH {};", self.options)]
        };
        if let Some(comment) = &self.comment {
            sql.push(comment_sql(&self.name, comment));
        }
        sql
    }

    #[must_use]
    pub fn alter_sql(name: &str, changes: &RoleOptions) -> String {
        format!("ALTER ROLE {} WITH {};", quote_ident(name), changes)
    }
}

/// `COMMENT ON ROLE` statement.
#[must_use]
pub fn comment_sql(role: &str, comment: &str) -> String {
    format!(
        "COMMENT ON ROLE {} IS {};",
        quote_ident(role),
        quote_literal(comment)
    )
}

/// `member` belongs to `group`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Membership {
    pub member: String,
    pub group: String,
}

impl Membership {
    pub fn new(member: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            group: group.into(),
        }
    }

    #[must_use]
    pub fn grant_sql(&self) -> String {
        format!(
            "GRANT {} TO {};",
            quote_ident(&self.group),
            quote_ident(&self.member)
        )
    }

    #[must_use]
    pub fn revoke_sql(&self) -> String {
        format!(
            "REVOKE {} FROM {};",
            quote_ident(&self.group),
            quote_ident(&self.member)
        )
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.member, self.group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_words() {
        let options = RoleOptions::parse_words(["LOGIN nosuperuser", "CREATEDB"]).unwrap();
        assert_eq!(options.get(RoleOption::Login), Some(true));
        assert_eq!(options.get(RoleOption::Superuser), Some(false));
        assert_eq!(options.get(RoleOption::CreateDb), Some(true));
        assert_eq!(options.get(RoleOption::Inherit), None);
        assert_eq!(options.to_string(), "NOSUPERUSER CREATEDB LOGIN");
    }

    #[test]
    fn test_parse_words_rejects_unknown_and_contradictions() {
        assert!(RoleOptions::parse_words(["FLY"]).is_err());
        assert!(RoleOptions::parse_words(["LOGIN NOLOGIN"]).is_err());
        assert!(RoleOptions::parse_words(["LOGIN LOGIN"]).is_ok());
    }

    #[test]
    fn test_changes_to_is_minimal() {
        let current = RoleOptions::defaults();
        let wanted = RoleOptions::new()
            .with(RoleOption::Login, true)
            .with(RoleOption::Inherit, true);

        let changes = current.changes_to(&wanted.with_defaults());
        assert_eq!(changes.words(), vec!["LOGIN"]);
        assert!(RoleOptions::defaults()
            .changes_to(&RoleOptions::new().with_defaults())
            .is_empty());
    }

    #[test]
    fn test_unset_options_revert_to_defaults() {
        let current = RoleOptions::defaults()
            .with(RoleOption::Login, true)
            .with(RoleOption::CreateDb, true);
        let wanted = RoleOptions::new().with(RoleOption::CreateDb, true);

        let changes = current.changes_to(&wanted.with_defaults());
        assert_eq!(changes.words(), vec!["NOLOGIN"]);
    }

    #[test]
    fn test_retain_supported() {
        let mut options = RoleOptions::new()
            .with(RoleOption::Superuser, false)
            .with(RoleOption::Login, true)
            .with(RoleOption::BypassRls, false);
        options.retain_supported(false);
        assert_eq!(options.words(), vec!["LOGIN"]);
    }

    #[test]
    fn test_create_sql() {
        let role = Role::new("alice")
            .with_options(RoleOptions::new().with(RoleOption::Login, true))
            .with_comment("Alice's account");
        assert_eq!(
            role.create_sql(),
            vec![
                "CREATE ROLE \"alice\" WITH LOGIN;".to_string(),
                "COMMENT ON ROLE \"alice\" IS 'Alice''s account';".to_string(),
            ]
        );
        assert_eq!(
            Membership::new("alice", "dba").grant_sql(),
            "GRANT \"dba\" TO \"alice\";"
        );
    }
}
