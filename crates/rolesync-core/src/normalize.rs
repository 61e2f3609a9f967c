//! Configuration normalizer
//!
//! Turns the loose, alias-rich document into canonical [`Config`] structs.
//! Every function is pure and fails fast with the path of the offending node.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{
    Config, GrantRule, LdapSearchSpec, PostgresConfig, RoleRule, SearchScope, SyncItem,
    DEFAULT_FILTER,
};
use crate::error::{SyncError, SyncResult};
use crate::role::{RoleOption, RoleOptions};
use crate::state::ALL_WILDCARD;
use crate::template::Template;
use crate::value::{display_path, join_key, Value};

/// Rename `alias` to `key`, failing when both are present.
pub fn normalize_alias(
    map: &BTreeMap<String, Value>,
    key: &str,
    alias: &str,
    path: &str,
) -> SyncResult<BTreeMap<String, Value>> {
    let mut out = map.clone();
    if let Some(value) = out.remove(alias) {
        if out.contains_key(key) {
            return Err(SyncError::KeyConflict {
                path: display_path(path),
                key: key.to_string(),
                conflict: alias.to_string(),
            });
        }
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

/// Wrap a scalar into a one-element list. Lists pass through unchanged.
#[must_use]
pub fn normalize_list(value: &Value) -> Vec<Value> {
    match value {
        Value::List(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// Coerce to a list and require every element to be a string.
pub fn normalize_string_list(value: &Value, path: &str) -> SyncResult<Vec<String>> {
    normalize_list(value)
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::String(s) => Ok(s),
            other => Err(SyncError::config(
                format!("{path}[{i}]"),
                format!("must be a string, got {}", other.type_name()),
            )),
        })
        .collect()
}

/// A map being consumed key by key.
struct Fields {
    path: String,
    map: BTreeMap<String, Value>,
}

impl Fields {
    fn new(value: &Value, path: &str, what: &str) -> SyncResult<Self> {
        match value {
            Value::Map(map) => Ok(Self {
                path: path.to_string(),
                map: map.clone(),
            }),
            other => Err(SyncError::config(
                display_path(path),
                format!("{what} must be a map, got {}", other.type_name()),
            )),
        }
    }

    fn alias(mut self, key: &str, alias: &str) -> SyncResult<Self> {
        self.map = normalize_alias(&self.map, key, alias, &self.path)?;
        Ok(self)
    }

    fn take(&mut self, key: &str) -> Option<Value> {
        self.map.remove(key)
    }

    fn path(&self, key: &str) -> String {
        join_key(&self.path, key)
    }

    fn take_string(&mut self, key: &str) -> SyncResult<Option<String>> {
        match self.take(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(SyncError::config(
                self.path(key),
                format!("must be a string, got {}", other.type_name()),
            )),
        }
    }

    fn take_string_list(&mut self, key: &str) -> SyncResult<Option<Vec<String>>> {
        match self.take(key) {
            None => Ok(None),
            Some(value) => normalize_string_list(&value, &self.path(key)).map(Some),
        }
    }

    fn finish(self) -> SyncResult<()> {
        match self.map.keys().next() {
            Some(key) => Err(SyncError::config(
                join_key(&self.path, key),
                "unknown key",
            )),
            None => Ok(()),
        }
    }
}

/// Role options given as words, a list of words, or a map of booleans.
pub fn normalize_role_options(value: &Value, path: &str) -> SyncResult<RoleOptions> {
    match value {
        Value::Map(map) => {
            let mut options = RoleOptions::new();
            for (word, flag) in map {
                let (option, positive) = RoleOption::parse_word(word).ok_or_else(|| {
                    SyncError::config(join_key(path, word), "unknown role option")
                })?;
                let Value::Bool(flag) = flag else {
                    return Err(SyncError::config(
                        join_key(path, word),
                        format!("must be a boolean, got {}", flag.type_name()),
                    ));
                };
                options
                    .merge_one(option, if positive { *flag } else { !*flag })
                    .map_err(|m| SyncError::config(path, m))?;
            }
            Ok(options)
        }
        Value::Null => Ok(RoleOptions::new()),
        other => {
            let words = normalize_string_list(other, path)?;
            RoleOptions::parse_words(words.iter().map(String::as_str))
                .map_err(|m| SyncError::config(path, m))
        }
    }
}

/// A bare string is shorthand for `{names: [string]}`.
pub fn normalize_role_rule(value: &Value, path: &str) -> SyncResult<RoleRule> {
    if let Value::String(name) = value {
        return Ok(RoleRule {
            names: vec![name.clone()],
            ..RoleRule::default()
        });
    }

    let mut fields = Fields::new(value, path, "role rule")?
        .alias("names", "name")?
        .alias("comments", "comment")?
        .alias("parents", "parent")?
        .alias("members", "member")?;

    let names = fields.take_string_list("names")?.unwrap_or_default();
    if names.is_empty() {
        return Err(SyncError::config(display_path(path), "role rule requires names"));
    }
    let comments = fields.take_string_list("comments")?.unwrap_or_default();
    if comments.len() > 1 && comments.len() != names.len() {
        return Err(SyncError::config(
            fields.path("comments"),
            format!(
                "expected 0, 1 or {} comments, got {}",
                names.len(),
                comments.len()
            ),
        ));
    }
    let options = match fields.take("options") {
        Some(value) => normalize_role_options(&value, &fields.path("options"))?,
        None => RoleOptions::new(),
    };
    let parents = fields.take_string_list("parents")?.unwrap_or_default();
    let members = fields.take_string_list("members")?.unwrap_or_default();
    fields.finish()?;

    Ok(RoleRule {
        names,
        comments,
        options,
        parents,
        members,
    })
}

pub fn normalize_grant_rule(value: &Value, path: &str) -> SyncResult<GrantRule> {
    let mut fields = Fields::new(value, path, "grant rule")?
        .alias("privileges", "privilege")?
        .alias("databases", "database")?
        .alias("schemas", "schema")?
        .alias("roles", "role")?;

    let privileges = fields.take_string_list("privileges")?.unwrap_or_default();
    if privileges.is_empty() {
        return Err(SyncError::config(display_path(path), "grant rule requires privileges"));
    }
    let roles = fields.take_string_list("roles")?.unwrap_or_default();
    if roles.is_empty() {
        return Err(SyncError::config(display_path(path), "grant rule requires roles"));
    }
    let databases = fields
        .take_string_list("databases")?
        .unwrap_or_else(|| vec![ALL_WILDCARD.to_string()]);
    let schemas = fields
        .take_string_list("schemas")?
        .unwrap_or_else(|| vec![ALL_WILDCARD.to_string()]);
    fields.finish()?;

    Ok(GrantRule {
        privileges,
        databases,
        schemas,
        roles,
    })
}

pub fn normalize_ldap_search(value: &Value, path: &str) -> SyncResult<LdapSearchSpec> {
    let mut fields = Fields::new(value, path, "ldapsearch")?.alias("attributes", "attribute")?;

    let base = fields
        .take_string("base")?
        .ok_or_else(|| SyncError::config(display_path(path), "ldapsearch requires base"))?;
    let filter = fields
        .take_string("filter")?
        .unwrap_or_else(|| DEFAULT_FILTER.to_string());
    let scope = match fields.take_string("scope")? {
        Some(text) => SearchScope::parse(&text).ok_or_else(|| {
            SyncError::config(
                fields.path("scope"),
                format!("unknown scope '{text}', expected base, onelevel or subtree"),
            )
        })?,
        None => SearchScope::default(),
    };
    let attributes = fields
        .take_string_list("attributes")?
        .unwrap_or_default()
        .into_iter()
        .map(|a| a.to_ascii_lowercase())
        .collect();
    fields.finish()?;

    Ok(LdapSearchSpec {
        base,
        filter,
        scope,
        attributes,
    })
}

pub fn normalize_sync_item(value: &Value, path: &str) -> SyncResult<SyncItem> {
    let mut fields = Fields::new(value, path, "sync item")?
        .alias("ldapsearch", "ldap")?
        .alias("roles", "role")?
        .alias("grant", "grants")?;

    let description = fields.take_string("description")?;
    let mut ldapsearch = match fields.take("ldapsearch") {
        Some(value) => Some(normalize_ldap_search(&value, &fields.path("ldapsearch"))?),
        None => None,
    };

    let roles = match fields.take("roles") {
        Some(value) => {
            let roles_path = fields.path("roles");
            normalize_list(&value)
                .iter()
                .enumerate()
                .map(|(i, rule)| normalize_role_rule(rule, &format!("{roles_path}[{i}]")))
                .collect::<SyncResult<Vec<_>>>()?
        }
        None => Vec::new(),
    };
    let grants = match fields.take("grant") {
        Some(value) => {
            let grant_path = fields.path("grant");
            normalize_list(&value)
                .iter()
                .enumerate()
                .map(|(i, rule)| normalize_grant_rule(rule, &format!("{grant_path}[{i}]")))
                .collect::<SyncResult<Vec<_>>>()?
        }
        None => Vec::new(),
    };
    fields.finish()?;

    let mut templates = TemplateScan::default();
    for (i, rule) in roles.iter().enumerate() {
        let rule_path = format!("{}[{i}]", join_key(path, "roles"));
        templates.scan(&rule_path, "names", &rule.names)?;
        templates.scan(&rule_path, "comments", &rule.comments)?;
        templates.scan(&rule_path, "parents", &rule.parents)?;
        templates.scan(&rule_path, "members", &rule.members)?;
    }
    for (i, rule) in grants.iter().enumerate() {
        let rule_path = format!("{}[{i}]", join_key(path, "grant"));
        templates.scan(&rule_path, "databases", &rule.databases)?;
        templates.scan(&rule_path, "schemas", &rule.schemas)?;
        templates.scan(&rule_path, "roles", &rule.roles)?;
    }

    match (&mut ldapsearch, templates.first_dynamic) {
        (Some(search), _) => search.attributes.extend(templates.attributes),
        (None, Some((field_path, source))) => {
            return Err(SyncError::config(
                field_path,
                format!("template '{source}' requires an ldapsearch"),
            ))
        }
        (None, None) => {}
    }

    Ok(SyncItem {
        description,
        ldapsearch,
        roles,
        grants,
    })
}

/// Attributes referenced by the templates of one sync item.
#[derive(Default)]
struct TemplateScan {
    attributes: BTreeSet<String>,
    first_dynamic: Option<(String, String)>,
}

impl TemplateScan {
    fn scan(&mut self, rule_path: &str, key: &str, sources: &[String]) -> SyncResult<()> {
        for (i, source) in sources.iter().enumerate() {
            let field_path = format!("{rule_path}.{key}[{i}]");
            let template =
                Template::parse(source).map_err(|m| SyncError::config(&field_path, m))?;
            if !template.is_static() && self.first_dynamic.is_none() {
                self.first_dynamic = Some((field_path, source.clone()));
            }
            self.attributes.extend(
                template
                    .fields()
                    .filter(|f| *f != "dn")
                    .map(str::to_string),
            );
        }
        Ok(())
    }
}

pub fn normalize_sync_map(value: &Value, path: &str) -> SyncResult<Vec<SyncItem>> {
    let Value::List(items) = value else {
        return Err(SyncError::config(
            path,
            format!("must be a list, got {}", value.type_name()),
        ));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| normalize_sync_item(item, &format!("{path}[{i}]")))
        .collect()
}

pub fn normalize_postgres(value: &Value, path: &str) -> SyncResult<PostgresConfig> {
    let mut fields = Fields::new(value, path, "postgres section")?;
    let defaults = PostgresConfig::default();

    let config = PostgresConfig {
        managed_roles_query: fields.take_string("managed_roles_query")?,
        roles_blacklist: fields
            .take_string_list("roles_blacklist")?
            .unwrap_or(defaults.roles_blacklist),
        fallback_owner: fields
            .take_string("fallback_owner")?
            .unwrap_or(defaults.fallback_owner),
        databases_query: fields.take_string("databases_query")?,
    };
    fields.finish()?;
    Ok(config)
}

/// User-defined privilege groups: `name -> [member, ...]`.
pub fn normalize_privileges(value: &Value, path: &str) -> SyncResult<BTreeMap<String, Vec<String>>> {
    let Value::Map(map) = value else {
        return Err(SyncError::config(
            path,
            format!("must be a map, got {}", value.type_name()),
        ));
    };
    map.iter()
        .map(|(name, members)| {
            let members = normalize_string_list(members, &join_key(path, name))?;
            Ok((name.clone(), members))
        })
        .collect()
}

/// Normalize the whole document.
pub fn normalize_config(root: &Value) -> SyncResult<Config> {
    let mut fields = Fields::new(root, "", "configuration root")?;

    let sync_map = fields
        .take("sync_map")
        .ok_or_else(|| SyncError::config("<root>", "missing sync_map"))?;
    let sync_map = normalize_sync_map(&sync_map, "sync_map")?;
    let postgres = match fields.take("postgres") {
        Some(value) => normalize_postgres(&value, "postgres")?,
        None => PostgresConfig::default(),
    };
    let privileges = match fields.take("privileges") {
        Some(value) => normalize_privileges(&value, "privileges")?,
        None => BTreeMap::new(),
    };
    fields.finish()?;

    Ok(Config {
        postgres,
        privileges,
        sync_map,
    })
}
