//! Rule expansion
//!
//! Instantiates the role and grant rules of every sync item, once for items
//! without `ldapsearch` and once per directory entry otherwise. Searches may
//! run concurrently; results are merged in sync-map order.

use std::collections::BTreeSet;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use rolesync_core::{
    Config, Directory, GrantRule, GrantSpec, LdapEntry, Membership, ObjectScope, PrivilegeCatalog,
    Role, RoleRule, SyncError, SyncItem, SyncResult, Template, WantedState,
};

/// Output of [`RuleExpander::expand`].
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    pub wanted: WantedState,
    pub searches: usize,
    pub entries: usize,
    /// Sync items skipped because of an isolated template error.
    pub skipped_items: usize,
}

/// Roles, memberships and grants contributed by one sync item.
#[derive(Debug, Default)]
struct ItemOutput {
    roles: Vec<Role>,
    memberships: BTreeSet<Membership>,
    grant_specs: BTreeSet<GrantSpec>,
}

pub struct RuleExpander<'a> {
    catalog: &'a PrivilegeCatalog,
    directory: Option<&'a dyn Directory>,
    concurrency: usize,
    isolate_template_errors: bool,
}

impl<'a> RuleExpander<'a> {
    #[must_use]
    pub fn new(catalog: &'a PrivilegeCatalog) -> Self {
        Self {
            catalog,
            directory: None,
            concurrency: 1,
            isolate_template_errors: false,
        }
    }

    #[must_use]
    pub fn with_directory(mut self, directory: &'a dyn Directory) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Maximum number of searches in flight.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Skip a sync item on template errors instead of failing the run.
    #[must_use]
    pub fn isolate_template_errors(mut self, isolate: bool) -> Self {
        self.isolate_template_errors = isolate;
        self
    }

    /// Expand the whole sync map into a wanted state.
    pub async fn expand(&self, config: &Config) -> SyncResult<Expansion> {
        let results: Vec<Option<Vec<LdapEntry>>> = stream::iter(config.sync_map.iter().enumerate())
            .map(|(index, item)| self.search(index, item))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let mut expansion = Expansion::default();
        for (index, (item, entries)) in config.sync_map.iter().zip(results).enumerate() {
            let label = item.label(index);
            if let Some(entries) = &entries {
                expansion.searches += 1;
                expansion.entries += entries.len();
            }

            match self.instantiate_item(item, entries.as_deref()) {
                Ok(output) => {
                    debug!(
                        item = %label,
                        roles = output.roles.len(),
                        memberships = output.memberships.len(),
                        grants = output.grant_specs.len(),
                        "Expanded sync item"
                    );
                    merge(&mut expansion.wanted, output);
                }
                Err(err @ SyncError::TemplateSubstitution { .. }) if self.isolate_template_errors => {
                    warn!(item = %label, error = %err, "Skipping sync item");
                    expansion.skipped_items += 1;
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            roles = expansion.wanted.roles.len(),
            memberships = expansion.wanted.memberships.len(),
            grants = expansion.wanted.grant_specs.len(),
            searches = expansion.searches,
            "Expanded sync map"
        );
        Ok(expansion)
    }

    async fn search(&self, index: usize, item: &SyncItem) -> SyncResult<Option<Vec<LdapEntry>>> {
        let Some(spec) = &item.ldapsearch else {
            return Ok(None);
        };
        let directory = self.directory.ok_or_else(|| {
            SyncError::config(
                format!("sync_map[{index}].ldapsearch"),
                "no LDAP directory available",
            )
        })?;
        let entries = directory.search(spec).await?;
        debug!(item = %item.label(index), entries = entries.len(), "LDAP search returned");
        Ok(Some(entries))
    }

    fn instantiate_item(&self, item: &SyncItem, entries: Option<&[LdapEntry]>) -> SyncResult<ItemOutput> {
        let mut output = ItemOutput::default();
        match entries {
            None => self.instantiate_rules(item, None, &mut output)?,
            Some(entries) => {
                for entry in entries {
                    self.instantiate_rules(item, Some(entry), &mut output)?;
                }
            }
        }
        Ok(output)
    }

    fn instantiate_rules(
        &self,
        item: &SyncItem,
        entry: Option<&LdapEntry>,
        output: &mut ItemOutput,
    ) -> SyncResult<()> {
        for rule in &item.roles {
            self.instantiate_role_rule(rule, entry, output)?;
        }
        for rule in &item.grants {
            self.instantiate_grant_rule(rule, entry, output)?;
        }
        Ok(())
    }

    fn instantiate_role_rule(
        &self,
        rule: &RoleRule,
        entry: Option<&LdapEntry>,
        output: &mut ItemOutput,
    ) -> SyncResult<()> {
        for (index, name) in rule.names.iter().enumerate() {
            let name = render(name, entry)?;
            let comment = rule
                .comment_for(index)
                .map(|c| render(c, entry))
                .transpose()?;

            for parent in &rule.parents {
                output
                    .memberships
                    .insert(Membership::new(&name, render(parent, entry)?));
            }
            for member in &rule.members {
                output
                    .memberships
                    .insert(Membership::new(render(member, entry)?, &name));
            }

            output.roles.push(Role {
                name,
                options: rule.options.clone(),
                comment,
            });
        }
        Ok(())
    }

    fn instantiate_grant_rule(
        &self,
        rule: &GrantRule,
        entry: Option<&LdapEntry>,
        output: &mut ItemOutput,
    ) -> SyncResult<()> {
        let grantees = render_all(&rule.roles, entry)?;
        let databases = render_all(&rule.databases, entry)?;
        let schemas = render_all(&rule.schemas, entry)?;

        for name in &rule.privileges {
            for privilege in self.catalog.resolve(name)? {
                for grantee in &grantees {
                    for database in &databases {
                        for schema in &schemas {
                            output.grant_specs.insert(GrantSpec {
                                grantee: grantee.clone(),
                                privilege: privilege.name.clone(),
                                database: ObjectScope::parse(database),
                                schema: ObjectScope::parse(schema),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn render(source: &str, entry: Option<&LdapEntry>) -> SyncResult<String> {
    let template = Template::parse(source).map_err(|m| SyncError::config(source, m))?;
    match entry {
        Some(entry) => template.render(entry),
        None => Ok(template.render_static()),
    }
}

fn render_all(sources: &[String], entry: Option<&LdapEntry>) -> SyncResult<Vec<String>> {
    sources.iter().map(|s| render(s, entry)).collect()
}

/// Later roles override earlier ones. Memberships and grants accumulate.
fn merge(wanted: &mut WantedState, output: ItemOutput) {
    for role in output.roles {
        wanted.roles.insert(role.name.clone(), role);
    }
    wanted.memberships.extend(output.memberships);
    wanted.grant_specs.extend(output.grant_specs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolesync_core::RoleOption;

    fn expand_static(yaml: &str) -> WantedState {
        let catalog = PrivilegeCatalog::builtin().unwrap();
        let config = Config::from_yaml_str(yaml).unwrap();
        let expander = RuleExpander::new(&catalog);
        futures::executor::block_on(expander.expand(&config))
            .unwrap()
            .wanted
    }

    #[test]
    fn test_static_roles_and_memberships() {
        let wanted = expand_static(
            "sync_map:\n- roles:\n  - readers\n  - names: [alice, bob]\n    parent: readers\n    member: auditor\n",
        );
        assert_eq!(
            wanted.roles.keys().collect::<Vec<_>>(),
            vec!["alice", "bob", "readers"]
        );
        assert!(wanted.memberships.contains(&Membership::new("alice", "readers")));
        assert!(wanted.memberships.contains(&Membership::new("auditor", "bob")));
        assert_eq!(wanted.memberships.len(), 4);
    }

    #[test]
    fn test_last_write_wins_for_options() {
        let wanted = expand_static(
            "sync_map:\n- role: {name: alice, options: LOGIN, comment: first}\n- role: {name: alice, options: NOLOGIN}\n",
        );
        let alice = &wanted.roles["alice"];
        assert_eq!(alice.options.get(RoleOption::Login), Some(false));
        assert_eq!(alice.comment, None);
    }

    #[test]
    fn test_grant_privilege_groups_are_flattened() {
        let wanted = expand_static(
            "sync_map:\n- grant: {privilege: __ro__, role: reader, database: app, schema: public}\n",
        );
        let privileges: Vec<&str> = wanted
            .grant_specs
            .iter()
            .map(|s| s.privilege.as_str())
            .collect();
        assert_eq!(
            privileges,
            vec![
                "__connect__",
                "__select_on_sequences__",
                "__select_on_tables__",
                "__usage_on_schemas__",
            ]
        );
        assert!(wanted
            .grant_specs
            .iter()
            .all(|s| s.database == ObjectScope::Named("app".into())));
    }
}
