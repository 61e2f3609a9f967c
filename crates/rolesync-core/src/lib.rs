//! # rolesync core
//!
//! Configuration model, privilege catalog and state types shared by the
//! rolesync crates.
//!
//! - [`value`]: dynamic tree parsed from YAML
//! - [`normalize`]: pure conversion of that tree into [`config::Config`]
//! - [`privilege`]: the well-known privilege catalog
//! - [`state`]: wanted and current state models
//! - [`traits`]: LDAP and PostgreSQL collaborator traits

pub mod config;
pub mod error;
pub mod normalize;
pub mod privilege;
pub mod role;
pub mod sql;
pub mod state;
pub mod template;
pub mod traits;
pub mod value;

pub use config::{
    Config, GrantRule, LdapSearchSpec, PostgresConfig, RoleRule, SearchScope, SyncItem,
};
pub use error::{CatalogError, CollaboratorError, CollaboratorResult, SyncError, SyncResult};
pub use privilege::{CatalogBuilder, Privilege, PrivilegeCatalog, PrivilegeType};
pub use role::{Membership, Role, RoleOption, RoleOptions};
pub use state::{
    CurrentState, Grant, GrantSpec, GrantTarget, ManagedScope, ObjectRef, ObjectScope, Topology,
    WantedState, ALL_WILDCARD,
};
pub use template::Template;
pub use traits::{Directory, LdapEntry, PgClient, SqlRow, SqlValue};
pub use value::Value;
