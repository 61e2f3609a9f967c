//! # LDAP collaborator for rolesync
//!
//! Implements [`rolesync_core::Directory`] over `ldap3`: simple bind,
//! search and the WhoAmI extended operation.
//!
//! ```ignore
//! use rolesync_ldap::{LdapDirectory, LdapSettings};
//!
//! let directory = LdapDirectory::new(LdapSettings::from_env()?);
//! let identity = directory.bind().await?;
//! ```

pub mod config;
pub mod directory;

pub use config::LdapSettings;
pub use directory::LdapDirectory;
