//! LDAP connection settings
//!
//! Read from the usual OpenLDAP client environment variables.

use std::time::Duration;

use rolesync_core::{SyncError, SyncResult};

/// Default server URI.
pub const DEFAULT_URI: &str = "ldap://localhost";

/// Settings for binding to the directory.
#[derive(Clone)]
pub struct LdapSettings {
    /// Server URI, `ldap://` or `ldaps://`.
    pub uri: String,

    /// Bind DN. Anonymous bind when empty.
    pub bind_dn: Option<String>,

    /// Bind password.
    pub password: Option<String>,

    /// Connection and per-operation timeout.
    pub timeout: Duration,

    /// Upgrade a plain connection with STARTTLS.
    pub starttls: bool,
}

impl Default for LdapSettings {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            bind_dn: None,
            password: None,
            timeout: Duration::from_secs(10),
            starttls: false,
        }
    }
}

impl LdapSettings {
    /// Load settings from environment variables.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load settings from a custom variable reader.
    pub fn from_reader<F>(reader: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let uri = reader("LDAPURI").unwrap_or_else(|_| DEFAULT_URI.to_string());
        if !uri.starts_with("ldap://") && !uri.starts_with("ldaps://") && !uri.starts_with("ldapi://") {
            return Err(SyncError::config(
                "LDAPURI",
                format!("unsupported URI scheme in '{uri}'"),
            ));
        }

        let timeout_secs = reader("LDAP_CONNECT_TIMEOUT")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .map_err(|e| SyncError::config("LDAP_CONNECT_TIMEOUT", e.to_string()))?;

        let starttls = match reader("LDAP_STARTTLS") {
            Ok(value) => parse_bool(&value)
                .ok_or_else(|| SyncError::config("LDAP_STARTTLS", format!("invalid boolean '{value}'")))?,
            Err(_) => false,
        };

        Ok(Self {
            uri,
            bind_dn: reader("LDAPBINDDN").ok().filter(|s| !s.is_empty()),
            password: reader("LDAPPASSWORD").ok(),
            timeout: Duration::from_secs(timeout_secs),
            starttls,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl std::fmt::Debug for LdapSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapSettings")
            .field("uri", &self.uri)
            .field("bind_dn", &self.bind_dn)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .field("starttls", &self.starttls)
            .finish()
    }
}
