//! LDAP directory client over `ldap3`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ldap3::exop::{WhoAmI, WhoAmIResp};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use rolesync_core::{
    CollaboratorError, CollaboratorResult, Directory, LdapEntry, LdapSearchSpec, SearchScope,
};

use crate::config::LdapSettings;

/// Result code of `invalidCredentials`.
const INVALID_CREDENTIALS: u32 = 49;

/// A directory bound with [`LdapSettings`].
pub struct LdapDirectory {
    settings: LdapSettings,

    /// Cached LDAP connection (lazily initialized).
    connection: Arc<RwLock<Option<Ldap>>>,
}

impl LdapDirectory {
    #[must_use]
    pub fn new(settings: LdapSettings) -> Self {
        Self {
            settings,
            connection: Arc::new(RwLock::new(None)),
        }
    }

    /// Connect and bind, reporting the bound identity.
    #[instrument(skip(self), fields(uri = %self.settings.uri))]
    pub async fn bind(&self) -> CollaboratorResult<String> {
        self.get_connection().await?;
        let identity = self.whoami().await?;
        info!(identity = %identity, "Bound to LDAP directory");
        Ok(identity)
    }

    /// Close the connection, if any.
    pub async fn unbind(&self) {
        let mut guard = self.connection.write().await;
        if let Some(mut ldap) = guard.take() {
            if let Err(e) = ldap.unbind().await {
                debug!(error = %e, "LDAP unbind failed");
            }
        }
    }

    async fn get_connection(&self) -> CollaboratorResult<Ldap> {
        {
            let guard = self.connection.read().await;
            if let Some(ref conn) = *guard {
                return Ok(conn.clone());
            }
        }

        let conn = self.create_connection().await?;
        {
            let mut guard = self.connection.write().await;
            *guard = Some(conn.clone());
        }
        Ok(conn)
    }

    async fn create_connection(&self) -> CollaboratorResult<Ldap> {
        let uri = &self.settings.uri;
        debug!(uri = %uri, "Connecting to LDAP server");

        let conn_settings = LdapConnSettings::new()
            .set_conn_timeout(self.settings.timeout)
            .set_starttls(self.settings.starttls);

        let (conn, mut ldap) = LdapConnAsync::with_settings(conn_settings, uri)
            .await
            .map_err(|e| map_ldap_error(e, "connect", self.settings.timeout.as_secs()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        let bind_dn = self.settings.bind_dn.as_deref().unwrap_or("");
        let password = self.settings.password.as_deref().unwrap_or("");
        debug!(bind_dn = %bind_dn, "Performing LDAP bind");

        let result = ldap
            .with_timeout(self.settings.timeout)
            .simple_bind(bind_dn, password)
            .await
            .map_err(|e| map_ldap_error(e, "bind", self.settings.timeout.as_secs()))?;

        if result.rc != 0 {
            if result.rc == INVALID_CREDENTIALS {
                return Err(CollaboratorError::AuthenticationFailed {
                    message: format!("invalid credentials for '{bind_dn}'"),
                });
            }
            return Err(CollaboratorError::connection_failed(format!(
                "LDAP bind failed with code {}: {}",
                result.rc, result.text
            )));
        }

        Ok(ldap)
    }
}

fn map_ldap_error(err: LdapError, operation: &str, timeout_secs: u64) -> CollaboratorError {
    match err {
        LdapError::Timeout { .. } => CollaboratorError::Timeout {
            operation: format!("LDAP {operation}"),
            timeout_secs,
        },
        LdapError::Io { .. } | LdapError::EndOfStream => {
            CollaboratorError::connection_failed_with_source(format!("LDAP {operation}"), err)
        }
        other => CollaboratorError::query_failed_with_source(format!("LDAP {operation}"), other),
    }
}

fn to_scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Base => Scope::Base,
        SearchScope::OneLevel => Scope::OneLevel,
        SearchScope::Subtree => Scope::Subtree,
    }
}

/// Convert a search entry, lowercasing attribute names.
fn to_entry(entry: SearchEntry) -> LdapEntry {
    let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, values) in entry.attrs {
        attributes
            .entry(name.to_ascii_lowercase())
            .or_default()
            .extend(values);
    }
    LdapEntry {
        dn: entry.dn,
        attributes,
    }
}

#[async_trait]
impl Directory for LdapDirectory {
    async fn whoami(&self) -> CollaboratorResult<String> {
        let mut ldap = self.get_connection().await?;
        let timeout_secs = self.settings.timeout.as_secs();
        let (exop, _) = ldap
            .with_timeout(self.settings.timeout)
            .extended(WhoAmI)
            .await
            .map_err(|e| map_ldap_error(e, "whoami", timeout_secs))?
            .success()
            .map_err(|e| map_ldap_error(e, "whoami", timeout_secs))?;
        let response: WhoAmIResp = exop.parse();
        Ok(if response.authzid.is_empty() {
            "anonymous".to_string()
        } else {
            response.authzid
        })
    }

    #[instrument(skip(self, spec), fields(base = %spec.base, filter = %spec.filter))]
    async fn search(&self, spec: &LdapSearchSpec) -> CollaboratorResult<Vec<LdapEntry>> {
        let mut ldap = self.get_connection().await?;
        let timeout_secs = self.settings.timeout.as_secs();

        // "1.1" asks for no attribute at all
        let attrs: Vec<&str> = if spec.attributes.is_empty() {
            vec!["1.1"]
        } else {
            spec.attributes.iter().map(String::as_str).collect()
        };

        debug!(scope = %spec.scope, attributes = ?attrs, "Searching LDAP");

        let (entries, _) = ldap
            .with_timeout(self.settings.timeout)
            .search(&spec.base, to_scope(spec.scope), &spec.filter, attrs)
            .await
            .map_err(|e| map_ldap_error(e, "search", timeout_secs))?
            .success()
            .map_err(|e| map_ldap_error(e, "search", timeout_secs))?;

        let entries: Vec<LdapEntry> = entries
            .into_iter()
            .map(SearchEntry::construct)
            .map(to_entry)
            .collect();

        info!(total_found = entries.len(), "LDAP search completed");
        Ok(entries)
    }
}

impl std::fmt::Debug for LdapDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapDirectory")
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_to_entry_lowercases_attributes() {
        let entry = SearchEntry {
            dn: "uid=alice,ou=people".to_string(),
            attrs: HashMap::from([
                ("uid".to_string(), vec!["alice".to_string()]),
                ("memberOf".to_string(), vec!["cn=dba".to_string()]),
            ]),
            bin_attrs: HashMap::new(),
        };
        let converted = to_entry(entry);
        assert_eq!(converted.first_value("memberof"), Some("cn=dba"));
        assert_eq!(converted.first_value("dn"), Some("uid=alice,ou=people"));
    }

    #[test]
    fn test_scope_mapping() {
        assert!(matches!(to_scope(SearchScope::Base), Scope::Base));
        assert!(matches!(to_scope(SearchScope::OneLevel), Scope::OneLevel));
        assert!(matches!(to_scope(SearchScope::Subtree), Scope::Subtree));
    }

    #[test]
    fn test_debug_hides_password() {
        let directory = LdapDirectory::new(LdapSettings {
            password: Some("hunter2".into()),
            ..LdapSettings::default()
        });
        assert!(!format!("{directory:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let directory = LdapDirectory::new(LdapSettings {
            uri: "ldap://127.0.0.1:1".into(),
            timeout: std::time::Duration::from_secs(1),
            ..LdapSettings::default()
        });
        let err = directory.bind().await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }
}
