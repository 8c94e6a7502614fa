//! Instance Registry
//!
//! Holds every configured Jira backend together with the routing rules that
//! map project prefixes onto secondaries. Built once at startup, read-only
//! afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Config, Credential, InstanceSettings};
use crate::error::Result;
use crate::jira::{HttpJiraBackend, JiraBackend};

/// Host and credential data for one Jira instance
pub struct BackendConnection {
    label: String,
    host: String,
    base_url: String,
    credential: Credential,
}

impl BackendConnection {
    /// `host` may carry a scheme; `https://` is assumed otherwise.
    pub fn new(label: impl Into<String>, host: impl Into<String>, credential: Credential) -> Self {
        let host = host.into();
        let trimmed = host.trim().trim_end_matches('/');
        let base_url = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };

        Self {
            label: label.into(),
            host,
            base_url,
            credential,
        }
    }

    pub fn from_settings(settings: &InstanceSettings) -> Self {
        Self::new(
            settings.label.clone(),
            settings.host.clone(),
            settings.credential.clone(),
        )
    }

    /// `primary` or `secondary-N`
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("label", &self.label)
            .field("base_url", &self.base_url)
            .field("credential", &self.credential)
            .finish()
    }
}

/// A connection paired with the client that talks to it
#[derive(Clone)]
pub struct RegisteredBackend {
    pub connection: Arc<BackendConnection>,
    pub client: Arc<dyn JiraBackend>,
}

impl RegisteredBackend {
    pub fn label(&self) -> &str {
        self.connection.label()
    }
}

impl fmt::Debug for RegisteredBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredBackend")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Upper-cased project prefixes owned by one secondary backend
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub prefixes: Vec<String>,
    pub backend: RegisteredBackend,
}

impl RoutingRule {
    pub fn claims(&self, prefix: &str) -> bool {
        self.prefixes.iter().any(|p| p == prefix)
    }
}

/// All configured backends, primary first
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    primary: Option<RegisteredBackend>,
    rules: Vec<RoutingRule>,
}

impl InstanceRegistry {
    pub fn builder() -> InstanceRegistryBuilder {
        InstanceRegistryBuilder::default()
    }

    /// Build HTTP backends for every configured instance
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = |settings: &InstanceSettings| -> Result<RegisteredBackend> {
            let connection = Arc::new(BackendConnection::from_settings(settings));
            let client: Arc<dyn JiraBackend> =
                Arc::new(HttpJiraBackend::new(connection.clone(), config.jira_timeout)?);
            Ok(RegisteredBackend { connection, client })
        };

        let mut builder = Self::builder().primary(http(&config.primary)?);
        for settings in &config.secondaries {
            builder = builder.secondary(http(settings)?, &settings.prefixes);
        }
        Ok(builder.build())
    }

    pub fn primary(&self) -> Option<&RegisteredBackend> {
        self.primary.as_ref()
    }

    /// Routing rules in registration order
    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Every backend, primary first, then secondaries in registration order
    pub fn backends(&self) -> impl Iterator<Item = &RegisteredBackend> {
        self.primary
            .iter()
            .chain(self.rules.iter().map(|rule| &rule.backend))
    }
}

#[derive(Default)]
pub struct InstanceRegistryBuilder {
    primary: Option<RegisteredBackend>,
    rules: Vec<RoutingRule>,
}

impl InstanceRegistryBuilder {
    pub fn primary(mut self, backend: RegisteredBackend) -> Self {
        self.primary = Some(backend);
        self
    }

    pub fn secondary<I, S>(mut self, backend: RegisteredBackend, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for prefix in prefixes {
            let prefix = prefix.as_ref().trim().to_ascii_uppercase();
            if !prefix.is_empty() && !normalized.contains(&prefix) {
                normalized.push(prefix);
            }
        }
        self.rules.push(RoutingRule {
            prefixes: normalized,
            backend,
        });
        self
    }

    /// Finalize. A prefix claimed by more than one rule stays with the
    /// first-registered rule; every shadowed claim is logged.
    pub fn build(self) -> InstanceRegistry {
        let mut owners: HashMap<String, String> = HashMap::new();
        for rule in &self.rules {
            for prefix in &rule.prefixes {
                match owners.get(prefix) {
                    Some(owner) => warn!(
                        prefix = %prefix,
                        owner = %owner,
                        shadowed = %rule.backend.label(),
                        "Project prefix claimed by more than one instance; first registration wins"
                    ),
                    None => {
                        owners.insert(prefix.clone(), rule.backend.label().to_string());
                    }
                }
            }
        }

        if self.primary.is_none() {
            warn!("Instance registry built without a primary backend");
        }
        info!(
            secondaries = self.rules.len(),
            prefixes = owners.len(),
            "Instance registry ready"
        );

        InstanceRegistry {
            primary: self.primary,
            rules: self.rules,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeJira;

    fn backend(label: &str) -> RegisteredBackend {
        RegisteredBackend {
            connection: Arc::new(BackendConnection::new(
                label,
                format!("{label}.example.com"),
                Credential::Token("t".into()),
            )),
            client: Arc::new(FakeJira::new()),
        }
    }

    #[test]
    fn test_base_url_defaults_to_https() {
        let conn = BackendConnection::new("primary", "jira.example.com/", Credential::Token("t".into()));
        assert_eq!(conn.base_url(), "https://jira.example.com");

        let conn = BackendConnection::new("primary", "http://127.0.0.1:8080", Credential::Token("t".into()));
        assert_eq!(conn.base_url(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_connection_debug_redacts_credential() {
        let conn = BackendConnection::new(
            "primary",
            "jira.example.com",
            Credential::Basic {
                username: "me".into(),
                password: "hunter2".into(),
            },
        );
        assert!(!format!("{conn:?}").contains("hunter2"));
    }

    #[test]
    fn test_builder_normalizes_prefixes_and_orders_backends() {
        let registry = InstanceRegistry::builder()
            .primary(backend("primary"))
            .secondary(backend("secondary-1"), ["abc", " XYZ ", "ABC", ""])
            .secondary(backend("secondary-2"), ["QE"])
            .build();

        assert_eq!(registry.rules()[0].prefixes, vec!["ABC", "XYZ"]);
        let labels: Vec<_> = registry.backends().map(|b| b.label()).collect();
        assert_eq!(labels, vec!["primary", "secondary-1", "secondary-2"]);
    }

    #[test]
    fn test_from_config_registers_every_instance() {
        let config = Config::from_lookup(|name| match name {
            "PRIMARY_JIRA_HOST" => Some("jira.example.com".into()),
            "PRIMARY_JIRA_PAT" => Some("p".into()),
            "SECONDARY_JIRA_HOST" => Some("issues.other.org".into()),
            "SECONDARY_JIRA_PAT" => Some("s".into()),
            "SECONDARY_PROJECT_PREFIXES" => Some("ABC,XYZ".into()),
            _ => None,
        })
        .unwrap();

        let registry = InstanceRegistry::from_config(&config).unwrap();
        assert_eq!(registry.primary().unwrap().label(), "primary");
        assert_eq!(registry.rules().len(), 1);
        assert!(registry.rules()[0].claims("XYZ"));
        assert_eq!(
            registry.rules()[0].backend.connection.base_url(),
            "https://issues.other.org"
        );
    }
}
