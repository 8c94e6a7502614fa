//! Key Router

use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::{InstanceRegistry, RegisteredBackend};
use crate::ticket_key::TicketKey;

/// Selects the backend that owns a ticket key
#[derive(Debug, Clone)]
pub struct KeyRouter {
    registry: Arc<InstanceRegistry>,
}

impl KeyRouter {
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// First rule claiming the key's prefix wins; everything else goes to
    /// the primary. No I/O.
    pub fn resolve(&self, key: &TicketKey) -> Result<RegisteredBackend> {
        let primary = self.registry.primary().ok_or_else(|| {
            Error::Configuration("no primary Jira instance is registered".to_string())
        })?;

        let prefix = key.prefix();
        let backend = self
            .registry
            .rules()
            .iter()
            .find(|rule| rule.claims(prefix))
            .map(|rule| &rule.backend)
            .unwrap_or(primary);

        debug!(key = %key, backend = %backend.label(), "Routed ticket key");
        Ok(backend.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;
    use crate::registry::BackendConnection;
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

    fn router() -> KeyRouter {
        let registry = InstanceRegistry::builder()
            .primary(backend("primary"))
            .secondary(backend("secondary-1"), ["ABC", "XYZ"])
            .secondary(backend("secondary-2"), ["XYZ", "QE"])
            .build();
        KeyRouter::new(Arc::new(registry))
    }

    fn route(router: &KeyRouter, key: &str) -> String {
        router
            .resolve(&TicketKey::parse(key).unwrap())
            .unwrap()
            .label()
            .to_string()
    }

    #[test]
    fn test_secondary_prefix_routes_to_secondary() {
        let router = router();
        assert_eq!(route(&router, "ABC-100"), "secondary-1");
        assert_eq!(route(&router, "abc-7"), "secondary-1");
        assert_eq!(route(&router, "QE-1"), "secondary-2");
    }

    #[test]
    fn test_unclaimed_prefix_routes_to_primary() {
        let router = router();
        assert_eq!(route(&router, "FOO-1"), "primary");
        // Prefix matching is exact, not by string prefix
        assert_eq!(route(&router, "ABCD-1"), "primary");
    }

    #[test]
    fn test_overlapping_prefix_first_registration_wins() {
        assert_eq!(route(&router(), "XYZ-9"), "secondary-1");
    }

    #[test]
    fn test_missing_primary_is_configuration_error() {
        let registry = InstanceRegistry::builder()
            .secondary(backend("secondary-1"), ["ABC"])
            .build();
        let router = KeyRouter::new(Arc::new(registry));
        let err = router
            .resolve(&TicketKey::parse("ABC-1").unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
