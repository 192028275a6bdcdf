//! Named protocol descriptors.
//!
//! A protocol names the handler that will consume readiness events for a
//! spawn's channels. Resolution happens before any OS resource is created,
//! so a bad name is a pure configuration error with nothing to unwind.

use crate::error::{Result, SpawnError};

/// A named handler descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protocol {
    name: String,
}

impl Protocol {
    /// Creates a protocol descriptor with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The protocol's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Ordered set of registered protocols. The first registration is the
/// default.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    protocols: Vec<Protocol>,
}

impl ProtocolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a protocol. Order of registration decides the default.
    pub fn register(&mut self, protocol: Protocol) {
        self.protocols.push(protocol);
    }

    /// Number of registered protocols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    /// Returns true if no protocol has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// Looks up a protocol by name, or the default for `None`.
    ///
    /// Fails with [`SpawnError::UnknownProtocol`] when the name matches
    /// nothing, or when no default exists because the registry is empty.
    pub fn resolve(&self, name: Option<&str>) -> Result<&Protocol> {
        match name {
            Some(wanted) => self
                .protocols
                .iter()
                .find(|p| p.name == wanted)
                .ok_or_else(|| SpawnError::UnknownProtocol(wanted.to_string())),
            None => self
                .protocols
                .first()
                .ok_or_else(|| SpawnError::UnknownProtocol("(default)".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    fn registry() -> ProtocolRegistry {
        let mut registry = ProtocolRegistry::new();
        registry.register(Protocol::new("raw-pipe"));
        registry.register(Protocol::new("line-buffered"));
        registry
    }

    #[test]
    fn first_registration_is_default() {
        init_test("first_registration_is_default");
        let registry = registry();
        let default = registry.resolve(None).expect("default").name().to_string();
        crate::assert_with_log!(default == "raw-pipe", "default", "raw-pipe", default);
        crate::test_complete!("first_registration_is_default");
    }

    #[test]
    fn resolve_by_name() {
        init_test("resolve_by_name");
        let registry = registry();
        let found = registry
            .resolve(Some("line-buffered"))
            .expect("named")
            .name()
            .to_string();
        crate::assert_with_log!(
            found == "line-buffered",
            "named",
            "line-buffered",
            found
        );
        crate::test_complete!("resolve_by_name");
    }

    #[test]
    fn unknown_name_is_rejected() {
        init_test("unknown_name_is_rejected");
        let registry = registry();
        let err = registry.resolve(Some("cgi")).expect_err("unknown");
        crate::assert_with_log!(
            matches!(&err, SpawnError::UnknownProtocol(n) if n == "cgi"),
            "variant",
            "UnknownProtocol(cgi)",
            err
        );
        crate::test_complete!("unknown_name_is_rejected");
    }

    #[test]
    fn empty_registry_has_no_default() {
        init_test("empty_registry_has_no_default");
        let registry = ProtocolRegistry::new();
        crate::assert_with_log!(registry.is_empty(), "empty", true, registry.is_empty());
        let err = registry.resolve(None).expect_err("no default");
        crate::assert_with_log!(
            matches!(err, SpawnError::UnknownProtocol(_)),
            "variant",
            "UnknownProtocol",
            err
        );
        crate::test_complete!("empty_registry_has_no_default");
    }
}
