//! Service identifiers, metadata properties and well-known property keys.

use std::collections::BTreeMap;
use std::fmt;

/// Property holding the capabilities a service is published under.
pub const OBJECT_CLASS: &str = "objectClass";

/// Property holding the registry-assigned id of a service.
pub const SERVICE_ID: &str = "service.id";

/// Capability implemented by persistence providers.
pub const PERSISTENCE_PROVIDER: &str = "javax.persistence.spi.PersistenceProvider";

/// Property a provider advertises its implementation class name under.
pub const PERSISTENCE_PROVIDER_NAME: &str = "javax.persistence.provider";

/// Capability the derived factory builders are published under.
pub const FACTORY_BUILDER: &str = "org.osgi.service.jpa.EntityManagerFactoryBuilder";

/// Capability implemented by data sources.
pub const DATA_SOURCE: &str = "javax.sql.DataSource";

/// Property naming a data source in the JNDI namespace.
pub const JNDI_SERVICE_NAME: &str = "osgi.jndi.service.name";

/// Builder property: persistence unit name.
pub const UNIT_NAME: &str = "osgi.unit.name";

/// Builder property: version of the module owning the unit.
pub const UNIT_VERSION: &str = "osgi.unit.version";

/// Builder property: provider implementation serving the unit.
pub const UNIT_PROVIDER: &str = "osgi.unit.provider";

/// Identity of a registered service.
///
/// Ids are assigned by the registry, never reused, and increase with every
/// publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(u64);

impl ServiceId {
    /// Wrap a raw id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Str(String),
    List(Vec<String>),
}

impl PropertyValue {
    /// Returns true if the value equals `expected`, or contains it for lists.
    pub fn matches(&self, expected: &str) -> bool {
        match self {
            PropertyValue::Str(value) => value == expected,
            PropertyValue::List(values) => values.iter().any(|v| v == expected),
        }
    }

    /// The value as a single string. Lists yield their first element.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(value) => Some(value),
            PropertyValue::List(values) => values.first().map(String::as_str),
        }
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(values: Vec<String>) -> Self {
        PropertyValue::List(values)
    }
}

/// Metadata attached to a registered service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, PropertyValue>,
}

impl Properties {
    /// Create an empty property map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property, consuming and returning the map.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set a property, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Get a property value.
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.get(key)
    }

    /// Look up a property as a single string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(PropertyValue::as_str)
    }

    /// Check if a property is set.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_value_matches_any_element() {
        let value = PropertyValue::from(vec!["a".to_string(), "b".to_string()]);
        assert!(value.matches("b"));
        assert!(!value.matches("c"));
        assert_eq!(value.as_str(), Some("a"));
    }

    #[test]
    fn test_properties_builder() {
        let props = Properties::new()
            .with(UNIT_NAME, "orders")
            .with(UNIT_VERSION, "1.0.0");

        assert_eq!(props.len(), 2);
        assert_eq!(props.get_str(UNIT_NAME), Some("orders"));
        assert!(!props.contains(UNIT_PROVIDER));
    }
}
