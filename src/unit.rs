//! Persistence unit descriptor.
//!
//! A `PersistenceUnit` is owned by whoever parsed it. Trackers share it as a
//! [`SharedUnit`] and only touch the provider name and the two data source
//! slots. The mutex around it is the critical section every mutation goes
//! through.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::provider::DataSource;

/// A persistence unit shared between its owner and the trackers serving it.
pub type SharedUnit = Arc<Mutex<PersistenceUnit>>;

/// A deployed module (bundle) that owns services or persistence units.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Module {
    name: String,
    version: String,
}

impl Module {
    /// Create a module identity.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Symbolic name of the module.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version of the module.
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Bytecode transformer a provider registers to enhance entity classes.
///
/// Transformers must be in place before the first entity class of the unit
/// is loaded, which is why providers are probed as soon as they arrive.
pub trait ClassTransformer: Send + Sync + fmt::Debug {
    /// Transform a class definition. `None` leaves the class untouched.
    fn transform(&self, class_name: &str, class_bytes: &[u8]) -> Option<Vec<u8>>;
}

/// Configuration describing one persistence unit.
pub struct PersistenceUnit {
    unit_name: String,
    module: Module,
    provider_class_name: Option<String>,
    jta_data_source: Option<Arc<dyn DataSource>>,
    non_jta_data_source: Option<Arc<dyn DataSource>>,
    jta_data_source_name: Option<String>,
    transformers: Vec<Arc<dyn ClassTransformer>>,
}

impl PersistenceUnit {
    /// Create a unit with no provider pinned and no data sources.
    pub fn new(unit_name: impl Into<String>, module: Module) -> Self {
        Self {
            unit_name: unit_name.into(),
            module,
            provider_class_name: None,
            jta_data_source: None,
            non_jta_data_source: None,
            jta_data_source_name: None,
            transformers: Vec::new(),
        }
    }

    /// Pin the provider implementation this unit must be served by.
    pub fn with_provider(mut self, class_name: impl Into<String>) -> Self {
        self.provider_class_name = Some(class_name.into());
        self
    }

    /// Declare the JNDI name of the JTA data source the unit refers to.
    pub fn with_jta_data_source_name(mut self, name: impl Into<String>) -> Self {
        self.jta_data_source_name = Some(name.into());
        self
    }

    /// Wrap the unit for sharing with trackers.
    pub fn into_shared(self) -> SharedUnit {
        Arc::new(Mutex::new(self))
    }

    /// Name of the persistence unit.
    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    /// The module that declared this unit.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// The provider implementation the unit uses, pinned or recorded on arrival.
    pub fn provider_class_name(&self) -> Option<&str> {
        self.provider_class_name.as_deref()
    }

    /// Pin or record the provider implementation.
    pub fn set_provider_class_name(&mut self, class_name: Option<String>) {
        self.provider_class_name = class_name;
    }

    /// Data source used for JTA transactions.
    pub fn jta_data_source(&self) -> Option<&Arc<dyn DataSource>> {
        self.jta_data_source.as_ref()
    }

    pub fn set_jta_data_source(&mut self, data_source: Option<Arc<dyn DataSource>>) {
        self.jta_data_source = data_source;
    }

    /// Data source used outside JTA transactions.
    pub fn non_jta_data_source(&self) -> Option<&Arc<dyn DataSource>> {
        self.non_jta_data_source.as_ref()
    }

    pub fn set_non_jta_data_source(&mut self, data_source: Option<Arc<dyn DataSource>>) {
        self.non_jta_data_source = data_source;
    }

    /// JNDI name of the JTA data source from the unit descriptor.
    pub fn jta_data_source_name(&self) -> Option<&str> {
        self.jta_data_source_name.as_deref()
    }

    /// Register a class transformer. Called by providers while they build a factory.
    pub fn add_transformer(&mut self, transformer: Arc<dyn ClassTransformer>) {
        self.transformers.push(transformer);
    }

    /// Class transformers registered by providers.
    pub fn transformers(&self) -> &[Arc<dyn ClassTransformer>] {
        &self.transformers
    }
}

impl fmt::Debug for PersistenceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceUnit")
            .field("unit_name", &self.unit_name)
            .field("module", &self.module)
            .field("provider_class_name", &self.provider_class_name)
            .field("jta_data_source", &self.jta_data_source.as_ref().map(|d| d.name().to_string()))
            .field(
                "non_jta_data_source",
                &self.non_jta_data_source.as_ref().map(|d| d.name().to_string()),
            )
            .field("jta_data_source_name", &self.jta_data_source_name)
            .field("transformers", &self.transformers.len())
            .finish()
    }
}
