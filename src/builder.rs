//! Entity manager factory builder published for a persistence unit.
//!
//! The builder is the service applications look up once a matching provider
//! has arrived. It binds the provider to the unit and creates the real
//! factory once a data source is available.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{TrackerError, TrackerResult};
use crate::filter::{data_source_filter, Filter};
use crate::properties::{Properties, UNIT_NAME, UNIT_PROVIDER, UNIT_VERSION};
use crate::provider::{DataSource, EntityManagerFactory, PersistenceProvider};
use crate::unit::{Module, PersistenceUnit, SharedUnit};

/// Binds a persistence provider to a persistence unit.
pub struct EntityManagerFactoryBuilder {
    provider: Arc<dyn PersistenceProvider>,
    provider_module: Module,
    unit: SharedUnit,
    unit_name: String,
    factory: Mutex<Option<Arc<dyn EntityManagerFactory>>>,
    closed: AtomicBool,
}

impl EntityManagerFactoryBuilder {
    /// Create a builder for `unit` backed by `provider`, published by `provider_module`.
    pub fn new(
        provider: Arc<dyn PersistenceProvider>,
        provider_module: Module,
        unit: SharedUnit,
    ) -> Self {
        let unit_name = unit.lock().unit_name().to_string();
        Self {
            provider,
            provider_module,
            unit,
            unit_name,
            factory: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Properties the builder is published with.
    pub fn builder_properties(unit: &PersistenceUnit) -> Properties {
        let mut props = Properties::new()
            .with(UNIT_NAME, unit.unit_name())
            .with(UNIT_VERSION, unit.module().version());
        if let Some(provider) = unit.provider_class_name() {
            props.insert(UNIT_PROVIDER, provider);
        }
        props
    }

    /// Name of the persistence unit this builder serves.
    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    /// The module that published the provider.
    pub fn provider_module(&self) -> &Module {
        &self.provider_module
    }

    /// Filter selecting the data source service the unit refers to, if it names one.
    pub fn data_source_filter(&self) -> TrackerResult<Option<Filter>> {
        let unit = self.unit.lock();
        match unit.jta_data_source_name() {
            Some(name) => Ok(Some(data_source_filter(name, unit.unit_name())?)),
            None => Ok(None),
        }
    }

    /// Create the factory for the unit, or return the one created earlier.
    pub fn create_entity_manager_factory(
        &self,
        data_source: Arc<dyn DataSource>,
        extra: Option<&Properties>,
    ) -> TrackerResult<Arc<dyn EntityManagerFactory>> {
        if self.is_closed() {
            return Err(TrackerError::FactoryClosed(self.unit_name.clone()));
        }
        let mut factory = self.factory.lock();
        if let Some(existing) = factory.as_ref().filter(|f| f.is_open()) {
            return Ok(Arc::clone(existing));
        }

        let created = {
            let mut unit = self.unit.lock();
            unit.set_jta_data_source(Some(data_source));
            self.provider.create_container_factory(&mut unit, extra)?
        };
        info!(unit = %self.unit_name, provider = self.provider.name(), "entity manager factory created");
        *factory = Some(Arc::clone(&created));
        Ok(created)
    }

    /// The factory created earlier, if any.
    pub fn factory(&self) -> Option<Arc<dyn EntityManagerFactory>> {
        self.factory.lock().clone()
    }

    /// Release the builder and the factory it created. Later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(factory) = self.factory.lock().take() {
            if let Err(err) = factory.close() {
                debug!(unit = %self.unit_name, error = %err, "error closing entity manager factory");
            }
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for EntityManagerFactoryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManagerFactoryBuilder")
            .field("unit_name", &self.unit_name)
            .field("provider", &self.provider.name())
            .field("provider_module", &self.provider_module)
            .field("closed", &self.is_closed())
            .finish()
    }
}
