//! Tracks persistence providers for one persistence unit.
//!
//! When a matching provider arrives the tracker
//! 1. records the provider name on the unit unless the unit pinned one,
//! 2. probes the provider with a throwaway factory built on a dummy data
//!    source, so it can register its class transformers before any entity
//!    class is loaded,
//! 3. publishes an [`EntityManagerFactoryBuilder`] for the unit.
//!
//! When the provider goes away the builder is unregistered and closed.

use std::sync::Arc;

use tracing::{debug, info, info_span, Span};

use crate::builder::EntityManagerFactoryBuilder;
use crate::config::{Config, TrackerConfig};
use crate::error::{Outcome, RegistryResult, TrackerError, TrackerResult};
use crate::filter::{provider_filter, Filter};
use crate::properties::{ServiceId, FACTORY_BUILDER, PERSISTENCE_PROVIDER_NAME};
use crate::provider::{DataSource, DummyDataSource, PersistenceProvider};
use crate::registry::{Registration, ServiceReference, ServiceRegistry};
use crate::tracker::{ServiceTracker, TrackerCustomizer};
use crate::unit::{PersistenceUnit, SharedUnit};

/// State kept for every provider the tracker serves the unit with.
#[derive(Debug)]
pub struct TrackedProvider {
    builder: Arc<EntityManagerFactoryBuilder>,
    registration: Registration,
}

impl TrackedProvider {
    /// The builder published for the provider.
    pub fn builder(&self) -> &Arc<EntityManagerFactoryBuilder> {
        &self.builder
    }

    /// Id of the published builder service.
    pub fn builder_id(&self) -> ServiceId {
        self.registration.id()
    }
}

/// Arrival and departure handling for persistence providers.
pub struct ProviderHandler {
    registry: ServiceRegistry,
    unit: SharedUnit,
    config: TrackerConfig,
    span: Span,
}

impl ProviderHandler {
    /// Create a handler for `unit`. The span is named after the tracker and the unit.
    pub fn new(registry: ServiceRegistry, unit: SharedUnit, config: TrackerConfig) -> Self {
        let span = {
            let unit = unit.lock();
            info_span!("provider_tracker", tracker = %config.name, unit = %unit.unit_name())
        };
        Self {
            registry,
            unit,
            config,
            span,
        }
    }

    /// The persistence unit the handler serves.
    pub fn unit(&self) -> &SharedUnit {
        &self.unit
    }

    /// Build and discard a factory so the provider can register its
    /// transformers with the unit.
    ///
    /// The unit is locked for the whole probe. Both data source slots carry a
    /// [`DummyDataSource`] while the provider runs and are unset afterwards,
    /// whatever the provider did.
    pub fn probe(&self, provider: &dyn PersistenceProvider) -> Outcome {
        let mut scope = ProbeScope::enter(&self.unit);
        let result = provider
            .create_container_factory(scope.unit(), None)
            .and_then(|factory| factory.close());
        drop(scope);

        match result {
            Ok(()) => Outcome::clean(),
            Err(err) => {
                debug!(
                    provider = provider.name(),
                    error = %err,
                    "error while creating the dummy entity manager factory to allow weaving"
                );
                Outcome::degraded(err)
            }
        }
    }

    fn publish_builder(
        &self,
        provider: Arc<dyn PersistenceProvider>,
        reference: &ServiceReference,
    ) -> RegistryResult<TrackedProvider> {
        let builder = Arc::new(EntityManagerFactoryBuilder::new(
            provider,
            reference.module().clone(),
            Arc::clone(&self.unit),
        ));
        let (props, owner) = {
            let unit = self.unit.lock();
            (
                EntityManagerFactoryBuilder::builder_properties(&unit),
                unit.module().clone(),
            )
        };
        match self
            .registry
            .publish(FACTORY_BUILDER, Arc::clone(&builder), props, owner)
        {
            Ok(registration) => Ok(TrackedProvider {
                builder,
                registration,
            }),
            Err(err) => {
                builder.close();
                Err(err)
            }
        }
    }
}

impl TrackerCustomizer for ProviderHandler {
    type Entry = TrackedProvider;

    fn on_arrive(&self, reference: &ServiceReference) -> TrackerResult<TrackedProvider> {
        let _entered = self.span.enter();

        let advertised = reference.property(PERSISTENCE_PROVIDER_NAME).map(str::to_string);
        {
            let mut unit = self.unit.lock();
            // TODO: record the name only after the probe succeeded
            if unit.provider_class_name().is_none() {
                unit.set_provider_class_name(advertised);
            }
            if self.config.is_verbose() {
                info!(
                    service_id = %reference.id(),
                    provider = unit.provider_class_name().unwrap_or("<unnamed>"),
                    "found provider"
                );
            }
        }

        let provider: Arc<dyn PersistenceProvider> = self.registry.get_service(reference)?;
        if self.config.weaving_probe {
            // already logged by probe, publication goes ahead regardless
            drop(self.probe(provider.as_ref()));
        }

        Ok(self.publish_builder(provider, reference)?)
    }

    fn on_remove(&self, reference: &ServiceReference, entry: TrackedProvider) -> Outcome {
        let _entered = self.span.enter();
        if self.config.is_verbose() {
            let unit = self.unit.lock();
            info!(
                service_id = %reference.id(),
                provider = unit.provider_class_name().unwrap_or("<unnamed>"),
                "lost provider"
            );
        }

        let TrackedProvider {
            builder,
            registration,
        } = entry;
        let outcome = match registration.unregister() {
            Ok(()) => Outcome::clean(),
            Err(err) => {
                debug!(
                    unit = builder.unit_name(),
                    error = %err,
                    "an error occurred unregistering the factory builder"
                );
                Outcome::degraded(err)
            }
        };
        builder.close();
        outcome
    }
}

/// Critical section of a probe: holds the unit lock and resets the data
/// source slots when dropped.
struct ProbeScope<'a> {
    unit: parking_lot::MutexGuard<'a, PersistenceUnit>,
}

impl<'a> ProbeScope<'a> {
    fn enter(unit: &'a SharedUnit) -> Self {
        let mut unit = unit.lock();
        let dummy: Arc<dyn DataSource> = Arc::new(DummyDataSource::new());
        unit.set_jta_data_source(Some(Arc::clone(&dummy)));
        unit.set_non_jta_data_source(Some(dummy));
        Self { unit }
    }

    fn unit(&mut self) -> &mut PersistenceUnit {
        &mut self.unit
    }
}

impl Drop for ProbeScope<'_> {
    fn drop(&mut self) {
        self.unit.set_jta_data_source(None);
        self.unit.set_non_jta_data_source(None);
    }
}

/// Watches a registry for providers able to serve a persistence unit and
/// publishes a factory builder for each one.
///
/// # Example
///
/// ```rust
/// use persistence_tracker::{Module, PersistenceUnit, ProviderTracker, ServiceRegistry, TrackerConfig};
///
/// let registry = ServiceRegistry::new();
/// let unit = PersistenceUnit::new("orders", Module::new("shop", "1.0.0")).into_shared();
///
/// let tracker = ProviderTracker::new(registry.clone(), unit, TrackerConfig::default()).unwrap();
/// tracker.open().unwrap();
/// assert!(tracker.is_empty());
/// tracker.close();
/// ```
pub struct ProviderTracker {
    tracker: ServiceTracker<ProviderHandler>,
}

impl ProviderTracker {
    /// Create a tracker for the unit. Nothing is tracked until [`open`](Self::open).
    ///
    /// Fails if the configuration is invalid, or if the unit has a blank name
    /// or pins a blank provider name.
    pub fn new(
        registry: ServiceRegistry,
        unit: SharedUnit,
        config: TrackerConfig,
    ) -> TrackerResult<Self> {
        config.validate().map_err(TrackerError::Configuration)?;
        let filter = {
            let guard = unit.lock();
            validate_unit(&guard)?;
            provider_filter(&guard)
        };
        let handler = ProviderHandler::new(registry.clone(), unit, config);
        Ok(Self {
            tracker: ServiceTracker::new(registry, filter, handler),
        })
    }

    /// Replace the span every callback logs under.
    ///
    /// Has no effect once the tracker is open.
    pub fn with_span(mut self, span: Span) -> Self {
        if let Some(handler) = self.tracker.customizer_mut() {
            handler.span = span;
        }
        self
    }

    /// The filter selecting providers for the unit.
    pub fn filter(&self) -> &Filter {
        self.tracker.filter()
    }

    /// The persistence unit the tracker serves.
    pub fn unit(&self) -> &SharedUnit {
        self.tracker.customizer().unit()
    }

    /// Start tracking. Providers already present are handled before this returns.
    pub fn open(&self) -> RegistryResult<()> {
        self.tracker.open()
    }

    /// Stop tracking and withdraw every published builder.
    pub fn close(&self) {
        self.tracker.close();
    }

    /// Whether the tracker is subscribed to the registry.
    pub fn is_open(&self) -> bool {
        self.tracker.is_open()
    }

    /// Ids of the provider services currently served.
    pub fn tracked_providers(&self) -> Vec<ServiceId> {
        self.tracker.tracked_ids()
    }

    /// Number of providers currently served.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// The arrival callback, for hosts that deliver provider events themselves.
    pub fn on_arrive(&self, reference: &ServiceReference) {
        self.tracker.arrive(reference);
    }

    /// The departure callback. Unknown providers are ignored.
    pub fn on_remove(&self, reference: &ServiceReference) {
        self.tracker.depart(reference);
    }
}

fn validate_unit(unit: &PersistenceUnit) -> TrackerResult<()> {
    if unit.unit_name().trim().is_empty() {
        return Err(TrackerError::Configuration(
            "persistence unit name must not be blank".to_string(),
        ));
    }
    if let Some(name) = unit.provider_class_name() {
        if name.trim().is_empty() {
            return Err(TrackerError::Configuration(format!(
                "persistence unit {} pins a blank provider name",
                unit.unit_name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProviderError, ProviderResult, RegistryError};
    use crate::properties::{Properties, UNIT_NAME, UNIT_PROVIDER, PERSISTENCE_PROVIDER};
    use crate::provider::EntityManagerFactory;
    use crate::unit::{ClassTransformer, Module};
    use parking_lot::Mutex;
    use std::any::Any;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Enhancer;

    impl ClassTransformer for Enhancer {
        fn transform(&self, _class_name: &str, class_bytes: &[u8]) -> Option<Vec<u8>> {
            Some(class_bytes.to_vec())
        }
    }

    #[derive(Debug, Default)]
    struct Factory {
        closed: AtomicBool,
        fail_close: bool,
    }

    impl EntityManagerFactory for Factory {
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) -> ProviderResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            if self.fail_close {
                return Err(ProviderError::CloseFailed("connection pool stuck".to_string()));
            }
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct WeavingProvider {
        fail: bool,
        fail_close: bool,
        probes: AtomicUsize,
        seen_data_sources: Mutex<Vec<String>>,
    }

    impl PersistenceProvider for WeavingProvider {
        fn name(&self) -> &str {
            "weaving"
        }

        fn create_container_factory(
            &self,
            unit: &mut PersistenceUnit,
            _extra: Option<&Properties>,
        ) -> ProviderResult<Arc<dyn EntityManagerFactory>> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            for data_source in [unit.jta_data_source(), unit.non_jta_data_source()]
                .into_iter()
                .flatten()
            {
                self.seen_data_sources
                    .lock()
                    .push(data_source.name().to_string());
            }
            unit.add_transformer(Arc::new(Enhancer));
            if self.fail {
                return Err(ProviderError::CreationFailed("broken mapping".to_string()));
            }
            Ok(Arc::new(Factory {
                fail_close: self.fail_close,
                ..Factory::default()
            }))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn handler(registry: &ServiceRegistry, unit: PersistenceUnit) -> ProviderHandler {
        ProviderHandler::new(registry.clone(), unit.into_shared(), TrackerConfig::default())
    }

    fn publish_provider(
        registry: &ServiceRegistry,
        provider: Arc<WeavingProvider>,
        name: &str,
    ) -> Registration {
        let provider: Arc<dyn PersistenceProvider> = provider;
        registry
            .publish(
                PERSISTENCE_PROVIDER,
                provider,
                Properties::new().with(PERSISTENCE_PROVIDER_NAME, name),
                Module::new("provider-bundle", "2.7.0"),
            )
            .unwrap()
    }

    #[test]
    fn test_probe_registers_transformers_and_restores_unit() {
        let registry = ServiceRegistry::new();
        let handler = handler(&registry, PersistenceUnit::new("orders", Module::new("shop", "1.0")));
        let provider = WeavingProvider::default();

        let outcome = handler.probe(&provider);

        assert!(outcome.is_clean());
        assert_eq!(
            *provider.seen_data_sources.lock(),
            vec![DummyDataSource::NAME, DummyDataSource::NAME]
        );
        let unit = handler.unit().lock();
        assert_eq!(unit.transformers().len(), 1);
        assert!(unit.jta_data_source().is_none());
        assert!(unit.non_jta_data_source().is_none());
    }

    #[test]
    fn test_failed_probe_is_degraded_and_restores_unit() {
        let registry = ServiceRegistry::new();
        let handler = handler(&registry, PersistenceUnit::new("orders", Module::new("shop", "1.0")));
        let provider = WeavingProvider {
            fail: true,
            ..WeavingProvider::default()
        };

        let outcome = handler.probe(&provider);

        assert!(matches!(
            outcome.diagnostic(),
            Some(TrackerError::Provider(ProviderError::CreationFailed(_)))
        ));
        let unit = handler.unit().lock();
        assert!(unit.jta_data_source().is_none());
        assert!(unit.non_jta_data_source().is_none());
    }

    #[test]
    fn test_weaving_factory_close_fault_does_not_block_publication() {
        let registry = ServiceRegistry::new();
        let handler = handler(&registry, PersistenceUnit::new("orders", Module::new("shop", "1.0")));
        let provider = Arc::new(WeavingProvider {
            fail_close: true,
            ..WeavingProvider::default()
        });

        let outcome = handler.probe(provider.as_ref());

        assert!(matches!(
            outcome.diagnostic(),
            Some(TrackerError::Provider(ProviderError::CloseFailed(_)))
        ));
        {
            let unit = handler.unit().lock();
            assert_eq!(unit.transformers().len(), 1);
            assert!(unit.jta_data_source().is_none());
            assert!(unit.non_jta_data_source().is_none());
        }

        let registration = publish_provider(&registry, provider.clone(), "EclipseLink");
        let entry = handler.on_arrive(&registration.reference().unwrap()).unwrap();

        assert_eq!(provider.probes.load(Ordering::SeqCst), 2);
        assert!(registry.get_reference(entry.builder_id()).is_some());
        let unit = handler.unit().lock();
        assert!(unit.jta_data_source().is_none());
        assert!(unit.non_jta_data_source().is_none());
    }

    #[test]
    fn test_arrival_backfills_name_and_publishes_builder() {
        let registry = ServiceRegistry::new();
        let handler = handler(&registry, PersistenceUnit::new("orders", Module::new("shop", "1.4.0")));
        let registration = publish_provider(&registry, Arc::new(WeavingProvider::default()), "EclipseLink");

        let entry = handler.on_arrive(&registration.reference().unwrap()).unwrap();

        assert_eq!(handler.unit().lock().provider_class_name(), Some("EclipseLink"));
        let builder_ref = registry.get_reference(entry.builder_id()).unwrap();
        assert_eq!(builder_ref.property(UNIT_NAME), Some("orders"));
        assert_eq!(builder_ref.property(UNIT_PROVIDER), Some("EclipseLink"));
        assert_eq!(builder_ref.module().name(), "shop");
        assert_eq!(entry.builder().provider_module().name(), "provider-bundle");

        let published: Arc<EntityManagerFactoryBuilder> = registry.get_service(&builder_ref).unwrap();
        assert!(Arc::ptr_eq(&published, entry.builder()));
    }

    #[test]
    fn test_arrival_keeps_pinned_name() {
        let registry = ServiceRegistry::new();
        let handler = handler(
            &registry,
            PersistenceUnit::new("orders", Module::new("shop", "1.0")).with_provider("Hibernate"),
        );
        let registration = publish_provider(&registry, Arc::new(WeavingProvider::default()), "EclipseLink");

        handler.on_arrive(&registration.reference().unwrap()).unwrap();

        assert_eq!(handler.unit().lock().provider_class_name(), Some("Hibernate"));
    }

    #[test]
    fn test_arrival_without_probe() {
        let registry = ServiceRegistry::new();
        let handler = ProviderHandler::new(
            registry.clone(),
            PersistenceUnit::new("orders", Module::new("shop", "1.0")).into_shared(),
            TrackerConfig::new().without_probe(),
        );
        let provider = Arc::new(WeavingProvider::default());
        let registration = publish_provider(&registry, provider.clone(), "EclipseLink");

        handler.on_arrive(&registration.reference().unwrap()).unwrap();

        assert_eq!(provider.probes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_arrival_fails_for_vanished_provider() {
        let registry = ServiceRegistry::new();
        let handler = handler(&registry, PersistenceUnit::new("orders", Module::new("shop", "1.0")));
        let registration = publish_provider(&registry, Arc::new(WeavingProvider::default()), "EclipseLink");
        let reference = registration.reference().unwrap();
        registration.unregister().unwrap();

        let result = handler.on_arrive(&reference);

        assert!(matches!(
            result,
            Err(TrackerError::Registry(RegistryError::ServiceUnavailable(_)))
        ));
    }

    #[test]
    fn test_removal_survives_unregistration_fault() {
        let registry = ServiceRegistry::new();
        let handler = handler(&registry, PersistenceUnit::new("orders", Module::new("shop", "1.0")));
        let registration = publish_provider(&registry, Arc::new(WeavingProvider::default()), "EclipseLink");
        let reference = registration.reference().unwrap();
        let entry = handler.on_arrive(&reference).unwrap();
        let builder = Arc::clone(entry.builder());
        registry.unregister_service(entry.builder_id()).unwrap();

        let outcome = handler.on_remove(&reference, entry);

        assert!(matches!(
            outcome.diagnostic(),
            Some(TrackerError::Registry(RegistryError::AlreadyUnregistered(_)))
        ));
        assert!(builder.is_closed());
    }

    #[test]
    fn test_new_rejects_blank_names() {
        let registry = ServiceRegistry::new();
        let blank_unit = PersistenceUnit::new(" ", Module::new("shop", "1.0")).into_shared();
        assert!(matches!(
            ProviderTracker::new(registry.clone(), blank_unit, TrackerConfig::default()),
            Err(TrackerError::Configuration(_))
        ));

        let blank_provider = PersistenceUnit::new("orders", Module::new("shop", "1.0"))
            .with_provider("")
            .into_shared();
        assert!(matches!(
            ProviderTracker::new(registry, blank_provider, TrackerConfig::default()),
            Err(TrackerError::Configuration(_))
        ));
    }

    #[test]
    fn test_with_span_before_open() {
        let registry = ServiceRegistry::new();
        let unit = PersistenceUnit::new("orders", Module::new("shop", "1.0")).into_shared();
        let tracker = ProviderTracker::new(registry, unit, TrackerConfig::default())
            .unwrap()
            .with_span(tracing::info_span!("custom"));
        tracker.open().unwrap();
        assert!(tracker.is_open());
    }
}
