//! In-process service registry.
//!
//! Services are published under a capability name together with metadata
//! properties. Listeners subscribe with a [`Filter`] and are told about
//! every service that starts or stops matching it.
//!
//! Events are dispatched synchronously on the thread that caused the change.
//! No registry lock is held while listeners run, so a listener may publish
//! or unregister services itself. Changes to different services may be
//! dispatched concurrently from different threads.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::{Config, RegistryConfig};
use crate::error::{RegistryError, RegistryResult, TrackerError, TrackerResult};
use crate::filter::Filter;
use crate::properties::{Properties, PropertyValue, ServiceId, OBJECT_CLASS, SERVICE_ID};
use crate::stream::{self, EventStream};
use crate::unit::Module;

/// Handle to a registered service and its metadata.
///
/// References compare and hash by service id only.
#[derive(Debug, Clone)]
pub struct ServiceReference {
    id: ServiceId,
    properties: Arc<Properties>,
    module: Module,
}

impl ServiceReference {
    /// The id the registry assigned to the service.
    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// The properties the service was published with.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Look up a single property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get_str(key)
    }

    /// The module that published the service.
    pub fn module(&self) -> &Module {
        &self.module
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceReference {}

impl std::hash::Hash for ServiceReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A change to a service, as seen through a listener's filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A matching service was published.
    Registered(ServiceReference),
    /// A matching service changed its properties and still matches.
    Modified(ServiceReference),
    /// A service changed its properties and no longer matches.
    ModifiedEndMatch(ServiceReference),
    /// A matching service was withdrawn. Lookups no longer find it.
    Unregistering(ServiceReference),
}

impl ServiceEvent {
    /// The reference the event is about.
    pub fn reference(&self) -> &ServiceReference {
        match self {
            ServiceEvent::Registered(r)
            | ServiceEvent::Modified(r)
            | ServiceEvent::ModifiedEndMatch(r)
            | ServiceEvent::Unregistering(r) => r,
        }
    }

    /// Returns true if the service matches the listener's filter after the event.
    pub fn is_match(&self) -> bool {
        matches!(self, ServiceEvent::Registered(_) | ServiceEvent::Modified(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            ServiceEvent::Registered(_) => "registered",
            ServiceEvent::Modified(_) => "modified",
            ServiceEvent::ModifiedEndMatch(_) => "modified_end_match",
            ServiceEvent::Unregistering(_) => "unregistering",
        }
    }
}

/// Receives registry changes for services matching a filter.
pub trait ServiceListener: Send + Sync {
    fn service_changed(&self, event: &ServiceEvent);
}

struct ServiceEntry {
    reference: ServiceReference,
    service: Arc<dyn Any + Send + Sync>,
}

struct ListenerEntry {
    id: u64,
    filter: Filter,
    listener: Arc<dyn ServiceListener>,
}

struct RegistryInner {
    config: RegistryConfig,
    next_service_id: AtomicU64,
    next_listener_id: AtomicU64,
    services: DashMap<ServiceId, ServiceEntry>,
    listeners: RwLock<Vec<ListenerEntry>>,
    closed: AtomicBool,
}

impl RegistryInner {
    fn unregister(&self, id: ServiceId) -> RegistryResult<()> {
        let (_, entry) = self
            .services
            .remove(&id)
            .ok_or(RegistryError::AlreadyUnregistered(id))?;
        debug!(registry = %self.config.name, service_id = %id, "service unregistered");
        self.dispatch(ServiceEvent::Unregistering(entry.reference), None);
        Ok(())
    }

    fn set_properties(&self, id: ServiceId, properties: Properties) -> RegistryResult<()> {
        let (previous, reference) = {
            let mut entry = self
                .services
                .get_mut(&id)
                .ok_or(RegistryError::AlreadyUnregistered(id))?;
            let mut properties = properties;
            for key in [OBJECT_CLASS, SERVICE_ID] {
                if let Some(value) = entry.reference.properties.get(key) {
                    properties.insert(key, value.clone());
                }
            }
            let previous = Arc::clone(&entry.reference.properties);
            entry.reference.properties = Arc::new(properties);
            (previous, entry.reference.clone())
        };
        self.dispatch(ServiceEvent::Modified(reference), Some(&previous));
        Ok(())
    }

    /// Deliver an event to every listener whose filter it concerns.
    ///
    /// `previous` carries the properties before a modification.
    fn dispatch(&self, event: ServiceEvent, previous: Option<&Properties>) {
        let targets: Vec<(Arc<dyn ServiceListener>, ServiceEvent)> = {
            let listeners = self.listeners.read();
            listeners
                .iter()
                .filter_map(|entry| {
                    let matches_now = entry.filter.matches(event.reference().properties());
                    let delivered = match (&event, previous) {
                        (ServiceEvent::Modified(reference), Some(previous)) => {
                            if matches_now {
                                Some(event.clone())
                            } else if entry.filter.matches(previous) {
                                Some(ServiceEvent::ModifiedEndMatch(reference.clone()))
                            } else {
                                None
                            }
                        }
                        _ if matches_now => Some(event.clone()),
                        _ => None,
                    };
                    delivered.map(|e| (Arc::clone(&entry.listener), e))
                })
                .collect()
        };

        for (listener, event) in targets {
            if self.config.debug {
                debug!(
                    registry = %self.config.name,
                    service_id = %event.reference().id(),
                    kind = event.kind(),
                    "dispatching service event"
                );
            }
            listener.service_changed(&event);
        }
    }

    fn unsubscribe(&self, listener_id: u64) {
        self.listeners.write().retain(|entry| entry.id != listener_id);
    }
}

/// Thread-safe registry of published services.
///
/// Cloning yields another handle to the same registry.
///
/// # Example
///
/// ```rust
/// use persistence_tracker::{Filter, Module, Properties, ServiceRegistry};
///
/// let registry = ServiceRegistry::new();
/// let registration = registry
///     .publish("greeting", "hello".to_string(), Properties::new(), Module::new("app", "1.0.0"))
///     .unwrap();
///
/// let references = registry.get_references(&Filter::capability("greeting"));
/// assert_eq!(references.len(), 1);
/// assert_eq!(registry.get_service::<String>(&references[0]).unwrap(), "hello");
///
/// registration.unregister().unwrap();
/// assert!(registry.is_empty());
/// ```
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    /// Create a registry with the default configuration.
    pub fn new() -> Self {
        Self::from_config(RegistryConfig::default())
    }

    /// Create a registry, rejecting invalid configuration.
    pub fn with_config(config: RegistryConfig) -> TrackerResult<Self> {
        config.validate().map_err(TrackerError::Configuration)?;
        Ok(Self::from_config(config))
    }

    fn from_config(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                next_service_id: AtomicU64::new(1),
                next_listener_id: AtomicU64::new(1),
                services: DashMap::new(),
                listeners: RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Get the registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Publish a service under a capability.
    ///
    /// The `objectClass` and `service.id` properties are set by the registry.
    /// Listeners are notified before this returns.
    pub fn publish<T>(
        &self,
        capability: &str,
        service: T,
        properties: Properties,
        module: Module,
    ) -> RegistryResult<Registration>
    where
        T: Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(RegistryError::Closed);
        }
        if capability.trim().is_empty() {
            return Err(RegistryError::InvalidCapability(capability.to_string()));
        }

        let id = ServiceId::new(self.inner.next_service_id.fetch_add(1, Ordering::SeqCst));
        let mut properties = properties;
        properties.insert(
            OBJECT_CLASS,
            PropertyValue::List(vec![capability.to_string()]),
        );
        properties.insert(SERVICE_ID, id.to_string());

        let reference = ServiceReference {
            id,
            properties: Arc::new(properties),
            module,
        };
        self.inner.services.insert(
            id,
            ServiceEntry {
                reference: reference.clone(),
                service: Arc::new(service),
            },
        );
        if self.is_closed() {
            self.inner.services.remove(&id);
            return Err(RegistryError::Closed);
        }

        debug!(registry = %self.inner.config.name, service_id = %id, capability, "service published");
        self.inner.dispatch(ServiceEvent::Registered(reference), None);

        Ok(Registration {
            id,
            registry: Arc::downgrade(&self.inner),
        })
    }

    /// Subscribe a listener to services matching `filter`.
    ///
    /// The listener stays subscribed until the returned handle is dropped or
    /// cancelled.
    pub fn subscribe(
        &self,
        filter: Filter,
        listener: Arc<dyn ServiceListener>,
    ) -> RegistryResult<Subscription> {
        self.subscribe_with_snapshot(filter, listener)
            .map(|(subscription, _)| subscription)
    }

    /// Subscribe a listener and return the services that already match.
    ///
    /// Services published after the snapshot are delivered to the listener,
    /// so nothing falls between the snapshot and the subscription. A service
    /// published concurrently may show up in both.
    pub fn subscribe_with_snapshot(
        &self,
        filter: Filter,
        listener: Arc<dyn ServiceListener>,
    ) -> RegistryResult<(Subscription, Vec<ServiceReference>)> {
        if self.is_closed() {
            return Err(RegistryError::Closed);
        }
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let snapshot = {
            let mut listeners = self.inner.listeners.write();
            let snapshot = self.get_references(&filter);
            listeners.push(ListenerEntry {
                id,
                filter,
                listener,
            });
            snapshot
        };
        Ok((
            Subscription {
                id,
                registry: Arc::downgrade(&self.inner),
            },
            snapshot,
        ))
    }

    /// Stream every change to services matching `filter`.
    ///
    /// The stream ends when it is dropped. Events are discarded with a warning
    /// while the consumer lags more than `event_buffer` events behind.
    pub fn watch(&self, filter: Filter) -> RegistryResult<EventStream<ServiceEvent>> {
        let (sender, events) = stream::channel(self.inner.config.event_buffer);
        let listener = Arc::new(stream::ChannelListener::new(
            self.inner.config.name.clone(),
            sender,
        ));
        let subscription = self.subscribe(filter, listener)?;
        Ok(stream::watch_stream(events, subscription))
    }

    /// All services matching `filter`, in publication order.
    pub fn get_references(&self, filter: &Filter) -> Vec<ServiceReference> {
        let mut references: Vec<ServiceReference> = self
            .inner
            .services
            .iter()
            .filter(|entry| filter.matches(entry.reference.properties()))
            .map(|entry| entry.reference.clone())
            .collect();
        references.sort_by_key(ServiceReference::id);
        references
    }

    /// Look up a published service by id.
    pub fn get_reference(&self, id: ServiceId) -> Option<ServiceReference> {
        self.inner.services.get(&id).map(|e| e.reference.clone())
    }

    /// Obtain the service behind a reference.
    ///
    /// Fails if the service is gone or was published with a different type.
    pub fn get_service<T>(&self, reference: &ServiceReference) -> RegistryResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = reference.id();
        let service = self
            .inner
            .services
            .get(&id)
            .map(|entry| Arc::clone(&entry.service))
            .ok_or(RegistryError::ServiceUnavailable(id))?;
        service
            .downcast_ref::<T>()
            .cloned()
            .ok_or(RegistryError::ServiceUnavailable(id))
    }

    /// Withdraw any service, whoever published it.
    pub fn unregister_service(&self, id: ServiceId) -> RegistryResult<()> {
        self.inner.unregister(id)
    }

    /// Withdraw every service, most recent first, and refuse new ones.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut ids: Vec<ServiceId> = self.inner.services.iter().map(|e| *e.key()).collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        for id in ids {
            // a departing tracker may already have withdrawn its own services
            let _ = self.inner.unregister(id);
        }
        debug!(registry = %self.inner.config.name, "registry shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of published services.
    pub fn len(&self) -> usize {
        self.inner.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.services.is_empty()
    }

    /// Number of active subscriptions.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("name", &self.inner.config.name)
            .field("services", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Handle to a published service.
pub struct Registration {
    id: ServiceId,
    registry: Weak<RegistryInner>,
}

impl Registration {
    /// The id of the published service.
    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// The current reference, while the service is registered.
    pub fn reference(&self) -> RegistryResult<ServiceReference> {
        let registry = self.registry.upgrade().ok_or(RegistryError::Closed)?;
        registry
            .services
            .get(&self.id)
            .map(|e| e.reference.clone())
            .ok_or(RegistryError::AlreadyUnregistered(self.id))
    }

    /// Replace the service properties. `objectClass` and `service.id` are kept.
    pub fn set_properties(&self, properties: Properties) -> RegistryResult<()> {
        let registry = self.registry.upgrade().ok_or(RegistryError::Closed)?;
        registry.set_properties(self.id, properties)
    }

    /// Withdraw the service.
    ///
    /// Fails if the service was already withdrawn, by this handle or anyone else.
    pub fn unregister(&self) -> RegistryResult<()> {
        let registry = self.registry.upgrade().ok_or(RegistryError::Closed)?;
        registry.unregister(self.id)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

/// Keeps a listener subscribed. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    registry: Weak<RegistryInner>,
}

impl Subscription {
    /// Unsubscribe now.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
