//! # Persistence Tracker
//!
//! Serves a persistence unit with whichever persistence provider shows up in
//! a service registry.
//!
//! ## Overview
//!
//! A [`ProviderTracker`] watches a [`ServiceRegistry`] for persistence
//! providers matching a [`PersistenceUnit`]:
//! - a unit that pins a provider name only accepts that provider,
//! - otherwise any persistence provider is accepted and its name is
//!   recorded on the unit.
//!
//! On arrival the provider is probed once with a throwaway factory so it can
//! register its class transformers early, then an
//! [`EntityManagerFactoryBuilder`] is published for the unit. On departure
//! the builder is unregistered and closed.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use persistence_tracker::prelude::*;
//!
//! let registry = ServiceRegistry::new();
//! let unit = PersistenceUnit::new("orders", Module::new("shop", "1.0.0")).into_shared();
//!
//! let tracker = ProviderTracker::new(registry.clone(), unit, TrackerConfig::default())?;
//! tracker.open()?;
//!
//! // a provider module publishes its implementation
//! let provider: Arc<dyn PersistenceProvider> = Arc::new(MyProvider::new());
//! registry.publish(
//!     PERSISTENCE_PROVIDER,
//!     provider,
//!     Properties::new().with(PERSISTENCE_PROVIDER_NAME, "EclipseLink"),
//!     Module::new("eclipselink", "2.7.0"),
//! )?;
//!
//! // a builder for "orders" is now registered
//! let builders = registry.get_references(&Filter::capability(FACTORY_BUILDER));
//! ```

mod builder;
mod config;
mod error;
mod filter;
mod provider;
mod provider_tracker;
mod registry;
mod tracker;
mod unit;

pub mod prelude;
pub mod properties;
pub mod stream;

pub use builder::EntityManagerFactoryBuilder;
pub use config::{Config, RegistryConfig, TrackerConfig};
pub use error::{
    FilterError, FilterResult, Outcome, ProviderError, ProviderResult, RegistryError,
    RegistryResult, TrackerError, TrackerResult,
};
pub use filter::{data_source_filter, provider_filter, Filter};
pub use properties::{Properties, PropertyValue, ServiceId};
pub use provider::{
    Connection, DataSource, DummyDataSource, EntityManagerFactory, PersistenceProvider,
    ProviderExt,
};
pub use provider_tracker::{ProviderHandler, ProviderTracker, TrackedProvider};
pub use registry::{
    Registration, ServiceEvent, ServiceListener, ServiceReference, ServiceRegistry, Subscription,
};
pub use stream::{EventSender, EventStream};
pub use tracker::{ServiceTracker, TrackerCustomizer};
pub use unit::{ClassTransformer, Module, PersistenceUnit, SharedUnit};
