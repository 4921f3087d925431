//! Prelude module for convenient imports.
//!
//! # Example
//!
//! ```rust
//! use persistence_tracker::prelude::*;
//! ```

// Configuration
pub use crate::config::{Config, RegistryConfig, TrackerConfig};

// Provider SPI
pub use crate::provider::{
    DataSource, DummyDataSource, EntityManagerFactory, PersistenceProvider, ProviderExt,
};
pub use crate::unit::{ClassTransformer, Module, PersistenceUnit, SharedUnit};

// Registry
pub use crate::filter::Filter;
pub use crate::properties::{
    Properties, ServiceId, FACTORY_BUILDER, PERSISTENCE_PROVIDER, PERSISTENCE_PROVIDER_NAME,
};
pub use crate::registry::{Registration, ServiceEvent, ServiceReference, ServiceRegistry};

// Tracking
pub use crate::builder::EntityManagerFactoryBuilder;
pub use crate::provider_tracker::ProviderTracker;
pub use crate::tracker::{ServiceTracker, TrackerCustomizer};

// Errors
pub use crate::error::{
    Outcome, ProviderError, ProviderResult, RegistryError, RegistryResult, TrackerError,
    TrackerResult,
};
