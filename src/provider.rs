//! Persistence provider SPI.
//!
//! Providers are published into the [`ServiceRegistry`](crate::ServiceRegistry)
//! as `Arc<dyn PersistenceProvider>` under the
//! [`PERSISTENCE_PROVIDER`](crate::properties::PERSISTENCE_PROVIDER) capability.
//! Everything a provider does with a unit goes through
//! [`PersistenceProvider::create_container_factory`].

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::ProviderResult;
use crate::properties::Properties;
use crate::unit::PersistenceUnit;

/// A persistence provider implementation.
///
/// # Example
///
/// ```rust
/// use persistence_tracker::{
///     EntityManagerFactory, PersistenceProvider, PersistenceUnit, Properties, ProviderResult,
/// };
/// use std::any::Any;
/// use std::sync::Arc;
///
/// #[derive(Debug)]
/// struct NullFactory;
///
/// impl EntityManagerFactory for NullFactory {
///     fn is_open(&self) -> bool { true }
///     fn close(&self) -> ProviderResult<()> { Ok(()) }
/// }
///
/// #[derive(Debug)]
/// struct NullProvider;
///
/// impl PersistenceProvider for NullProvider {
///     fn name(&self) -> &str { "null" }
///
///     fn create_container_factory(
///         &self,
///         _unit: &mut PersistenceUnit,
///         _extra: Option<&Properties>,
///     ) -> ProviderResult<Arc<dyn EntityManagerFactory>> {
///         Ok(Arc::new(NullFactory))
///     }
///
///     fn as_any(&self) -> &dyn Any { self }
/// }
/// ```
pub trait PersistenceProvider: Send + Sync + Debug {
    /// The implementation name the provider advertises.
    fn name(&self) -> &str;

    /// Build a container-managed factory for the unit.
    ///
    /// The provider may register class transformers on the unit while doing so.
    fn create_container_factory(
        &self,
        unit: &mut PersistenceUnit,
        extra: Option<&Properties>,
    ) -> ProviderResult<Arc<dyn EntityManagerFactory>>;

    /// Downcast to concrete type for advanced usage.
    fn as_any(&self) -> &dyn Any;
}

/// A factory built by a provider for one persistence unit.
pub trait EntityManagerFactory: Send + Sync + Debug {
    fn is_open(&self) -> bool;

    /// Release the factory. Closing twice is up to the implementation.
    fn close(&self) -> ProviderResult<()>;
}

/// Extension trait for provider type checking.
pub trait ProviderExt: PersistenceProvider {
    /// Check if this provider is of type T.
    fn is<T: PersistenceProvider + 'static>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Downcast to type T.
    fn downcast_ref<T: PersistenceProvider + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

impl<P: PersistenceProvider + ?Sized> ProviderExt for P {}

/// A connection handed out by a [`DataSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    source: String,
}

impl Connection {
    /// Create a connection to the named source.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Name of the data source the connection came from.
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// A source of database connections.
pub trait DataSource: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn connection(&self) -> ProviderResult<Connection>;
}

/// Data source that never fails and is never backed by a database.
///
/// Only used while probing a provider, before the real data source exists.
#[derive(Debug, Default, Clone)]
pub struct DummyDataSource;

impl DummyDataSource {
    pub const NAME: &'static str = "dummy";

    /// Create the dummy data source.
    pub fn new() -> Self {
        Self
    }
}

impl DataSource for DummyDataSource {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn connection(&self) -> ProviderResult<Connection> {
        Ok(Connection::new(Self::NAME))
    }
}
