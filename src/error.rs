//! Error types for the persistence tracker.

use thiserror::Error;

use crate::properties::ServiceId;

/// Root error type for tracker operations.
#[derive(Error, Debug, Clone)]
pub enum TrackerError {
    /// Provider-related errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Registry-related errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Filter-related errors
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    /// The tracker or registry was configured with unusable values
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A factory builder was used after it had been closed
    #[error("Factory builder for unit {0} is closed")]
    FactoryClosed(String),
}

/// Errors raised by persistence provider implementations.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// The provider could not build an entity manager factory
    #[error("Factory creation failed: {0}")]
    CreationFailed(String),

    /// The provider failed while tearing a factory down
    #[error("Factory close failed: {0}")]
    CloseFailed(String),

    /// A data source could not hand out a connection
    #[error("Data source error: {0}")]
    DataSource(String),
}

/// Errors that can occur in registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The registration was already withdrawn
    #[error("Service {0} is already unregistered")]
    AlreadyUnregistered(ServiceId),

    /// The service is gone or has a different type than requested
    #[error("Service {0} is not available")]
    ServiceUnavailable(ServiceId),

    /// Capability names must not be blank
    #[error("Invalid capability name: {0:?}")]
    InvalidCapability(String),

    /// The registry has been shut down or dropped
    #[error("Registry is closed")]
    Closed,
}

/// Errors raised while parsing or building filters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// The filter string is not well formed
    #[error("Invalid filter syntax at {position} in {filter:?}: {reason}")]
    InvalidSyntax {
        filter: String,
        position: usize,
        reason: String,
    },

    /// A data source reference could not be turned into a filter
    #[error("Invalid data source reference {reference:?} for unit {unit}")]
    InvalidDataSource { reference: String, unit: String },
}

impl From<String> for ProviderError {
    fn from(msg: String) -> Self {
        ProviderError::CreationFailed(msg)
    }
}

impl From<&str> for ProviderError {
    fn from(msg: &str) -> Self {
        ProviderError::CreationFailed(msg.to_string())
    }
}

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Result type alias for filter operations.
pub type FilterResult<T> = Result<T, FilterError>;

/// Result type alias for general tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Result of a best-effort step.
///
/// Best-effort steps never fail. When something went wrong along the way the
/// fault is kept as a diagnostic so callers can still inspect it.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct Outcome {
    diagnostic: Option<TrackerError>,
}

impl Outcome {
    /// A step that completed without faults.
    pub fn clean() -> Self {
        Self { diagnostic: None }
    }

    /// A step that completed but swallowed a fault.
    pub fn degraded(err: impl Into<TrackerError>) -> Self {
        Self {
            diagnostic: Some(err.into()),
        }
    }

    /// Returns true if no fault was swallowed.
    pub fn is_clean(&self) -> bool {
        self.diagnostic.is_none()
    }

    /// The swallowed fault, if any.
    pub fn diagnostic(&self) -> Option<&TrackerError> {
        self.diagnostic.as_ref()
    }

    /// Consume the outcome, returning the swallowed fault.
    pub fn into_diagnostic(self) -> Option<TrackerError> {
        self.diagnostic
    }
}
