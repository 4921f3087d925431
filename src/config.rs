//! Configuration for registries and trackers.

/// Base trait for configuration types.
///
/// # Example
///
/// ```rust
/// use persistence_tracker::Config;
///
/// #[derive(Debug, Clone)]
/// struct PoolConfig {
///     max_connections: u32,
/// }
///
/// impl Config for PoolConfig {
///     fn name(&self) -> &str {
///         "pool"
///     }
///
///     fn validate(&self) -> Result<(), String> {
///         if self.max_connections == 0 {
///             return Err("max_connections must be greater than 0".to_string());
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Config: Send + Sync {
    /// Returns the configuration name/identifier.
    fn name(&self) -> &str {
        "default"
    }

    /// Returns whether verbose output is enabled.
    fn is_verbose(&self) -> bool {
        false
    }

    /// Returns whether debug mode is enabled.
    fn is_debug(&self) -> bool {
        false
    }

    /// Validates the configuration.
    ///
    /// Returns Ok(()) if valid, or an error message describing the issue.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Configuration of a [`ServiceRegistry`](crate::ServiceRegistry).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registry name, used in log output
    pub name: String,
    /// Buffer size of the channels behind `watch` streams
    pub event_buffer: usize,
    /// Log every dispatched event at debug level
    pub debug: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: "registry".to_string(),
            event_buffer: 100,
            debug: false,
        }
    }
}

impl RegistryConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the registry name used in logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the buffer size of `watch` streams.
    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    /// Enable debug mode.
    pub fn debug(mut self) -> Self {
        self.debug = true;
        self
    }
}

impl Config for RegistryConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_debug(&self) -> bool {
        self.debug
    }

    fn validate(&self) -> Result<(), String> {
        if self.event_buffer == 0 {
            return Err("event_buffer must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Configuration of a [`ProviderTracker`](crate::ProviderTracker).
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Tracker name, used in log output
    pub name: String,
    /// Build and discard a factory on arrival so the provider can register
    /// its class transformers early
    pub weaving_probe: bool,
    /// Log arrivals and departures at info level
    pub verbose: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            name: "provider-tracker".to_string(),
            weaving_probe: true,
            verbose: true,
        }
    }
}

impl TrackerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tracker name used in logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Skip the weaving probe for providers that do not need early registration.
    pub fn without_probe(mut self) -> Self {
        self.weaving_probe = false;
        self
    }

    /// Stop logging provider arrivals and departures.
    pub fn quiet(mut self) -> Self {
        self.verbose = false;
        self
    }
}

impl Config for TrackerConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_verbose(&self) -> bool {
        self.verbose
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("tracker name must not be blank".to_string());
        }
        Ok(())
    }
}
