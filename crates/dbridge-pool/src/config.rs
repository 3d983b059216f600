//! Pool configuration.

use std::fmt;
use std::time::Duration;

use crate::error::Error;
use crate::log::LogSink;

/// Configuration for the connection pool.
///
/// Adapter-specific options are not part of this struct; they are the opaque
/// options value handed to [`Pool::new`](crate::Pool::new) and passed through
/// to every adapter callback unchanged.
#[derive(Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Number of connections the pool maintains.
    ///
    /// Defaults to 1; size the pool explicitly for concurrent workloads.
    pub pool_size: u32,

    /// Time a checkout waits for a connection before failing.
    pub checkout_timeout: Duration,

    /// Sink invoked with one [`LogEntry`](crate::LogEntry) per logical
    /// operation. `None` disables per-operation records (tracing events are
    /// emitted regardless).
    pub log: Option<LogSink>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            checkout_timeout: Duration::from_secs(5),
            log: None,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of connections the pool maintains.
    #[must_use]
    pub fn pool_size(mut self, count: u32) -> Self {
        self.pool_size = count;
        self
    }

    /// Set the checkout timeout.
    #[must_use]
    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    /// Set the per-operation log sink.
    #[must_use]
    pub fn log(mut self, sink: LogSink) -> Self {
        self.log = Some(sink);
        self
    }

    /// Validate the configuration.
    pub fn validate<E>(&self) -> Result<(), Error<E>> {
        if self.pool_size == 0 {
            return Err(Error::Configuration(
                "pool_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("pool_size", &self.pool_size)
            .field("checkout_timeout", &self.checkout_timeout)
            .field("log", &self.log.as_ref().map(|_| "<sink>"))
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.pool_size, 1);
        assert_eq!(config.checkout_timeout, Duration::from_secs(5));
        assert!(config.log.is_none());
    }

    #[test]
    fn test_config_builder_methods() {
        let config = PoolConfig::new()
            .pool_size(8)
            .checkout_timeout(Duration::from_secs(30))
            .log(Arc::new(|_entry| {}));

        assert_eq!(config.pool_size, 8);
        assert_eq!(config.checkout_timeout, Duration::from_secs(30));
        assert!(config.log.is_some());
    }

    #[test]
    fn test_config_validation_zero_pool_size() {
        let config = PoolConfig::new().pool_size(0);
        assert!(config.validate::<std::io::Error>().is_err());
    }

    #[test]
    fn test_debug_does_not_render_sink() {
        let config = PoolConfig::new().log(Arc::new(|_entry| {}));
        let rendered = format!("{config:?}");
        assert!(rendered.contains("<sink>"));
    }
}
