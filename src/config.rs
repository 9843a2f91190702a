//! Client configuration structures.

use std::time::Duration;

use easybase_pool::{PoolBuilder, DEFAULT_MAX_SIZE};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    connection::ConnectionConfig,
    errors::ClientError,
    manager::{ConnectionManager, ConnectionPool},
};

/// Connection pool configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections.
    #[serde(default = "PoolConfig::default_size")]
    pub size: usize,
    /// Acquisition timeout. Wait indefinitely if not set.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "humantime_serde"
    )]
    pub timeout: Option<Duration>,
    /// Open all connections when the pool is created.
    #[serde(default)]
    pub prefill: bool,
    /// Pool name, used in metrics and traces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: Self::default_size(),
            timeout: None,
            prefill: false,
            label: None,
        }
    }
}

impl PoolConfig {
    /// Default value for [`Self::size`].
    #[must_use]
    #[inline]
    fn default_size() -> usize {
        DEFAULT_MAX_SIZE
    }

    /// Create pool builder with settings from this configuration.
    pub fn builder(&self) -> PoolBuilder {
        let builder = PoolBuilder::new()
            .max_size(self.size)
            .timeout(self.timeout)
            .prefill(self.prefill);
        match &self.label {
            Some(label) => builder.label(label.clone()),
            None => builder,
        }
    }
}

/// Root container for client configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ClientConfig {
    /// Gateway connection parameters.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Connection pool parameters.
    #[serde(default)]
    pub pool: PoolConfig,
}

impl ClientConfig {
    /// Create builder for client configuration.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Create connection pool using this configuration.
    ///
    /// # Errors
    ///
    /// Returns `Err` if connection parameters are invalid, pool size is zero, or prefill was
    /// requested and some connection could not be opened.
    pub fn build_pool(&self) -> Result<ConnectionPool, ClientError> {
        let manager = ConnectionManager::new(self.connection.clone())?;
        let pool = self.pool.builder().build(manager)?;
        info!(
            host = %self.connection.host,
            port = self.connection.port,
            size = self.pool.size,
            "connection pool created"
        );
        Ok(pool)
    }
}

/// Builder for client configuration.
#[must_use]
pub struct ClientConfigBuilder {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl ClientConfigBuilder {
    /// Alternative method to construct a client configuration builder.
    pub fn new() -> Self {
        Self {
            builder: config::Config::builder(),
        }
    }

    /// Try to build configuration object from preconfigured sources.
    ///
    /// This method will do all the I/O necessary to load the configuration.
    ///
    /// See [`config::builder::ConfigBuilder::build`].
    ///
    /// # Errors
    ///
    /// Returns `Err` if some configuration loading was unsuccessful.
    pub fn build(self) -> Result<ClientConfig, ClientError> {
        self.builder.build()?.try_deserialize().map_err(Into::into)
    }

    /// Add a custom object implementing [`Source`] trait as a source of client configuration.
    ///
    /// [`Source`]: config::Source
    pub fn with_source<T>(mut self, source: T) -> Self
    where
        T: config::Source + Send + Sync + 'static,
    {
        self.builder = self.builder.add_source(source);
        self
    }

    /// Add file as a source of client configuration.
    pub fn with_file(self, name: impl AsRef<str>) -> Self {
        self.with_source(config::File::with_name(name.as_ref()))
    }

    /// Add environment variables as a source of client configuration.
    ///
    /// Nested keys are separated with a double underscore, as in `PREFIX_CONNECTION__HOST`.
    pub fn with_env(self, prefix: impl AsRef<str>) -> Self {
        self.with_source(
            config::Environment::with_prefix(prefix.as_ref())
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use config::{File, FileFormat};

    use super::*;

    const YAML: &str = r#"
connection:
  host: gateway.local
  port: 9091
  timeout: 2s
  autoconnect: false
  table_prefix: app
pool:
  size: 3
  timeout: 250ms
  label: main
"#;

    #[test]
    fn defaults() {
        let config = ClientConfig::builder().build().unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.pool.size, DEFAULT_MAX_SIZE);
        assert!(config.pool.timeout.is_none());
    }

    #[test]
    fn load_yaml() {
        let config = ClientConfig::builder()
            .with_source(File::from_str(YAML, FileFormat::Yaml))
            .build()
            .unwrap();
        assert_eq!(config.connection.host, "gateway.local");
        assert_eq!(config.connection.port, 9091);
        assert_eq!(config.connection.timeout, Some(Duration::from_secs(2)));
        assert!(!config.connection.autoconnect);
        assert_eq!(config.connection.table_name("t"), "app_t");
        assert_eq!(config.pool.size, 3);
        assert_eq!(config.pool.timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.pool.label.as_deref(), Some("main"));
    }

    #[test]
    fn build_lazy_pool() {
        let config = ClientConfig::builder()
            .with_source(File::from_str(YAML, FileFormat::Yaml))
            .build()
            .unwrap();
        let pool = config.build_pool().unwrap();
        assert_eq!(pool.max_size(), 3);
        let conn = pool.get().unwrap();
        assert!(!conn.is_open());
        assert_eq!(conn.table_name("users"), "app_users");
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut config = ClientConfig::default();
        config.pool.size = 0;
        assert!(matches!(config.build_pool(), Err(ClientError::Pool(_))));
    }

    #[test]
    fn invalid_connection_is_rejected() {
        let mut config = ClientConfig::default();
        config.connection.host.clear();
        assert!(matches!(
            config.build_pool(),
            Err(ClientError::Connection(_))
        ));
    }
}
