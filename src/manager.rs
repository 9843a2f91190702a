//! Connection pool plumbing.

use std::{error::Error as StdError, io, sync::Arc};

use easybase_pool::{error::find_source, ManageConnection, Pool};
use tracing::debug;

use crate::{
    connection::{Connection, ConnectionConfig},
    errors::ConnectionError,
};

/// Pool of gateway connections.
pub type ConnectionPool = Pool<ConnectionManager>;

/// Creates and closes gateway connections on behalf of a [`ConnectionPool`].
#[derive(Clone, Debug)]
pub struct ConnectionManager {
    config: Arc<ConnectionConfig>,
}

impl ConnectionManager {
    /// Create new connection manager.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidConfig`] if connection parameters are unusable.
    pub fn new(config: ConnectionConfig) -> Result<Self, ConnectionError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Connection parameters shared by all connections.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

impl ManageConnection for ConnectionManager {
    type Connection = Connection;
    type Error = ConnectionError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        Connection::with_shared_config(Arc::clone(&self.config))
    }

    fn close(&self, conn: &Self::Connection) -> Result<(), Self::Error> {
        conn.close()
    }

    fn is_fatal(&self, err: &(dyn StdError + 'static)) -> bool {
        if let Some(err) = find_source::<ConnectionError>(err) {
            return err.is_fatal();
        }
        let fatal = find_source::<io::Error>(err).is_some();
        if !fatal {
            debug!(error = %err, "treating unknown error as non-fatal");
        }
        fatal
    }
}
