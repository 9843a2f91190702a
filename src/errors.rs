//! Error types.

use std::{io, net::SocketAddr};

use thiserror::Error;

/// Error raised by a [`Connection`](crate::Connection).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Connection parameters are unusable.
    #[error("invalid connection configuration: {0}")]
    InvalidConfig(String),
    /// Host name could not be resolved.
    #[error("unable to resolve {host}: {source}")]
    Resolve {
        /// Host name.
        host: String,
        /// Resolver error.
        source: io::Error,
    },
    /// Host name resolved to no addresses at all.
    #[error("no addresses found for {0}")]
    NoAddresses(String),
    /// TCP connection could not be established.
    #[error("unable to connect to {addr}: {source}")]
    Connect {
        /// Remote address.
        addr: SocketAddr,
        /// Socket error.
        source: io::Error,
    },
    /// Error while talking to the remote end.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
    /// Transport was closed.
    #[error("transport is closed")]
    Closed,
    /// Remote end reported an application-level error, such as a missing table or an illegal
    /// argument. The connection itself is still healthy.
    #[error("remote application error: {0}")]
    Application(String),
}

impl ConnectionError {
    /// Generate new [`ConnectionError::Application`] error.
    pub fn application(message: impl ToString) -> Self {
        Self::Application(message.to_string())
    }

    /// Generate new [`ConnectionError::InvalidConfig`] error.
    pub(crate) fn invalid_config(message: impl ToString) -> Self {
        Self::InvalidConfig(message.to_string())
    }

    /// Whether the connection which raised this error can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Application(_) | Self::InvalidConfig(_))
    }
}

/// Top-level client error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Configuration loading error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] easybase_pool::Error<ConnectionError>),
    /// Connection error.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}
