//! Error types and error support code.

/// Error type used by the connection pool.
///
/// `E` is the error type of the [`ManageConnection`](crate::ManageConnection) implementation
/// backing the pool.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error<E> {
    /// Pool was constructed with unusable parameters.
    #[error("invalid pool configuration: {0}")]
    InvalidConfiguration(String),
    /// No connection became available before the acquisition timeout elapsed.
    #[error("no connections available")]
    NoConnectionsAvailable,
    /// Pool was closed.
    #[error("pool is closed")]
    Closed,
    /// Manager failed to create a new connection.
    #[error("unable to create connection: {0}")]
    Connection(#[source] E),
}

impl<E> Error<E> {
    /// Returns `true` if this is an acquisition timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::NoConnectionsAvailable)
    }

    /// Generate new [`Error::InvalidConfiguration`] error.
    pub(crate) fn invalid_config(reason: impl ToString) -> Self {
        Self::InvalidConfiguration(reason.to_string())
    }
}

/// Walk the source chain of an error, looking for an error of type `T`.
pub fn find_source<'e, T>(err: &'e (dyn std::error::Error + 'static)) -> Option<&'e T>
where
    T: std::error::Error + 'static,
{
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}
