//! Connection lifecycle management trait.

use std::{fmt, io, marker::PhantomData};

use crate::error::find_source;

/// A trait which provides connection-specific functionality to the pool.
///
/// The pool never looks inside a connection. All it needs is a way to create one, a way to close
/// one, and a way to tell whether an error raised while using a connection means that the
/// connection can no longer be trusted.
pub trait ManageConnection: Send + Sync + 'static {
    /// Type of connection handed out by the pool.
    type Connection: Send + Sync + 'static;
    /// Error type returned when creating a connection.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create a new connection.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the connection could not be established. The error is propagated to the
    /// caller trying to acquire a connection.
    fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Close a connection which is being removed from the pool.
    ///
    /// # Errors
    ///
    /// Errors are logged by the pool and otherwise ignored.
    fn close(&self, _conn: &Self::Connection) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Decide whether an error raised while using a connection is fatal to that connection.
    ///
    /// Fatal errors cause the connection to be closed and replaced when it is released. The
    /// default treats any [`io::Error`] found in the source chain as fatal.
    fn is_fatal(&self, err: &(dyn std::error::Error + 'static)) -> bool {
        find_source::<io::Error>(err).is_some()
    }
}

/// Connection manager built from a plain factory closure.
///
/// Closing is a no-op, and fatal error classification uses the default rules of
/// [`ManageConnection::is_fatal`].
pub struct FnManager<F, C, E> {
    factory: F,
    _types: PhantomData<fn() -> (C, E)>,
}

impl<F, C, E> FnManager<F, C, E>
where
    F: Fn() -> Result<C, E>,
{
    /// Wrap connection factory.
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            _types: PhantomData,
        }
    }
}

impl<F, C, E> fmt::Debug for FnManager<F, C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnManager").finish_non_exhaustive()
    }
}

impl<F, C, E> ManageConnection for FnManager<F, C, E>
where
    F: Fn() -> Result<C, E> + Send + Sync + 'static,
    C: Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Connection = C;
    type Error = E;

    fn connect(&self) -> Result<C, E> {
        (self.factory)()
    }
}
