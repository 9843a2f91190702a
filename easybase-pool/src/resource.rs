//! Scoped connection handle.

use std::{
    fmt,
    marker::PhantomData,
    ops::Deref,
    sync::Arc,
    thread::{self, ThreadId},
    time::Instant,
};

use tracing::{error, warn};

use crate::{error::Error, manage::ManageConnection, pool::SharedPool};

/// Connection checked out of a [`Pool`](crate::Pool).
///
/// The connection is released when the handle is dropped, or explicitly with
/// [`PooledConnection::release`]. Nested handles obtained on the same thread share one
/// connection, and only the release of the outermost one gives it back to the pool.
///
/// If a handle is dropped while the thread is panicking, the connection is considered broken and
/// is replaced.
///
/// Handles are bound to the thread which acquired them and are neither [`Send`] nor [`Sync`].
pub struct PooledConnection<M: ManageConnection> {
    /// Originating pool.
    pool: Arc<SharedPool<M>>,
    /// Thread owning the checkout record.
    context: ThreadId,
    /// Shared connection.
    conn: Arc<M::Connection>,
    /// Retrieval time.
    time: Instant,
    /// Set once released explicitly.
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl<M: ManageConnection> PooledConnection<M> {
    pub(crate) fn new(
        pool: Arc<SharedPool<M>>,
        context: ThreadId,
        conn: Arc<M::Connection>,
    ) -> Self {
        Self {
            pool,
            context,
            conn,
            // This is different from time used in wait_time metric.
            time: Instant::now(),
            released: false,
            _not_send: PhantomData,
        }
    }

    /// Report an error raised while using this connection.
    ///
    /// If the pool's manager classifies the error as fatal, the connection is marked as broken
    /// and will be replaced when the outermost handle is released. Returns the classification.
    pub fn report(&self, err: &(dyn std::error::Error + 'static)) -> bool {
        let fatal = self.pool.registry.manager().is_fatal(err);
        if fatal {
            warn!(error = %err, "connection-fatal error, connection will be replaced");
            self.mark_broken();
        }
        fatal
    }

    /// Unconditionally mark connection as broken.
    pub fn mark_broken(&self) {
        self.pool.checkouts.mark_broken(self.context);
    }

    /// Whether the connection was marked as broken in any of the nested scopes.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.pool.checkouts.is_broken(self.context)
    }

    /// Number of live handles to this connection held by the current thread.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.pool.checkouts.depth(self.context)
    }

    /// Returns `true` if both handles point to the same connection.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.conn, &other.conn)
    }

    /// Release the handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if this was the outermost handle, the connection was
    /// broken, and its replacement could not be created. The pool slot is freed in that case.
    pub fn release(mut self) -> Result<(), Error<M::Error>> {
        self.released = true;
        self.pool.release(self.context, self.time)
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<M: ManageConnection> AsRef<M::Connection> for PooledConnection<M> {
    fn as_ref(&self) -> &M::Connection {
        &self.conn
    }
}

impl<M> fmt::Debug for PooledConnection<M>
where
    M: ManageConnection,
    M::Connection: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if thread::panicking() {
            self.mark_broken();
        }
        if let Err(err) = self.pool.release(self.context, self.time) {
            error!(error = %err, "unable to replace broken connection");
        }
    }
}
