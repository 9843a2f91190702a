use std::{
    borrow::Cow,
    fmt,
    ops::Deref,
    sync::Arc,
    thread::ThreadId,
    time::{Duration, Instant},
};

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tracing::{debug, debug_span, info, trace, warn};

use crate::{
    checkout::{current_context, Checkouts},
    error::Error,
    manage::{FnManager, ManageConnection},
    metrics::{pool_kv, Metrics, PoolState, POOL_METRICS},
    registry::Registry,
    resource::PooledConnection,
};

/// Default maximum number of connections in a pool.
pub const DEFAULT_MAX_SIZE: usize = 10;

/// Interval between automatic gatherings of pool state metrics.
const PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// Builder for [`Pool`].
#[derive(Clone, Debug)]
#[must_use]
pub struct PoolBuilder {
    max_size: usize,
    timeout: Option<Duration>,
    prefill: bool,
    label: Option<Cow<'static, str>>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            timeout: None,
            prefill: false,
            label: None,
        }
    }
}

impl PoolBuilder {
    /// Create new pool builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of connections alive at the same time. Must be at least 1.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Acquisition timeout used by [`Pool::get`].
    ///
    /// `None`, the default, waits indefinitely.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create all connections up front when building the pool.
    pub fn prefill(mut self, prefill: bool) -> Self {
        self.prefill = prefill;
        self
    }

    /// Pool name, used in metrics and traces.
    pub fn label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Build the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the maximum size is zero, or
    /// [`Error::Connection`] if prefill was requested and a connection could not be created.
    pub fn build<M: ManageConnection>(self, manager: M) -> Result<Pool<M>, Error<M::Error>> {
        if self.max_size < 1 {
            return Err(Error::invalid_config("pool size must be at least 1"));
        }
        let label = pool_kv(self.label);
        let shared = SharedPool {
            registry: Registry::new(manager, self.max_size),
            checkouts: Checkouts::new(),
            timeout: self.timeout,
            metrics: POOL_METRICS.deref().clone(),
            label,
            last_gathered_at: Mutex::new(Instant::now()),
        };
        if self.prefill {
            let _span = debug_span!("pool_prefill", size = self.max_size).entered();
            shared.registry.prefill()?;
        }
        shared
            .metrics
            .record_state(&shared.label, &shared.registry.state());
        Ok(Pool {
            shared: Arc::new(shared),
        })
    }
}

/// Bounded pool of connections shared between threads.
///
/// At most `max_size` connections exist at any time. A thread which already holds a connection
/// from this pool gets the very same connection back when acquiring again, without waiting.
/// Connections released after a connection-fatal error are closed and replaced with fresh ones.
///
/// Cloning a pool is cheap, clones share the same connections.
pub struct Pool<M: ManageConnection> {
    shared: Arc<SharedPool<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ManageConnection> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.label[0].value.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Create a pool of up to `max_size` connections, with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if `max_size` is zero.
    pub fn new(max_size: usize, manager: M) -> Result<Self, Error<M::Error>> {
        PoolBuilder::new().max_size(max_size).build(manager)
    }

    /// Acquire a connection, waiting no longer than the timeout configured for this pool.
    ///
    /// # Errors
    ///
    /// See [`Pool::connection`].
    pub fn get(&self) -> Result<PooledConnection<M>, Error<M::Error>> {
        self.connection(self.shared.timeout)
    }

    /// Acquire a connection only if one can be had without waiting.
    ///
    /// # Errors
    ///
    /// See [`Pool::connection`].
    pub fn try_get(&self) -> Result<PooledConnection<M>, Error<M::Error>> {
        self.connection(Some(Duration::ZERO))
    }

    /// Acquire a connection, waiting for a bounded time.
    ///
    /// # Errors
    ///
    /// See [`Pool::connection`].
    pub fn get_timeout(&self, timeout: Duration) -> Result<PooledConnection<M>, Error<M::Error>> {
        self.connection(Some(timeout))
    }

    /// Acquire a connection.
    ///
    /// If the current thread already holds a connection from this pool, that same connection is
    /// returned immediately. Otherwise an idle connection is taken, a new one is created if the
    /// pool is not full, or the call waits for one to be released. `None` timeout waits
    /// indefinitely, zero timeout does not wait at all.
    ///
    /// # Errors
    ///
    /// - [`Error::NoConnectionsAvailable`] if the timeout elapsed.
    /// - [`Error::Connection`] if a new connection could not be created.
    /// - [`Error::Closed`] if the pool was closed.
    pub fn connection(
        &self,
        timeout: Option<Duration>,
    ) -> Result<PooledConnection<M>, Error<M::Error>> {
        let ctx = current_context();
        if let Some(conn) = self.shared.checkouts.reenter(ctx) {
            trace!("re-entrant acquisition");
            return Ok(PooledConnection::new(self.shared.clone(), ctx, conn));
        }
        let now = Instant::now();
        let span = debug_span!(
            "pool_acquire",
            name = self.shared.label[0].value.as_str().as_ref(),
            timeout = ?timeout
        )
        .entered();
        let taken = self.shared.registry.take(timeout);
        drop(span);
        let conn = match taken {
            Ok(conn) => conn,
            Err(err) => {
                if err.is_timeout() {
                    debug!(elapsed = ?now.elapsed(), "timed out waiting for connection");
                    self.shared.metrics.timeouts.add(1, &self.shared.label);
                }
                return Err(err);
            }
        };
        self.shared.checkouts.enter(ctx, Arc::clone(&conn));
        self.shared.measure_acquire(now);
        Ok(PooledConnection::new(self.shared.clone(), ctx, conn))
    }

    /// Run a closure with a connection, releasing it afterwards.
    ///
    /// If the closure returns an error which the manager considers fatal, the connection is
    /// replaced with a fresh one on release. A panicking closure is handled the same way.
    ///
    /// # Errors
    ///
    /// Returns the closure's own error, acquisition errors, or the error from creating a
    /// replacement connection if the closure itself succeeded.
    pub fn with_connection<T, E, F>(&self, timeout: Option<Duration>, f: F) -> Result<T, E>
    where
        F: FnOnce(&M::Connection) -> Result<T, E>,
        E: std::error::Error + From<Error<M::Error>> + 'static,
    {
        let conn = self.connection(timeout)?;
        let result = f(&*conn);
        if let Err(err) = &result {
            conn.report(err);
        }
        match (result, conn.release()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err.into()),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(release_err)) => {
                warn!(error = %release_err, "unable to replace broken connection");
                Err(err)
            }
        }
    }

    /// Close the pool.
    ///
    /// Idle connections are closed right away. Connections currently in use are closed when
    /// released. Any further acquisition fails with [`Error::Closed`].
    pub fn close(&self) {
        let closed = self.shared.registry.close();
        info!(
            name = self.shared.label[0].value.as_str().as_ref(),
            closed, "connection pool closed"
        );
    }

    /// Whether [`Pool::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.registry.is_closed()
    }

    /// Get current pool accounting.
    #[must_use]
    pub fn state(&self) -> PoolState {
        self.shared.registry.state()
    }

    /// Maximum number of connections.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.shared.registry.max_size()
    }

    /// Number of threads currently holding a connection from this pool.
    #[must_use]
    pub fn checked_out(&self) -> usize {
        self.shared.checkouts.len()
    }

    /// Connection manager used by this pool.
    #[must_use]
    pub fn manager(&self) -> &M {
        self.shared.registry.manager()
    }

    /// Record pool state metrics right now.
    ///
    /// Normally you wouldn't need to call this directly, as metrics collection occurs
    /// automatically as you use the pool.
    pub fn update_metrics(&self) {
        *self.shared.last_gathered_at.lock() = Instant::now();
        self.shared
            .metrics
            .record_state(&self.shared.label, &self.shared.registry.state());
    }
}

impl<F, C, E> Pool<FnManager<F, C, E>>
where
    F: Fn() -> Result<C, E> + Send + Sync + 'static,
    C: Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Create a pool of up to `max_size` connections produced by a factory closure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if `max_size` is zero.
    pub fn from_fn(max_size: usize, factory: F) -> Result<Self, Error<E>> {
        Self::new(max_size, FnManager::new(factory))
    }
}

/// State shared by a pool and all handles checked out of it.
pub(crate) struct SharedPool<M: ManageConnection> {
    pub(crate) registry: Registry<M>,
    pub(crate) checkouts: Checkouts<M::Connection>,
    /// Default acquisition timeout.
    timeout: Option<Duration>,
    /// Linked metrics storage.
    metrics: Arc<Metrics>,
    /// Pool label.
    label: [KeyValue; 1],
    /// Time of last gathering of common pool metrics.
    last_gathered_at: Mutex<Instant>,
}

impl<M: ManageConnection> SharedPool<M> {
    /// Leave one scope of the given thread, returning or replacing the connection when the
    /// outermost scope is left.
    pub(crate) fn release(
        &self,
        ctx: ThreadId,
        acquired_at: Instant,
    ) -> Result<(), Error<M::Error>> {
        let Some(record) = self.checkouts.leave(ctx) else {
            return Ok(());
        };
        // Record time spent outside the pool.
        self.metrics
            .use_time
            .record(acquired_at.elapsed().as_secs_f64(), &self.label);
        if record.broken {
            warn!("replacing broken connection");
            self.metrics.replaced.add(1, &self.label);
            self.registry.replace(record.conn)
        } else {
            self.registry.give_back(record.conn);
            Ok(())
        }
    }

    /// Internal method to record metrics after connection acquisition.
    #[inline]
    fn measure_acquire(&self, before: Instant) {
        self.metrics
            .wait_time
            .record(before.elapsed().as_secs_f64(), &self.label);
        let mut last_gathered_at = self.last_gathered_at.lock();
        if last_gathered_at.elapsed() > PROBE_INTERVAL {
            *last_gathered_at = Instant::now();
            drop(last_gathered_at);
            self.metrics.record_state(&self.label, &self.registry.state());
        }
    }
}
