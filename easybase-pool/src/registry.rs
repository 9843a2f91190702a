//! Bounded storage of pooled connections.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::{error::Error, manage::ManageConnection, metrics::PoolState};

/// Fixed-capacity connection registry.
///
/// Connections are created lazily, up to `max_size` of them. Idle connections are handed out
/// most-recently-used first. Waiters are parked on a single condition variable and woken one at
/// a time, in the order the lock implementation queues them.
pub(crate) struct Registry<M: ManageConnection> {
    /// Connection factory and classifier.
    manager: M,
    /// Hard limit on connections alive at the same time.
    max_size: usize,
    /// Shared accounting.
    state: Mutex<RegistryState<M::Connection>>,
    /// Signalled whenever a connection or a free slot becomes available.
    available: Condvar,
}

struct RegistryState<C> {
    /// Idle connections, most recently used last.
    idle: Vec<Arc<C>>,
    /// Connections created and not yet closed, plus slots reserved for connections being created.
    size: usize,
    /// Callers parked on the condition variable.
    waiting: usize,
    /// Set once the pool is closed.
    closed: bool,
}

impl<M: ManageConnection> Registry<M> {
    pub(crate) fn new(manager: M, max_size: usize) -> Self {
        Self {
            manager,
            max_size,
            state: Mutex::new(RegistryState {
                idle: Vec::with_capacity(max_size),
                size: 0,
                waiting: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub(crate) fn manager(&self) -> &M {
        &self.manager
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    /// Take a connection, creating one if there is room, or waiting for one to be given back.
    ///
    /// `None` timeout waits indefinitely. Zero timeout never waits.
    ///
    /// A waiter whose deadline expires looks at the idle stack and the free slot count once more
    /// before giving up, so a connection given back at the very same moment is taken rather
    /// than left idle.
    pub(crate) fn take(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Arc<M::Connection>, Error<M::Error>> {
        // Deadlines too far in the future to represent are the same as no deadline at all.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::Closed);
            }
            if let Some(conn) = state.idle.pop() {
                trace!("reusing idle connection");
                return Ok(conn);
            }
            if state.size < self.max_size {
                state.size += 1;
                drop(state);
                return self.create();
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    return Err(Error::NoConnectionsAvailable);
                }
                Some(deadline) => {
                    state.waiting += 1;
                    let _ = self.available.wait_until(&mut state, deadline);
                    state.waiting -= 1;
                }
                None => {
                    state.waiting += 1;
                    self.available.wait(&mut state);
                    state.waiting -= 1;
                }
            }
        }
    }

    /// Return a connection for other callers to use.
    ///
    /// Connections given back to a closed registry are closed instead.
    pub(crate) fn give_back(&self, conn: Arc<M::Connection>) {
        let mut state = self.state.lock();
        if state.closed {
            state.size = state.size.saturating_sub(1);
            drop(state);
            self.close_conn(&conn);
            return;
        }
        state.idle.push(conn);
        drop(state);
        self.available.notify_one();
    }

    /// Close a broken connection and put a fresh one in its slot.
    ///
    /// The slot stays reserved for the whole operation. If the replacement cannot be created,
    /// the slot is released so that a later caller can retry creation.
    pub(crate) fn replace(&self, broken: Arc<M::Connection>) -> Result<(), Error<M::Error>> {
        let slot = ReservedSlot::new(self);
        self.close_conn(&broken);
        drop(broken);
        let closed = self.state.lock().closed;
        if closed {
            return Ok(());
        }
        match self.manager.connect() {
            Ok(conn) => {
                debug!("created replacement connection");
                slot.fill();
                self.give_back(Arc::new(conn));
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "unable to create replacement connection");
                Err(Error::Connection(err))
            }
        }
    }

    /// Create connections until the registry is full.
    pub(crate) fn prefill(&self) -> Result<(), Error<M::Error>> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed || state.size >= self.max_size {
                    return Ok(());
                }
                state.size += 1;
            }
            let conn = self.create()?;
            self.give_back(conn);
        }
    }

    /// Close all idle connections, and refuse to hand out any more.
    ///
    /// Returns number of connections closed.
    pub(crate) fn close(&self) -> usize {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.size = state.size.saturating_sub(idle.len());
            idle
        };
        self.available.notify_all();
        for conn in &idle {
            self.close_conn(conn);
        }
        idle.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn state(&self) -> PoolState {
        let state = self.state.lock();
        PoolState {
            max_size: self.max_size,
            size: state.size,
            idle: state.idle.len(),
            in_use: state.size.saturating_sub(state.idle.len()),
            waiting: state.waiting,
        }
    }

    /// Create a connection in a slot that was already reserved.
    ///
    /// The slot is released if creation fails or panics.
    fn create(&self) -> Result<Arc<M::Connection>, Error<M::Error>> {
        let slot = ReservedSlot::new(self);
        match self.manager.connect() {
            Ok(conn) => {
                debug!("created new connection");
                slot.fill();
                Ok(Arc::new(conn))
            }
            Err(err) => {
                debug!(error = %err, "unable to create connection");
                Err(Error::Connection(err))
            }
        }
    }

    /// Release a reserved slot which holds no connection.
    fn forget_slot(&self) {
        let mut state = self.state.lock();
        state.size = state.size.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn close_conn(&self, conn: &M::Connection) {
        if let Err(err) = self.manager.close(conn) {
            warn!(error = %err, "error while closing connection");
        }
    }
}

/// Slot counted in registry size, but not yet holding a connection.
///
/// Released on drop unless filled.
struct ReservedSlot<'r, M: ManageConnection> {
    registry: &'r Registry<M>,
    filled: bool,
}

impl<'r, M: ManageConnection> ReservedSlot<'r, M> {
    fn new(registry: &'r Registry<M>) -> Self {
        Self {
            registry,
            filled: false,
        }
    }

    fn fill(mut self) {
        self.filled = true;
    }
}

impl<M: ManageConnection> Drop for ReservedSlot<'_, M> {
    fn drop(&mut self) {
        if !self.filled {
            self.registry.forget_slot();
        }
    }
}

impl<M: ManageConnection> Drop for Registry<M> {
    fn drop(&mut self) {
        let idle = std::mem::take(&mut self.state.get_mut().idle);
        for conn in &idle {
            self.close_conn(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        panic::{catch_unwind, AssertUnwindSafe},
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use super::*;

    struct Counting {
        created: AtomicUsize,
        closed: AtomicUsize,
        fail: bool,
        panic: AtomicBool,
    }

    impl Counting {
        fn new(fail: bool) -> Self {
            Self {
                created: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                fail,
                panic: AtomicBool::new(false),
            }
        }
    }

    impl ManageConnection for Counting {
        type Connection = usize;
        type Error = io::Error;

        fn connect(&self) -> Result<usize, io::Error> {
            assert!(!self.panic.load(Ordering::SeqCst), "factory panicked");
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        fn close(&self, _conn: &usize) -> Result<(), io::Error> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn creates_lazily_up_to_capacity() {
        let registry = Registry::new(Counting::new(false), 2);
        assert_eq!(registry.state().size, 0);
        let a = registry.take(None).unwrap();
        let b = registry.take(None).unwrap();
        assert_ne!(*a, *b);
        assert_eq!(registry.state().size, 2);
        assert!(matches!(
            registry.take(Some(Duration::ZERO)),
            Err(Error::NoConnectionsAvailable)
        ));
        assert_eq!(registry.manager().created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reuses_most_recently_used() {
        let registry = Registry::new(Counting::new(false), 3);
        let a = registry.take(None).unwrap();
        let b = registry.take(None).unwrap();
        let (a_id, b_id) = (*a, *b);
        registry.give_back(a);
        registry.give_back(b);
        assert_eq!(*registry.take(None).unwrap(), b_id);
        assert_eq!(*registry.take(None).unwrap(), a_id);
    }

    #[test]
    fn factory_failure_releases_slot() {
        let registry = Registry::new(Counting::new(true), 1);
        assert!(matches!(registry.take(None), Err(Error::Connection(_))));
        assert_eq!(registry.state().size, 0);
        assert!(matches!(registry.take(None), Err(Error::Connection(_))));
    }

    #[test]
    fn factory_panic_releases_slot() {
        let registry = Registry::new(Counting::new(false), 1);
        registry.manager().panic.store(true, Ordering::SeqCst);
        let res = catch_unwind(AssertUnwindSafe(|| registry.take(None)));
        assert!(res.is_err());
        assert_eq!(registry.state().size, 0);
        registry.manager().panic.store(false, Ordering::SeqCst);
        assert!(registry.take(Some(Duration::ZERO)).is_ok());
    }

    #[test]
    fn replacement_panic_releases_slot() {
        let registry = Registry::new(Counting::new(false), 1);
        let conn = registry.take(None).unwrap();
        registry.manager().panic.store(true, Ordering::SeqCst);
        let res = catch_unwind(AssertUnwindSafe(|| registry.replace(conn)));
        assert!(res.is_err());
        assert_eq!(registry.state().size, 0);
        assert_eq!(registry.manager().closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replace_keeps_size() {
        let registry = Registry::new(Counting::new(false), 1);
        let conn = registry.take(None).unwrap();
        let old = *conn;
        registry.replace(conn).unwrap();
        let state = registry.state();
        assert_eq!(state.size, 1);
        assert_eq!(state.idle, 1);
        assert_ne!(*registry.take(None).unwrap(), old);
        assert_eq!(registry.manager().closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prefill_fills_registry() {
        let registry = Registry::new(Counting::new(false), 4);
        registry.prefill().unwrap();
        let state = registry.state();
        assert_eq!(state.size, 4);
        assert_eq!(state.idle, 4);
        assert_eq!(state.in_use, 0);
    }

    #[test]
    fn close_closes_idle_and_late_returns() {
        let registry = Registry::new(Counting::new(false), 2);
        let held = registry.take(None).unwrap();
        let idle = registry.take(None).unwrap();
        registry.give_back(idle);
        assert_eq!(registry.close(), 1);
        assert!(registry.is_closed());
        assert!(matches!(registry.take(None), Err(Error::Closed)));
        registry.give_back(held);
        assert_eq!(registry.manager().closed.load(Ordering::SeqCst), 2);
        assert_eq!(registry.state().size, 0);
    }
}
