//! Per-thread checkout records, used for re-entrant acquisition.

use std::{
    sync::Arc,
    thread::{self, ThreadId},
};

use dashmap::{mapref::entry::Entry, DashMap};

/// Connection held by a single thread.
pub(crate) struct Checkout<C> {
    /// Connection shared by every nested scope of the owning thread.
    pub(crate) conn: Arc<C>,
    /// Number of live scopes. Never zero while the record exists.
    pub(crate) depth: usize,
    /// Set when any scope hit a connection-fatal error.
    pub(crate) broken: bool,
}

/// Checkout records keyed by owning thread.
pub(crate) struct Checkouts<C> {
    records: DashMap<ThreadId, Checkout<C>>,
}

/// Identifier of the calling execution context.
pub(crate) fn current_context() -> ThreadId {
    thread::current().id()
}

impl<C> Checkouts<C> {
    pub(crate) fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Enter one more nested scope, if the thread already holds a connection.
    pub(crate) fn reenter(&self, ctx: ThreadId) -> Option<Arc<C>> {
        let mut record = self.records.get_mut(&ctx)?;
        record.depth += 1;
        Some(Arc::clone(&record.conn))
    }

    /// Start a new record for a freshly acquired connection.
    pub(crate) fn enter(&self, ctx: ThreadId, conn: Arc<C>) {
        self.records.insert(
            ctx,
            Checkout {
                conn,
                depth: 1,
                broken: false,
            },
        );
    }

    /// Leave one scope.
    ///
    /// Returns the record once the outermost scope is left.
    pub(crate) fn leave(&self, ctx: ThreadId) -> Option<Checkout<C>> {
        match self.records.entry(ctx) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.depth = record.depth.saturating_sub(1);
                if record.depth > 0 {
                    None
                } else {
                    Some(entry.remove())
                }
            }
            Entry::Vacant(_) => None,
        }
    }

    pub(crate) fn mark_broken(&self, ctx: ThreadId) {
        if let Some(mut record) = self.records.get_mut(&ctx) {
            record.broken = true;
        }
    }

    pub(crate) fn is_broken(&self, ctx: ThreadId) -> bool {
        self.records.get(&ctx).is_some_and(|record| record.broken)
    }

    pub(crate) fn depth(&self, ctx: ThreadId) -> usize {
        self.records.get(&ctx).map_or(0, |record| record.depth)
    }

    /// Number of threads currently holding a connection.
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_scopes_share_record() {
        let checkouts = Checkouts::new();
        let ctx = current_context();
        assert!(checkouts.reenter(ctx).is_none());
        let conn = Arc::new(7_u32);
        checkouts.enter(ctx, Arc::clone(&conn));
        let again = checkouts.reenter(ctx).unwrap();
        assert!(Arc::ptr_eq(&conn, &again));
        assert_eq!(checkouts.depth(ctx), 2);
        assert!(checkouts.leave(ctx).is_none());
        assert_eq!(checkouts.depth(ctx), 1);
        let record = checkouts.leave(ctx).unwrap();
        assert!(Arc::ptr_eq(&conn, &record.conn));
        assert_eq!(checkouts.depth(ctx), 0);
        assert_eq!(checkouts.len(), 0);
    }

    #[test]
    fn broken_flag_survives_nesting() {
        let checkouts = Checkouts::new();
        let ctx = current_context();
        checkouts.enter(ctx, Arc::new(()));
        checkouts.reenter(ctx).unwrap();
        checkouts.mark_broken(ctx);
        assert!(checkouts.leave(ctx).is_none());
        assert!(checkouts.is_broken(ctx));
        assert!(checkouts.leave(ctx).unwrap().broken);
    }

    #[test]
    fn threads_are_independent() {
        let checkouts = Arc::new(Checkouts::new());
        checkouts.enter(current_context(), Arc::new(1_u8));
        let other = Arc::clone(&checkouts);
        thread::spawn(move || {
            let ctx = current_context();
            assert!(other.reenter(ctx).is_none());
            assert!(other.leave(ctx).is_none());
        })
        .join()
        .unwrap();
        assert_eq!(checkouts.depth(current_context()), 1);
    }
}
