//! Lifecycle notifications for scheduled operations.
//!
//! Every operation the [`Executor`](crate::Executor) schedules gets an
//! [`AsyncId`]. Observers implement [`AsyncHook`] and are told when an
//! operation is created, when one of its polls starts and ends, and when it is
//! torn down.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Identifier the executor assigns to one scheduled operation.
///
/// Ids are unique among live operations. Code that may not have an id carries
/// an `Option<AsyncId>`; there is no reserved "null" value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsyncId(u64);

impl AsyncId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AsyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Observer of operation lifecycle signals.
///
/// Signals are delivered synchronously on the executor thread, in the middle
/// of scheduling. Implementations must not panic.
pub trait AsyncHook {
    /// A new operation was created. `trigger` is the operation that was
    /// executing at the time, if any.
    fn created(&self, id: AsyncId, trigger: Option<AsyncId>) {
        let _ = (id, trigger);
    }

    /// The operation is about to execute.
    fn before(&self, id: AsyncId) {
        let _ = id;
    }

    /// The operation has finished its current execution window.
    fn after(&self, id: AsyncId) {
        let _ = id;
    }

    /// The operation is gone and its id will not be signalled again.
    fn destroyed(&self, id: AsyncId) {
        let _ = id;
    }
}

/// Handle returned by [`Executor::install_hook`](crate::Executor::install_hook).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HookId(u64);

type HookEntry = (HookId, Rc<dyn AsyncHook>);

/// The hooks installed on one executor.
///
/// The list is copy-on-write so dispatch can iterate a snapshot while a hook
/// installs or removes another.
pub(crate) struct HookSet {
    next: Cell<u64>,
    hooks: RefCell<Rc<[HookEntry]>>,
}

impl Default for HookSet {
    fn default() -> Self {
        Self {
            next: Cell::new(0),
            hooks: RefCell::new(Rc::from(Vec::new())),
        }
    }
}

impl HookSet {
    pub(crate) fn install(&self, hook: Rc<dyn AsyncHook>) -> HookId {
        let id = HookId(self.next.get());
        self.next.set(id.0 + 1);

        let mut hooks = self.hooks.borrow_mut();
        let mut updated: Vec<HookEntry> = hooks.iter().cloned().collect();
        updated.push((id, hook));
        *hooks = Rc::from(updated);
        id
    }

    pub(crate) fn remove(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.borrow_mut();
        if !hooks.iter().any(|(entry, _)| *entry == id) {
            return false;
        }
        let updated: Vec<HookEntry> = hooks
            .iter()
            .filter(|(entry, _)| *entry != id)
            .cloned()
            .collect();
        *hooks = Rc::from(updated);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.hooks.borrow().len()
    }

    fn snapshot(&self) -> Rc<[HookEntry]> {
        self.hooks.borrow().clone()
    }

    pub(crate) fn emit_created(&self, id: AsyncId, trigger: Option<AsyncId>) {
        tracing::trace!(%id, ?trigger, "created");
        for (_, hook) in self.snapshot().iter() {
            hook.created(id, trigger);
        }
    }

    pub(crate) fn emit_before(&self, id: AsyncId) {
        for (_, hook) in self.snapshot().iter() {
            hook.before(id);
        }
    }

    pub(crate) fn emit_after(&self, id: AsyncId) {
        for (_, hook) in self.snapshot().iter() {
            hook.after(id);
        }
    }

    pub(crate) fn emit_destroyed(&self, id: AsyncId) {
        tracing::trace!(%id, "destroyed");
        for (_, hook) in self.snapshot().iter() {
            hook.destroyed(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        created: Cell<usize>,
        destroyed: Cell<usize>,
    }

    impl AsyncHook for Counter {
        fn created(&self, _id: AsyncId, _trigger: Option<AsyncId>) {
            self.created.set(self.created.get() + 1);
        }

        fn destroyed(&self, _id: AsyncId) {
            self.destroyed.set(self.destroyed.get() + 1);
        }
    }

    #[test]
    fn test_install_and_remove() {
        let set = HookSet::default();
        let counter = Rc::new(Counter::default());
        let id = set.install(counter.clone());
        assert_eq!(set.len(), 1);

        set.emit_created(AsyncId::new(1), None);
        set.emit_before(AsyncId::new(1));
        set.emit_destroyed(AsyncId::new(1));
        assert_eq!(counter.created.get(), 1);
        assert_eq!(counter.destroyed.get(), 1);

        assert!(set.remove(id));
        assert!(!set.remove(id));
        set.emit_created(AsyncId::new(2), None);
        assert_eq!(counter.created.get(), 1);
    }

    #[test]
    fn test_hook_may_remove_itself_during_dispatch() {
        struct SelfRemoving {
            set: Rc<HookSet>,
            id: Cell<Option<HookId>>,
            calls: Cell<usize>,
        }

        impl AsyncHook for SelfRemoving {
            fn before(&self, _id: AsyncId) {
                self.calls.set(self.calls.get() + 1);
                if let Some(id) = self.id.take() {
                    self.set.remove(id);
                }
            }
        }

        let set = Rc::new(HookSet::default());
        let hook = Rc::new(SelfRemoving {
            set: set.clone(),
            id: Cell::new(None),
            calls: Cell::new(0),
        });
        hook.id.set(Some(set.install(hook.clone())));

        set.emit_before(AsyncId::new(7));
        set.emit_before(AsyncId::new(7));
        assert_eq!(hook.calls.get(), 1);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_async_id_display() {
        assert_eq!(AsyncId::new(42).to_string(), "#42");
        assert_eq!(AsyncId::new(0).get(), 0);
    }
}
